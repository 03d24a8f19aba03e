use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Source of transaction timestamps. Grouping decisions compare these, so
/// tests install a manual clock to drive grouping deterministically.
pub trait Clock: fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// The default clock: wall-clock epoch milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}
