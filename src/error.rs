use std::error::Error as StdError;
use std::fmt;

/// Errors surfaced by the document replica. None of these are recovered
/// internally. Refusals that are part of normal operation (a barrier blocking
/// an undo, a missing checkpoint) are reported as `None` results, not errors,
/// and leave the document unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Site id 0 is reserved for the document's boundary sentinels.
    ReservedSiteId,
    /// A splice was produced or applied out of per-site sequence order.
    /// Unreachable under correct use; indicates a bug in the caller or in
    /// the readiness gate.
    OutOfOrderOperation,
    /// A linear position lies beyond the document's visible extent.
    PositionOutOfRange,
    /// A tree lookup hit a hole. Indicates a broken internal invariant.
    SegmentNotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReservedSiteId => write!(f, "site id 0 is reserved"),
            Error::OutOfOrderOperation => {
                write!(f, "operation violates per-site sequence ordering")
            }
            Error::PositionOutOfRange => write!(f, "position is outside the document"),
            Error::SegmentNotFound => write!(f, "segment lookup failed"),
        }
    }
}

impl StdError for Error {}

pub type Result<T> = std::result::Result<T, Error>;
