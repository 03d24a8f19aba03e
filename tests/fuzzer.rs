//! Randomized convergence tests: N replicas make random edits and undos,
//! exchange operations in random orders and random partial batches, and must
//! agree byte-for-byte afterwards. Every replica also drives a plain-string
//! mirror through the emitted text updates, so the linear-equivalence
//! guarantee is checked at each step along the way.

use rand::prelude::*;
use tandem::{Document, Operation, Point, TextUpdate};

fn random_str(len: usize, rng: &mut SmallRng) -> String {
    let mut str = String::new();
    let alphabet: Vec<char> = "abcdefghijklmnop_\n".chars().collect();
    for _ in 0..len {
        str.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    str
}

fn byte_index_for_point(text: &str, point: Point) -> usize {
    let mut row = 0;
    let mut column = 0;
    for (byte_index, c) in text.char_indices() {
        if row == point.row && column == point.column {
            return byte_index;
        }
        if c == '\n' {
            row += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    text.len()
}

fn point_for_char_index(text: &str, index: usize) -> Point {
    let mut row = 0;
    let mut column = 0;
    for c in text.chars().take(index) {
        if c == '\n' {
            row += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    Point::new(row, column)
}

/// Replays text updates onto the mirror, back-to-front, verifying the old
/// text each update claims to replace.
fn apply_updates(buffer: &mut String, updates: &[TextUpdate]) {
    for update in updates.iter().rev() {
        let start = byte_index_for_point(buffer, update.old_start);
        let end = byte_index_for_point(buffer, update.old_end);
        assert_eq!(&buffer[start..end], update.old_text.as_str());
        buffer.replace_range(start..end, &update.new_text);
    }
}

fn make_random_change(doc: &mut Document, mirror: &mut String, rng: &mut SmallRng) -> Vec<Operation> {
    let len = mirror.chars().count();
    let insert_weight = if len < 50 { 0.7 } else { 0.4 };
    if len == 0 || rng.gen_bool(insert_weight) {
        let position = point_for_char_index(mirror, rng.gen_range(0..=len));
        let content = random_str(rng.gen_range(1..4), rng);
        let op = doc.set_text_in_range(position, position, &content).unwrap();
        let byte = byte_index_for_point(mirror, position);
        mirror.insert_str(byte, &content);
        vec![op]
    } else {
        let start_index = rng.gen_range(0..len);
        let span = rng.gen_range(1..=usize::min(8, len - start_index));
        let start = point_for_char_index(mirror, start_index);
        let end = point_for_char_index(mirror, start_index + span);
        let op = doc.set_text_in_range(start, end, "").unwrap();
        let start_byte = byte_index_for_point(mirror, start);
        let end_byte = byte_index_for_point(mirror, end);
        mirror.replace_range(start_byte..end_byte, "");
        vec![op]
    }
}

fn make_random_undo_redo(
    doc: &mut Document,
    mirror: &mut String,
    rng: &mut SmallRng,
) -> Vec<Operation> {
    let result = if rng.gen_bool(0.5) { doc.undo().unwrap() } else { doc.redo().unwrap() };
    match result {
        Some(result) => {
            apply_updates(mirror, &result.text_updates);
            result.operations
        }
        None => Vec::new(),
    }
}

#[test]
fn random_single_site_edits_match_a_linear_mirror() {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut doc = Document::new(1).unwrap();
    let mut mirror = String::new();
    for _i in 0..500 {
        if rng.gen_bool(0.9) {
            make_random_change(&mut doc, &mut mirror, &mut rng);
        } else {
            make_random_undo_redo(&mut doc, &mut mirror, &mut rng);
        }
        assert_eq!(mirror, doc.get_text());
    }
}

#[test]
fn fuzz_concurrent_sites_converge() {
    for seed in 0..30u64 {
        let mut docs = vec![
            Document::new(1).unwrap(),
            Document::new(2).unwrap(),
            Document::new(3).unwrap(),
        ];
        let mut mirrors = vec![String::new(), String::new(), String::new()];
        let mut rng = SmallRng::seed_from_u64(seed);

        // Every operation any site ever broadcast, in production order.
        let mut log: Vec<Operation> = Vec::new();

        for _step in 0..40 {
            let i = rng.gen_range(0..docs.len());
            match rng.gen_range(0..10) {
                0..=6 => {
                    let ops = make_random_change(&mut docs[i], &mut mirrors[i], &mut rng);
                    log.extend(ops);
                }
                7 => {
                    let ops = make_random_undo_redo(&mut docs[i], &mut mirrors[i], &mut rng);
                    log.extend(ops);
                }
                _ => {
                    // Deliver a shuffled, possibly truncated slice of the
                    // log: duplicates are no-ops, missing dependencies park.
                    let mut ops = log.clone();
                    ops.shuffle(&mut rng);
                    ops.truncate(rng.gen_range(0..=ops.len()));
                    let update = docs[i].integrate_operations(ops).unwrap();
                    apply_updates(&mut mirrors[i], &update.text_updates);
                }
            }
            assert_eq!(mirrors[i], docs[i].get_text(), "seed {seed}");
        }

        // Full exchange, in a different order per site.
        for i in 0..docs.len() {
            let mut ops = log.clone();
            ops.shuffle(&mut rng);
            let update = docs[i].integrate_operations(ops).unwrap();
            apply_updates(&mut mirrors[i], &update.text_updates);
            assert_eq!(mirrors[i], docs[i].get_text(), "seed {seed}");
        }
        for i in 1..docs.len() {
            assert_eq!(docs[0].get_text(), docs[i].get_text(), "seed {seed}");
        }
    }
}

#[test]
fn integration_is_permutation_insensitive() {
    for seed in 0..20u64 {
        let mut rng = SmallRng::seed_from_u64(seed + 1000);
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let mut mirror_a = String::new();
        let mut mirror_b = String::new();
        let mut log: Vec<Operation> = Vec::new();

        for _step in 0..20 {
            if rng.gen_bool(0.5) {
                log.extend(make_random_change(&mut a, &mut mirror_a, &mut rng));
            } else {
                log.extend(make_random_change(&mut b, &mut mirror_b, &mut rng));
            }
            if rng.gen_bool(0.3) {
                let update = a.integrate_operations(log.clone()).unwrap();
                apply_updates(&mut mirror_a, &update.text_updates);
                let update = b.integrate_operations(log.clone()).unwrap();
                apply_updates(&mut mirror_b, &update.text_updates);
                assert_eq!(mirror_a, a.get_text());
                assert_eq!(mirror_b, b.get_text());
            }
        }

        let mut c = Document::new(3).unwrap();
        let mut d = Document::new(4).unwrap();
        let mut ops_c = log.clone();
        ops_c.shuffle(&mut rng);
        let mut ops_d = log.clone();
        ops_d.shuffle(&mut rng);
        c.integrate_operations(ops_c).unwrap();
        d.integrate_operations(ops_d).unwrap();
        assert_eq!(c.get_text(), d.get_text(), "seed {seed}");

        let update = a.integrate_operations(log.clone()).unwrap();
        apply_updates(&mut mirror_a, &update.text_updates);
        assert_eq!(mirror_a, a.get_text());
        assert_eq!(a.get_text(), c.get_text(), "seed {seed}");
    }
}
