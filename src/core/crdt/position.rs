// src/core/crdt/position.rs

//! Fractional position keys for list ordering.
//!
//! A position is a non-empty string of bytes in the printable ASCII range,
//! compared by plain byte order. `between` always produces a key strictly
//! inside the given bounds, so any two adjacent items admit an unbounded
//! number of insertions between them.

/// Exclusive lower bound digit. Never produced as a trailing digit.
const MIN: u8 = 0x20;
/// Exclusive upper bound digit. Never appears in a position.
const MAX: u8 = 0x7F;

/// Position for the first element of an empty list.
pub fn first() -> String {
    between(None, None)
}

/// Position strictly after `pos` (appending at the end).
pub fn after(pos: &str) -> String {
    between(Some(pos), None)
}

/// Position strictly before `pos` (prepending at the start).
pub fn before(pos: &str) -> String {
    between(None, Some(pos))
}

/// Produces a position strictly between `lo` and `hi`, where `None` means
/// the corresponding open end of the key space. Requires `lo < hi` when both
/// are given; a violated precondition falls back to ignoring `hi`.
pub fn between(lo: Option<&str>, hi: Option<&str>) -> String {
    let lo_bytes = lo.unwrap_or("").as_bytes();
    let mut hi_bytes = hi.unwrap_or("").as_bytes();
    if !lo_bytes.is_empty() && !hi_bytes.is_empty() && lo_bytes >= hi_bytes {
        debug_assert!(false, "position bounds out of order");
        hi_bytes = &[];
    }

    let mut out: Vec<u8> = Vec::with_capacity(lo_bytes.len() + 1);
    let mut i = 0;
    loop {
        let dl = *lo_bytes.get(i).unwrap_or(&MIN);
        let dh = *hi_bytes.get(i).unwrap_or(&MAX);
        if dl == dh {
            out.push(dl);
            i += 1;
            continue;
        }
        if dh - dl > 1 {
            out.push(dl + (dh - dl) / 2);
            break;
        }
        // Adjacent digits: settle below `hi` here, then bisect the low tail
        // against the open upper end.
        out.push(dl);
        i += 1;
        loop {
            let dl = *lo_bytes.get(i).unwrap_or(&MIN);
            if MAX - dl > 1 {
                out.push(dl + (MAX - dl) / 2);
                break;
            }
            out.push(dl);
            i += 1;
        }
        break;
    }
    String::from_utf8(out).expect("position digits are ASCII")
}
