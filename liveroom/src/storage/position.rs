//! Fractional-index position keys for LIST children.
//!
//! A position is a non-empty string over the printable ASCII range
//! `' '..='~'`, read as a base-95 fraction `0.d₁d₂d₃…` with `' '` as zero.
//! Positions never end in `' '`, so string order equals numeric order and
//! there is always room for another key between two distinct positions.

const MIN_CODE: u8 = b' ';
const MAX_CODE: u8 = b'~';
const BASE: u8 = MAX_CODE - MIN_CODE + 1;

/// Whether `pos` is a well-formed position.
pub fn is_valid(pos: &str) -> bool {
    !pos.is_empty()
        && pos.bytes().all(|b| (MIN_CODE..=MAX_CODE).contains(&b))
        && !pos.ends_with(MIN_CODE as char)
}

/// A position strictly between `before` and `after`.
///
/// `None` stands for the start (or end) of the list. Malformed or
/// out-of-order bounds fall back to a position after `before`.
pub fn between(before: Option<&str>, after: Option<&str>) -> String {
    let lo = before.filter(|p| is_valid(p)).map(digits).unwrap_or_default();
    let hi = after.filter(|p| is_valid(p)).map(digits);
    let ordered = match &hi {
        Some(hi) => lo < *hi,
        None => true,
    };
    let mid = if ordered {
        midpoint(&lo, hi.as_deref())
    } else {
        midpoint(&lo, None)
    };
    encode(&mid)
}

/// A position after `pos`.
pub fn after(pos: &str) -> String {
    between(Some(pos), None)
}

/// A position before `pos`.
pub fn before(pos: &str) -> String {
    between(None, Some(pos))
}

/// Position for the first item of an empty list.
pub fn first() -> String {
    between(None, None)
}

fn digits(pos: &str) -> Vec<u8> {
    pos.bytes().map(|b| b - MIN_CODE).collect()
}

fn encode(digits: &[u8]) -> String {
    digits.iter().map(|d| (d + MIN_CODE) as char).collect()
}

/// Digits strictly between `lo` and `hi` (`None` = 1.0).
/// Requires `lo < hi` and neither ending in a zero digit.
fn midpoint(lo: &[u8], hi: Option<&[u8]>) -> Vec<u8> {
    if let Some(hi) = hi {
        let shared = hi
            .iter()
            .enumerate()
            .take_while(|&(i, &d)| lo.get(i).copied().unwrap_or(0) == d)
            .count();
        if shared > 0 {
            let mut out = hi[..shared].to_vec();
            out.extend(midpoint(lo.get(shared..).unwrap_or_default(), Some(&hi[shared..])));
            return out;
        }
    }

    let d_lo = lo.first().copied().unwrap_or(0);
    let d_hi = hi.and_then(|h| h.first().copied()).unwrap_or(BASE);
    if d_hi - d_lo > 1 {
        return vec![(d_lo + d_hi) / 2];
    }
    match hi {
        // hi's leading digit alone sits strictly between lo and hi
        Some(hi) if hi.len() > 1 => vec![hi[0]],
        _ => {
            let mut out = vec![d_lo];
            out.extend(midpoint(lo.get(1..).unwrap_or_default(), None));
            out
        }
    }
}
