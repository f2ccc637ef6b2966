//! Natural string ordering for directory-tree display.
//!
//! Natural order compares embedded decimal digit runs by numeric value
//! instead of ASCIIbetically, so `file2` sorts before `file10`. Everything
//! else is plain byte comparison, with the shorter string first on a prefix
//! match.

use std::cmp::Ordering;

struct TryInt {
    was_num: bool,
    value: u64,
    /// First byte after the digit run; `None` when input ended inside it.
    next: Option<u8>,
}

/// Consume one token: either a run of decimal digits (returning its value
/// and the byte that ended it) or a single non-digit byte.
fn try_int(s: &[u8], pos: &mut usize) -> TryInt {
    let mut r = TryInt {
        was_num: false,
        value: 0,
        next: None,
    };
    while *pos < s.len() {
        let c = s[*pos];
        *pos += 1;
        if c.is_ascii_digit() {
            r.was_num = true;
            r.value = r.value.wrapping_mul(10).wrapping_add(u64::from(c - b'0'));
        } else {
            r.next = Some(c);
            return r;
        }
    }
    r
}

/// Compare two strings in natural order.
pub fn natural_compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0usize, 0usize);
    loop {
        match (i == a.len(), j == b.len()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        let ra = try_int(a, &mut i);
        let rb = try_int(b, &mut j);
        match (ra.was_num, rb.was_num) {
            (true, true) => match ra.value.cmp(&rb.value) {
                Ordering::Equal => {}
                other => return other,
            },
            (true, false) => {
                // A digit run against a non-digit: the non-digit side sorts
                // by where its byte falls relative to '0'.
                return if rb.next.unwrap_or(0) < b'0' {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            (false, true) => {
                return if ra.next.unwrap_or(0) < b'0' {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            (false, false) => {}
        }
        match (ra.next, rb.next) {
            (Some(ca), Some(cb)) => match ca.cmp(&cb) {
                Ordering::Equal => {}
                other => return other,
            },
            // One side ended exactly on its digit run while the other
            // continues: the shorter string sorts first.
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => {}
        }
    }
}

/// `natural_compare` as a sort predicate.
pub fn natural_less(a: &str, b: &str) -> bool {
    natural_compare(a, b) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_runs_compare_numerically() {
        assert_eq!(natural_compare("file2", "file10"), Ordering::Less);
        assert_eq!(natural_compare("file10", "file2"), Ordering::Greater);
        assert_eq!(natural_compare("file10", "file10"), Ordering::Equal);
    }

    #[test]
    fn prefix_sorts_first() {
        assert_eq!(natural_compare("a", "aa"), Ordering::Less);
        assert_eq!(natural_compare("aa", "a"), Ordering::Greater);
        assert_eq!(natural_compare("", "a"), Ordering::Less);
        assert_eq!(natural_compare("", ""), Ordering::Equal);
        // Prefix rule also applies when the shorter side ends on a digit run.
        assert_eq!(natural_compare("2", "2x"), Ordering::Less);
        assert_eq!(natural_compare("2x", "2"), Ordering::Greater);
    }

    #[test]
    fn mixed_text_and_numbers() {
        assert_eq!(natural_compare("a1b", "a1c"), Ordering::Less);
        assert_eq!(natural_compare("a2x", "a11x"), Ordering::Less);
        assert_eq!(natural_compare("alpha", "beta"), Ordering::Less);
        assert_eq!(natural_compare("x9y2", "x9y11"), Ordering::Less);
    }

    #[test]
    fn digit_against_non_digit() {
        // '.' (0x2E) is below '0', letters are above it.
        assert_eq!(natural_compare("f1", "f."), Ordering::Greater);
        assert_eq!(natural_compare("f1", "fz"), Ordering::Less);
    }

    #[test]
    fn sorting_a_listing() {
        let mut names = vec!["img12", "img2", "img1", "img10", "cover"];
        names.sort_by(|a, b| natural_compare(a, b));
        assert_eq!(names, vec!["cover", "img1", "img2", "img10", "img12"]);
    }
}
