//! Case-insensitive string comparison with wildcard support. `*` matches
//! any run of characters and `?` any single character; the comparison
//! doubles as a sort order for directory listings.

use std::cmp::Ordering;

fn fold(b: u8) -> u8 {
    b.to_ascii_lowercase()
}

/// Case-insensitive three-way comparison, ignoring wildcards. Used to
/// order directory entries.
pub fn cmp_nocase(a: &str, b: &str) -> Ordering {
    let mut ai = a.bytes();
    let mut bi = b.bytes();
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match fold(x).cmp(&fold(y)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Does `value` match the wildcard `pattern`, ignoring case.
pub fn matches(pattern: &str, value: &str) -> bool {
    matches_bytes(pattern.as_bytes(), value.as_bytes())
}

fn matches_bytes(pattern: &[u8], value: &[u8]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((b'*', rest)) => {
            // Greedy is unnecessary; try every split point.
            (0..=value.len()).any(|i| matches_bytes(rest, &value[i..]))
        }
        Some((b'?', rest)) => match value.split_first() {
            Some((_, vrest)) => matches_bytes(rest, vrest),
            None => false,
        },
        Some((p, rest)) => match value.split_first() {
            Some((v, vrest)) if fold(*p) == fold(*v) => matches_bytes(rest, vrest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_ignores_case() {
        assert_eq!(cmp_nocase("Word", "word"), Ordering::Equal);
        assert_eq!(cmp_nocase("Agenda", "word"), Ordering::Less);
        assert_eq!(cmp_nocase("zz", "Word"), Ordering::Greater);
        assert_eq!(cmp_nocase("abc", "abcd"), Ordering::Less);
    }

    #[test]
    fn wildcards_match() {
        assert!(matches("*", ""));
        assert!(matches("*", "anything"));
        assert!(matches("*.odt", "Letter.ODT"));
        assert!(matches("?bc", "abc"));
        assert!(!matches("?bc", "bc"));
        assert!(matches("a*c*e", "abcde"));
        assert!(!matches("a*c*e", "abcdf"));
    }
}
