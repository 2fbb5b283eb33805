//! Lowercase Roman numerals, as used for front-matter page numbers.

/// Numeral values and their symbols, largest first.
const NUMERALS: &[(u32, &str)] = &[
    (1000, "m"),
    (900, "cm"),
    (500, "d"),
    (400, "cd"),
    (100, "c"),
    (90, "xc"),
    (50, "l"),
    (40, "xl"),
    (10, "x"),
    (9, "ix"),
    (5, "v"),
    (4, "iv"),
    (1, "i"),
];

/// The largest number we can write without overlines.
pub const MAX_ROMAN: u32 = 3999;

/// Convert `n` to a lowercase Roman numeral. Returns `None` for 0 and for
/// anything above [`MAX_ROMAN`].
pub fn to_roman(mut n: u32) -> Option<String> {
    if n == 0 || n > MAX_ROMAN {
        return None;
    }
    let mut out = String::new();
    for &(value, symbol) in NUMERALS {
        while n >= value {
            out.push_str(symbol);
            n -= value;
        }
    }
    Some(out)
}

fn digit_value(c: char) -> Option<u32> {
    match c {
        'i' => Some(1),
        'v' => Some(5),
        'x' => Some(10),
        'l' => Some(50),
        'c' => Some(100),
        'd' => Some(500),
        'm' => Some(1000),
        _ => None,
    }
}

/// Parse a lowercase Roman numeral.
///
/// Only canonical numerals are accepted, so `"iiii"` and `"vx"` are rejected
/// even though a naive subtractive reading would give them a value.
pub fn from_roman(s: &str) -> Option<u32> {
    let values = s.chars().map(digit_value).collect::<Option<Vec<_>>>()?;
    // A subtractive pair dips below zero before its larger half is added.
    let mut total = 0i64;
    for (i, &value) in values.iter().enumerate() {
        match values.get(i + 1) {
            Some(&next) if next > value => total -= i64::from(value),
            _ => total += i64::from(value),
        }
    }
    let total = u32::try_from(total).ok()?;
    (to_roman(total).as_deref() == Some(s)).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(to_roman(1).as_deref(), Some("i"));
        assert_eq!(to_roman(4).as_deref(), Some("iv"));
        assert_eq!(to_roman(14).as_deref(), Some("xiv"));
        assert_eq!(to_roman(1994).as_deref(), Some("mcmxciv"));
        assert_eq!(to_roman(3999).as_deref(), Some("mmmcmxcix"));
        assert_eq!(from_roman("xlii"), Some(42));
        assert_eq!(from_roman("cdxliv"), Some(444));
    }

    #[test]
    fn test_leading_subtractive_pairs() {
        let cases = [
            ("iv", 4),
            ("ix", 9),
            ("xl", 40),
            ("xc", 90),
            ("cd", 400),
            ("cm", 900),
            ("xliv", 44),
            ("cmxcix", 999),
        ];
        for (numeral, value) in cases {
            assert_eq!(from_roman(numeral), Some(value), "numeral {numeral}");
        }
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(to_roman(0), None);
        assert_eq!(to_roman(4000), None);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "iiii", "vx", "iix", "IV", "abc", "mmmm", "il"] {
            assert_eq!(from_roman(bad), None, "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_bijection_over_full_range() {
        for n in 1..=MAX_ROMAN {
            let numeral = to_roman(n).unwrap();
            assert_eq!(from_roman(&numeral), Some(n), "numeral {numeral}");
        }
    }
}
