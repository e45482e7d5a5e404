//! Duration strings used for token and verification lifetimes.

/// Parse a TTL such as `"900"`, `"15m"`, `"24h"` or `"30d"` into seconds.
///
/// Accepts an unsigned integer optionally followed by one of `s`, `m`, `h`, `d`
/// (case-insensitive). Surrounding whitespace is ignored. Anything else,
/// including an absent value, yields `fallback`.
pub fn parse_ttl(raw: Option<&str>, fallback: u64) -> u64 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return fallback;
    };

    let (digits, multiplier) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 60 * 60,
                'd' => 24 * 60 * 60,
                _ => return fallback,
            };
            (&raw[..idx], multiplier)
        }
        _ => (raw, 1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return fallback;
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_ttl(Some("900"), 1), 900);
        assert_eq!(parse_ttl(Some("0"), 1), 0);
    }

    #[test]
    fn suffixes_scale_the_value() {
        assert_eq!(parse_ttl(Some("45s"), 1), 45);
        assert_eq!(parse_ttl(Some("15m"), 1), 900);
        assert_eq!(parse_ttl(Some("24h"), 1), 86_400);
        assert_eq!(parse_ttl(Some("30d"), 1), 2_592_000);
    }

    #[test]
    fn suffix_is_case_insensitive_and_whitespace_is_trimmed() {
        assert_eq!(parse_ttl(Some(" 2H "), 1), 7_200);
        assert_eq!(parse_ttl(Some("7D"), 1), 604_800);
    }

    #[test]
    fn garbage_falls_back() {
        assert_eq!(parse_ttl(None, 900), 900);
        assert_eq!(parse_ttl(Some(""), 900), 900);
        assert_eq!(parse_ttl(Some("abc"), 900), 900);
        assert_eq!(parse_ttl(Some("10w"), 900), 900);
        assert_eq!(parse_ttl(Some("m"), 900), 900);
        assert_eq!(parse_ttl(Some("-5m"), 900), 900);
        assert_eq!(parse_ttl(Some("1.5h"), 900), 900);
        assert_eq!(parse_ttl(Some("1 5m"), 900), 900);
    }
}
