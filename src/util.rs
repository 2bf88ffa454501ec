//! Number parsing and formatting, glob matching and clocks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Parses a decimal `i64` the strict way: an optional `-`, no leading
/// zeros, no `+`, no whitespace, no overflow.
pub fn string2ll(s: &[u8]) -> Option<i64> {
    if s.is_empty() || s.len() > 20 {
        return None;
    }
    if s == b"0" {
        return Some(0);
    }
    let (negative, digits) = match s[0] {
        b'-' => (true, &s[1..]),
        _ => (false, s),
    };
    // First digit must be 1-9.
    match digits.first() {
        Some(b'1'..=b'9') => {}
        _ => return None,
    }

    let mut v: u64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((c - b'0') as u64)?;
    }

    if negative {
        if v > (i64::MAX as u64) + 1 {
            return None;
        }
        Some((v as i64).wrapping_neg())
    } else {
        i64::try_from(v).ok()
    }
}

/// Parses a double. Accepts `inf`, `+inf` and `-inf`; rejects NaN and
/// surrounding whitespace.
pub fn parse_f64(s: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(s).ok()?;
    if text.is_empty() || text.trim() != text {
        return None;
    }
    let v: f64 = text.parse().ok()?;
    if v.is_nan() { None } else { Some(v) }
}

/// Formats a double the way replies show scores: `%.17g` layout over the
/// shortest digits that round-trip. Plain notation for exponents in
/// `-4..17`, `1.5e+20` style otherwise, `inf` / `-inf` for infinities.
pub fn format_f64(v: f64) -> String {
    if v.is_infinite() {
        return if v > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0".into() } else { "0".into() };
    }

    let sci = format!("{:e}", v.abs());
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let sign = if v < 0.0 { "-" } else { "" };

    if !(-4..17).contains(&exp) {
        let esign = if exp < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{esign}{:02}", exp.abs());
    }

    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let body = if exp < 0 {
        format!("0.{}{digits}", "0".repeat((-exp - 1) as usize))
    } else {
        let int_len = exp as usize + 1;
        if digits.len() <= int_len {
            format!("{digits}{}", "0".repeat(int_len - digits.len()))
        } else {
            format!("{}.{}", &digits[..int_len], &digits[int_len..])
        }
    };
    format!("{sign}{body}")
}

/// Glob-style matching with `*`, `?`, `[...]` classes (with `^` negation
/// and `a-z` ranges) and `\` escapes.
pub fn string_match(pattern: &[u8], string: &[u8], nocase: bool) -> bool {
    let eq = |a: u8, b: u8| {
        if nocase {
            a.eq_ignore_ascii_case(&b)
        } else {
            a == b
        }
    };

    let (mut p, mut s) = (pattern, string);
    while let Some(&pc) = p.first() {
        match pc {
            b'*' => {
                while p.len() > 1 && p[1] == b'*' {
                    p = &p[1..];
                }
                if p.len() == 1 {
                    return true;
                }
                for i in 0..=s.len() {
                    if string_match(&p[1..], &s[i..], nocase) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                if s.is_empty() {
                    return false;
                }
                s = &s[1..];
            }
            b'[' => {
                let Some(&c) = s.first() else {
                    return false;
                };
                p = &p[1..];
                let negate = p.first() == Some(&b'^');
                if negate {
                    p = &p[1..];
                }
                let mut matched = false;
                loop {
                    match p {
                        [] => break,
                        [b'\\', esc, ..] => {
                            if eq(*esc, c) {
                                matched = true;
                            }
                            p = &p[2..];
                        }
                        [b']', ..] => break,
                        [lo, b'-', hi, ..] if *hi != b']' => {
                            let (mut lo, mut hi, mut c) = (*lo, *hi, c);
                            if lo > hi {
                                std::mem::swap(&mut lo, &mut hi);
                            }
                            if nocase {
                                lo = lo.to_ascii_lowercase();
                                hi = hi.to_ascii_lowercase();
                                c = c.to_ascii_lowercase();
                            }
                            if (lo..=hi).contains(&c) {
                                matched = true;
                            }
                            p = &p[3..];
                        }
                        [x, ..] => {
                            if eq(*x, c) {
                                matched = true;
                            }
                            p = &p[1..];
                        }
                    }
                }
                if matched == negate {
                    return false;
                }
                s = &s[1..];
                // Unterminated class: treat the end of pattern as `]`.
                if p.is_empty() {
                    return s.is_empty();
                }
            }
            b'\\' if p.len() >= 2 => {
                p = &p[1..];
                match s.first() {
                    Some(&c) if eq(p[0], c) => s = &s[1..],
                    _ => return false,
                }
            }
            _ => match s.first() {
                Some(&c) if eq(pc, c) => s = &s[1..],
                _ => return false,
            },
        }
        p = &p[1..];
    }
    s.is_empty()
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn mstime() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Wall clock in microseconds since the Unix epoch.
pub fn ustime() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string2ll() {
        assert_eq!(string2ll(b"0"), Some(0));
        assert_eq!(string2ll(b"-1"), Some(-1));
        assert_eq!(string2ll(b"12345"), Some(12345));
        assert_eq!(string2ll(b"9223372036854775807"), Some(i64::MAX));
        assert_eq!(string2ll(b"-9223372036854775808"), Some(i64::MIN));
        assert_eq!(string2ll(b"9223372036854775808"), None);
        assert_eq!(string2ll(b"007"), None);
        assert_eq!(string2ll(b"+5"), None);
        assert_eq!(string2ll(b" 5"), None);
        assert_eq!(string2ll(b"-0"), None);
        assert_eq!(string2ll(b"12a"), None);
        assert_eq!(string2ll(b""), None);
    }

    #[test]
    fn test_parse_f64() {
        assert_eq!(parse_f64(b"1.5"), Some(1.5));
        assert_eq!(parse_f64(b"-inf"), Some(f64::NEG_INFINITY));
        assert_eq!(parse_f64(b"+inf"), Some(f64::INFINITY));
        assert_eq!(parse_f64(b"nan"), None);
        assert_eq!(parse_f64(b" 1"), None);
        assert_eq!(parse_f64(b"abc"), None);
    }

    #[test]
    fn test_format_f64() {
        assert_eq!(format_f64(3.0), "3");
        assert_eq!(format_f64(-2.5), "-2.5");
        assert_eq!(format_f64(f64::INFINITY), "inf");
        assert_eq!(format_f64(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_f64(0.1), "0.1");
        assert_eq!(format_f64(0.0), "0");
        assert_eq!(format_f64(-0.0), "-0");
        assert_eq!(format_f64(1e16), "10000000000000000");
        assert_eq!(format_f64(1e17), "1e+17");
        assert_eq!(format_f64(1e20), "1e+20");
        assert_eq!(format_f64(-1.5e300), "-1.5e+300");
        assert_eq!(format_f64(0.0001), "0.0001");
        assert_eq!(format_f64(0.00012), "0.00012");
        assert_eq!(format_f64(1e-5), "1e-05");
        assert_eq!(format_f64(-2.5e-7), "-2.5e-07");
        assert_eq!(format_f64(123.456), "123.456");
    }

    #[test]
    fn test_string_match() {
        assert!(string_match(b"*", b"anything", false));
        assert!(string_match(b"h?llo", b"hello", false));
        assert!(string_match(b"h*llo", b"heeeello", false));
        assert!(string_match(b"h[ae]llo", b"hallo", false));
        assert!(!string_match(b"h[ae]llo", b"hillo", false));
        assert!(string_match(b"h[^e]llo", b"hallo", false));
        assert!(!string_match(b"h[^e]llo", b"hello", false));
        assert!(string_match(b"h[a-b]llo", b"hbllo", false));
        assert!(string_match(b"user:\\*", b"user:*", false));
        assert!(!string_match(b"user:\\*", b"user:1", false));
        assert!(string_match(b"HELLO", b"hello", true));
        assert!(!string_match(b"HELLO", b"hello", false));
        assert!(!string_match(b"a?", b"a", false));
        assert!(string_match(b"", b"", false));
        assert!(!string_match(b"", b"x", false));
    }
}
