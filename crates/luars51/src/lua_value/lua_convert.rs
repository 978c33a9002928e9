//! Number <-> string coercions.
//!
//! Numbers render with the `%.14g` format of the reference interpreter;
//! numeric strings accept surrounding whitespace, decimal floats and
//! `0x` hexadecimal integers. Conversion failure is reported as `None`,
//! never as an error.

/// Characters treated as whitespace around numerals (C `isspace`).
#[inline]
fn is_lua_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

fn trim_lua_space(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if !is_lua_space(*first) {
            break;
        }
        s = rest;
    }
    while let [rest @ .., last] = s {
        if !is_lua_space(*last) {
            break;
        }
        s = rest;
    }
    s
}

/// Convert a numeral to a number.
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let s = trim_lua_space(bytes);
    if s.is_empty() {
        return None;
    }
    let (negative, body) = match s[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if body.len() > 2 && body[0] == b'0' && (body[1] == b'x' || body[1] == b'X') {
        let mut value = 0.0f64;
        for &d in &body[2..] {
            let digit = (d as char).to_digit(16)?;
            value = value * 16.0 + digit as f64;
        }
        return Some(if negative { -value } else { value });
    }
    // 'inf' and 'nan' spellings are not numerals
    if s.iter().any(|b| matches!(b, b'n' | b'N' | b'i' | b'I')) {
        return None;
    }
    let text = std::str::from_utf8(s).ok()?;
    text.parse::<f64>().ok()
}

/// Parse an unsigned integer numeral in `base` (2..=36), as `tonumber(s, base)`.
pub fn str_to_number_base(bytes: &[u8], base: u32) -> Option<f64> {
    let s = trim_lua_space(bytes);
    let (negative, body) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if body.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for &d in body {
        let digit = (d as char).to_digit(base)?;
        value = value * base as f64 + digit as f64;
    }
    Some(if negative { -value } else { value })
}

/// Integral value of `n` when it is exactly representable as `i64`.
#[inline]
pub fn number_to_int(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= -9.223_372_036_854_776e18 && n < 9.223_372_036_854_776e18 {
        Some(n as i64)
    } else {
        None
    }
}

/// Format a number the way `%.14g` does.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    // Integers of at most 14 digits print verbatim
    if n.fract() == 0.0 && n.abs() < 1e14 {
        let mut buffer = itoa::Buffer::new();
        return buffer.format(n as i64).to_string();
    }
    format_g(n, 14)
}

/// `%.{precision}g` for finite, non-zero values.
fn format_g(n: f64, precision: usize) -> String {
    let sci = format!("{:.*e}", precision - 1, n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if exp < -4 || exp >= precision as i32 {
        let mantissa = strip_trailing_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, n);
        strip_trailing_zeros(&fixed).to_string()
    }
}

fn strip_trailing_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
