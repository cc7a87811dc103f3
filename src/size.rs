//! Parsing and formatting of human-authored size expressions.
//!
//! Annotations carry either an absolute binary-SI quantity (`512Mi`, `30Gi`)
//! or a percentage of some capacity (`20%`). Both are evaluated against a
//! capacity in bytes and yield a byte threshold.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SizeError {
    #[error("invalid quantity: {0:?}")]
    InvalidQuantity(String),
    #[error("quantity overflows a signed 64-bit byte count: {0:?}")]
    Overflow(String),
    #[error("annotation value should be positive: {0}")]
    NotPositive(String),
    #[error("annotation value should be between 0 and 100: {0}")]
    OutOfRange(String),
    #[error("annotation value should be in percent notation: {0}")]
    NotPercent(String),
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", (1u64 << 10) as f64),
    ("Mi", (1u64 << 20) as f64),
    ("Gi", (1u64 << 30) as f64),
    ("Ti", (1u64 << 40) as f64),
    ("Pi", (1u64 << 50) as f64),
    ("Ei", (1u64 << 60) as f64),
];

const DECIMAL_SUFFIXES: [(&str, f64); 6] = [
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a quantity string into a byte count.
///
/// Accepts plain integers, decimal numbers, and binary-SI (`Ki`..`Ei`) or
/// decimal-SI (`k`..`E`) suffixes. Fractional results round away from zero,
/// matching the orchestrator's quantity semantics.
pub fn parse_quantity(s: &str) -> Result<i64, SizeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SizeError::InvalidQuantity(s.to_string()));
    }

    let (digits, factor) = split_suffix(s)?;
    let number: f64 = digits
        .parse()
        .map_err(|_| SizeError::InvalidQuantity(s.to_string()))?;
    let value = number * factor;
    let rounded = if value >= 0.0 {
        value.ceil()
    } else {
        value.floor()
    };
    if !rounded.is_finite() || rounded > i64::MAX as f64 || rounded < i64::MIN as f64 {
        return Err(SizeError::Overflow(s.to_string()));
    }
    Ok(rounded as i64)
}

fn split_suffix(s: &str) -> Result<(&str, f64), SizeError> {
    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(digits) = s.strip_suffix(suffix) {
            return Ok((digits, factor));
        }
    }
    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(digits) = s.strip_suffix(suffix) {
            return Ok((digits, factor));
        }
    }
    if s.ends_with(|c: char| c.is_ascii_digit() || c == '.') {
        return Ok((s, 1.0));
    }
    Err(SizeError::InvalidQuantity(s.to_string()))
}

/// Formats a byte count in canonical binary-SI form: the largest binary
/// suffix that divides it exactly, or a plain byte count otherwise.
pub fn format_quantity(bytes: i64) -> String {
    if bytes != 0 {
        for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
            let factor = *factor as i64;
            if bytes % factor == 0 {
                return format!("{}{}", bytes / factor, suffix);
            }
        }
    }
    bytes.to_string()
}

/// Evaluates a size annotation that may be either a percentage of
/// `capacity` or an absolute quantity. An empty value falls back to
/// `default`. Absolute values must be strictly positive.
pub fn convert_size_in_bytes(value: &str, capacity: i64, default: &str) -> Result<i64, SizeError> {
    let value = if value.is_empty() { default } else { value };
    if value.ends_with('%') {
        return calc_percent(value, capacity);
    }

    let bytes = parse_quantity(value)?;
    if bytes <= 0 {
        return Err(SizeError::NotPositive(value.to_string()));
    }
    Ok(bytes)
}

/// Evaluates a size annotation that must be a percentage of `capacity`.
/// An empty value falls back to `default`.
pub fn convert_size_in_percent(value: &str, capacity: i64, default: &str) -> Result<i64, SizeError> {
    let value = if value.is_empty() { default } else { value };
    if value.ends_with('%') {
        return calc_percent(value, capacity);
    }
    Err(SizeError::NotPercent(value.to_string()))
}

fn calc_percent(value: &str, capacity: i64) -> Result<i64, SizeError> {
    let rate: f64 = value
        .trim_end_matches('%')
        .parse()
        .map_err(|_| SizeError::InvalidQuantity(value.to_string()))?;
    if !(0.0..=100.0).contains(&rate) {
        return Err(SizeError::OutOfRange(value.to_string()));
    }
    Ok((capacity as f64 * rate / 100.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quantity_accepts_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1 << 10);
        assert_eq!(parse_quantity("30Gi").unwrap(), 30 << 30);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), (3 << 30) / 2);
        assert_eq!(parse_quantity("5G").unwrap(), 5_000_000_000);
        assert_eq!(parse_quantity("1024").unwrap(), 1024);
        assert_eq!(parse_quantity("-10Gi").unwrap(), -10 << 30);
    }

    #[test]
    fn parse_quantity_rejects_garbage() {
        for bad in ["", "hoge", "Gi", "10X", "--1", "1..5Gi"] {
            assert!(parse_quantity(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn format_quantity_uses_largest_exact_suffix() {
        assert_eq!(format_quantity(20 << 30), "20Gi");
        assert_eq!(format_quantity(1 << 40), "1Ti");
        assert_eq!(format_quantity(1536 << 20), "1536Mi");
        assert_eq!(format_quantity((1 << 30) + 1), "1073741825");
        assert_eq!(format_quantity(0), "0");
    }

    #[test]
    fn format_round_trips_parse() {
        for bytes in [1i64 << 30, 11 << 30, 100 << 30, 3 << 40] {
            assert_eq!(parse_quantity(&format_quantity(bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn convert_size_in_bytes_ok() {
        assert_eq!(convert_size_in_bytes("", 100, "10%").unwrap(), 10);
        assert_eq!(convert_size_in_bytes("20%", 100, "10%").unwrap(), 20);
        assert_eq!(
            convert_size_in_bytes("30Gi", 40 << 30, "10%").unwrap(),
            30 << 30
        );
        assert_eq!(convert_size_in_bytes("100%", 100, "10%").unwrap(), 100);
    }

    #[test]
    fn convert_size_in_bytes_err() {
        for bad in ["-10%", "101%", "-10Gi", "hoge"] {
            assert!(
                convert_size_in_bytes(bad, 100, "10%").is_err(),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn convert_size_in_percent_ok() {
        assert_eq!(convert_size_in_percent("", 100, "10%").unwrap(), 10);
        assert_eq!(convert_size_in_percent("20%", 100, "10%").unwrap(), 20);
    }

    #[test]
    fn convert_size_in_percent_rejects_non_percent() {
        for bad in ["10", "-10%", "101%", "hoge"] {
            assert!(
                convert_size_in_percent(bad, 100, "10%").is_err(),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn percent_is_floor_of_capacity_times_rate() {
        let capacity = 10 << 30;
        assert_eq!(
            convert_size_in_percent("33%", capacity, "10%").unwrap(),
            (capacity as f64 * 33.0 / 100.0) as i64
        );
    }
}
