//! Human-readable memory sizes.

use crate::{Error, Result};

/// Units accepted by [`parse_memory_size`], with the power of 1024 each one represents.
const UNITS: [(&str, i32); 6] = [("B", 0), ("KB", 1), ("MB", 2), ("GB", 3), ("TB", 4), ("PB", 5)];

/// Units used by [`format_size`], from smallest to largest, excluding the final `Yi` fallback.
const DISPLAY_UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

const BYTES_PER_KIB: f64 = 1024.0;

/// Parses a human-readable memory size into a number of bytes.
///
/// The accepted format is `<number><optional whitespace><unit>`, where the number is an integer
/// or a decimal (`100`, `3.14`, `.5`) with an optional leading `+` and the unit is one of
/// `B`, `KB`, `MB`, `GB`, `TB`, `PB` in any letter case. Units are binary multiples,
/// so `1KB` is 1024 bytes.
///
/// # Example
///
/// ```
/// use alloc_limits::parse_memory_size;
///
/// assert_eq!(parse_memory_size("2KB").unwrap(), 2048.0);
/// assert_eq!(parse_memory_size("+1.5 mb").unwrap(), 1.5 * 1024.0 * 1024.0);
/// assert!(parse_memory_size("100").is_err());
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidMemorySize`] if the number is missing, negative or malformed,
/// or if the unit is missing or unknown.
pub fn parse_memory_size(value: &str) -> Result<f64> {
    let unsigned = value.strip_prefix('+').unwrap_or(value);

    if unsigned.starts_with('-') {
        return Err(Error::invalid_memory_size(
            value,
            "memory size must not be negative",
        ));
    }

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, rest) = unsigned.split_at(number_len);

    validate_number(value, number)?;

    let unit = rest.trim_start();

    if unit.is_empty() {
        return Err(Error::invalid_memory_size(
            value,
            "a unit (B, KB, MB, GB, TB, PB) is required",
        ));
    }

    let exponent = UNITS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(unit))
        .map(|(_, exponent)| *exponent)
        .ok_or_else(|| {
            Error::invalid_memory_size(
                value,
                format!("unknown unit '{unit}', expected one of B, KB, MB, GB, TB, PB"),
            )
        })?;

    let quantity = number.parse::<f64>().map_err(|inner| {
        Error::invalid_memory_size(value, format!("could not parse quantity: {inner}"))
    })?;

    Ok(quantity * BYTES_PER_KIB.powi(exponent))
}

fn validate_number(value: &str, number: &str) -> Result<()> {
    if number.is_empty() {
        return Err(Error::invalid_memory_size(value, "a quantity is required"));
    }

    match number.split_once('.') {
        Some((_, fraction)) if fraction.is_empty() || fraction.contains('.') => Err(
            Error::invalid_memory_size(value, "quantity must be an integer or a decimal"),
        ),
        _ => Ok(()),
    }
}

/// Formats a number of bytes using binary units with one decimal place (e.g. `1.0KiB`).
///
/// # Example
///
/// ```
/// use alloc_limits::format_size;
///
/// assert_eq!(format_size(1024.0), "1.0KiB");
/// assert_eq!(format_size(10.0 * 1024.0 * 1024.0), "10.0MiB");
/// ```
#[must_use]
pub fn format_size(bytes: f64) -> String {
    let mut value = bytes;

    for unit in DISPLAY_UNITS {
        if value.abs() < BYTES_PER_KIB {
            return format!("{value:3.1}{unit}B");
        }

        value /= BYTES_PER_KIB;
    }

    format!("{value:.1}YiB")
}

/// Converts a byte count to the floating point representation used for limits.
#[expect(
    clippy::cast_precision_loss,
    reason = "byte counts above 2^53 are unrealistic and a rounded comparison is acceptable"
)]
pub(crate) fn bytes_as_f64(bytes: u64) -> f64 {
    bytes as f64
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[expect(clippy::float_cmp, reason = "binary multiples are exact in f64")]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_sizes() {
        let cases = [
            ("100 B", 100.0),
            ("100B", 100.0),
            ("100.0B", 100.0),
            ("100.0   B", 100.0),
            ("100 KB", 100.0 * 1024.0),
            ("3 MB", 3.0 * 1024_f64.powi(2)),
            ("3.0 GB", 3.0 * 1024_f64.powi(3)),
            ("60.0 TB", 60.0 * 1024_f64.powi(4)),
            ("3.14 PB", 3.14 * 1024_f64.powi(5)),
            ("+100.0B", 100.0),
            ("+100.0   B", 100.0),
            ("+100 KB", 100.0 * 1024.0),
            ("100 Kb", 100.0 * 1024.0),
            ("3 Mb", 3.0 * 1024_f64.powi(2)),
            ("3.0 Gb", 3.0 * 1024_f64.powi(3)),
            ("60.0 Tb", 60.0 * 1024_f64.powi(4)),
            ("3.14 Pb", 3.14 * 1024_f64.powi(5)),
            ("+100.0b", 100.0),
            ("+100 Kb", 100.0 * 1024.0),
            (".5KB", 512.0),
            ("0B", 0.0),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_memory_size(input).unwrap(), expected, "input {input}");
        }
    }

    #[test]
    fn parse_invalid_sizes() {
        let cases = [
            "Some bad string",
            "100.0",
            "100",
            "100 NB",
            "100 K",
            "100.0 PK",
            "100 PK",
            "-100 B",
            "-100.0 B",
            "+100.0 K",
            "",
            "KB",
            "5.KB",
            "1.2.3KB",
            "+-5KB",
        ];

        for input in cases {
            let error = parse_memory_size(input).unwrap_err();
            assert!(
                matches!(error, Error::InvalidMemorySize { .. }),
                "input {input} gave {error}"
            );
        }
    }

    #[test]
    fn format_uses_binary_units() {
        assert_eq!(format_size(0.0), "0.0B");
        assert_eq!(format_size(1023.0), "1023.0B");
        assert_eq!(format_size(1024.0), "1.0KiB");
        assert_eq!(format_size(10240.0), "10.0KiB");
        assert_eq!(format_size(1536.0 * 1024.0), "1.5MiB");
        assert_eq!(format_size(1024_f64.powi(8)), "1.0YiB");
    }

    #[test]
    fn bytes_as_f64_is_exact_for_realistic_values() {
        assert_eq!(bytes_as_f64(2048), 2048.0);
    }
}
