//! Decimal byte units used for quotas and reports.

pub const KB: i64 = 1000;
pub const MB: i64 = KB * 1000;
pub const GB: i64 = MB * 1000;

/// Convert a (possibly fractional) number of gigabytes to bytes, truncating.
#[must_use]
pub fn gigabytes(value: f64) -> i64 {
    (value * GB as f64) as i64
}

/// Format a byte count with the largest fitting decimal unit.
///
/// Whole values are printed without a fraction, others with three decimals.
#[must_use]
pub fn format_bytes(bytes: i64) -> String {
    let (unit, divisor) = match bytes {
        b if b < KB => return format!("{b} Bytes"),
        b if b < MB => ("KB", KB),
        b if b < GB => ("MB", MB),
        _ => ("GB", GB),
    };

    if bytes % divisor == 0 {
        format!("{} {unit}", bytes / divisor)
    } else {
        format!("{:.3} {unit}", bytes as f64 / divisor as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(999), "999 Bytes");
        assert_eq!(format_bytes(1000), "1 KB");
        assert_eq!(format_bytes(1500), "1.500 KB");
        assert_eq!(format_bytes(2 * MB), "2 MB");
        assert_eq!(format_bytes(1_234_567), "1.235 MB");
        assert_eq!(format_bytes(5 * GB), "5 GB");
        assert_eq!(format_bytes(1_500_000_000), "1.500 GB");
    }

    #[test]
    fn test_gigabytes() {
        assert_eq!(gigabytes(5.0), 5 * GB);
        assert_eq!(gigabytes(0.5), 500 * MB);
    }
}
