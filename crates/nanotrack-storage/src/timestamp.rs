//! Timestamp strings stamped into `creation` / `finished` attributes.

use chrono::{DateTime, Utc};

/// Attribute timestamp format: UTC, microsecond precision.
pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Current UTC time as an attribute string.
pub fn now() -> String {
    format(Utc::now())
}

/// Format a UTC time as an attribute string.
pub fn format(time: DateTime<Utc>) -> String {
    time.format(FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format(t), "2024-03-09 14:05:07.000000");
    }
}
