//! Time utilities for iapt
//!
//! Key expiry is tracked as Unix seconds so it can be compared against
//! timestamps reported by the credential mechanism.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Unix timestamp `validity` from now, saturating on overflow.
pub fn expiry_from_now(validity: Duration) -> u64 {
    current_time_secs().saturating_add(validity.as_secs())
}

/// Whether `expires_at` falls within `margin` of the current time (or before it).
pub fn expires_within(expires_at: u64, margin: Duration) -> bool {
    expires_at <= current_time_secs().saturating_add(margin.as_secs())
}

/// Format a Unix timestamp as UTC `YYYYMMDDhhmm`, the form OpenSSH expects in
/// an `expiry-time` key option.
pub fn format_utc_compact(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}{:02}{:02}{:02}{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60
    )
}

/// Convert days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_secs_is_positive() {
        assert!(current_time_secs() > 0);
    }

    #[test]
    fn test_expiry_from_now() {
        let now = current_time_secs();
        let expiry = expiry_from_now(Duration::from_secs(3600));
        assert!(expiry >= now + 3600);
        assert!(expiry <= now + 3601);
    }

    #[test]
    fn test_expires_within() {
        let soon = expiry_from_now(Duration::from_secs(30));
        assert!(expires_within(soon, Duration::from_secs(60)));

        let later = expiry_from_now(Duration::from_secs(3600));
        assert!(!expires_within(later, Duration::from_secs(60)));

        assert!(expires_within(0, Duration::ZERO));
    }

    #[test]
    fn test_expiry_saturates() {
        assert_eq!(expiry_from_now(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_format_utc_compact() {
        assert_eq!(format_utc_compact(0), "197001010000");
        // 2000-02-29 12:34 UTC
        assert_eq!(format_utc_compact(951_827_640), "200002291234");
        // 2024-12-31 23:59 UTC
        assert_eq!(format_utc_compact(1_735_689_540), "202412312359");
    }
}
