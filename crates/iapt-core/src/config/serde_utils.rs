//! Serde helpers for configuration durations
//!
//! Config files carry durations as plain integers. `duration_secs` reads
//! them as seconds (timeouts) and `duration_days` as days (key validity):
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Settings {
//!     #[serde(with = "iapt_core::config::serde_utils::duration_secs")]
//!     connection_timeout: Duration,
//! }
//! ```

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn to_units<S: Serializer>(duration: &Duration, unit: u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs() / unit)
}

fn from_units<'de, D: Deserializer<'de>>(unit: u64, deserializer: D) -> Result<Duration, D::Error> {
    let count = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(count.saturating_mul(unit)))
}

/// Whole seconds; sub-second precision is dropped on write
pub mod duration_secs {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        super::to_units(duration, 1, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        super::from_units(1, deserializer)
    }
}

/// Whole days, rounded down on write
pub mod duration_days {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    const SECS_PER_DAY: u64 = 24 * 60 * 60;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        super::to_units(duration, SECS_PER_DAY, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        super::from_units(SECS_PER_DAY, deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Durations {
        #[serde(with = "duration_secs")]
        timeout: Duration,
        #[serde(with = "duration_days")]
        validity: Duration,
    }

    #[test]
    fn test_durations_written_as_integers() {
        let durations = Durations {
            timeout: Duration::from_millis(30_900),
            validity: Duration::from_secs(2 * 24 * 60 * 60 + 5),
        };
        let json = serde_json::to_string(&durations).unwrap();
        assert_eq!(json, r#"{"timeout":30,"validity":2}"#);
    }

    #[test]
    fn test_durations_read_from_integers() {
        let durations: Durations = serde_json::from_str(r#"{"timeout":60,"validity":30}"#).unwrap();
        assert_eq!(durations.timeout, Duration::from_secs(60));
        assert_eq!(durations.validity, Duration::from_secs(30 * 24 * 60 * 60));
    }

    #[test]
    fn test_negative_values_rejected() {
        assert!(serde_json::from_str::<Durations>(r#"{"timeout":-1,"validity":1}"#).is_err());
    }
}
