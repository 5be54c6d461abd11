//! Time source abstraction
//!
//! Certificate validity windows, key rotation schedules and trust-list cache
//! freshness all depend on "now". Routing every read of the clock through a
//! [`TimeSource`] keeps those decisions testable and lets devices with an
//! unreliable clock supply their own (RTC, GPS, network time).
//!
//! # Usage
//!
//! ```rust,ignore
//! use provsign::time::{TimeSource, SystemTimeSource, FixedTimeSource};
//!
//! let system = SystemTimeSource;
//! let now = system.now()?;
//!
//! let fixed = FixedTimeSource::from_unix_secs(1_767_225_600); // 2026-01-01 00:00:00 UTC
//! ```

use crate::error::PSError;
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2025-01-01 00:00:00 UTC. System clock readings before this come from an
/// unset clock (devices without a battery-backed RTC boot at the epoch).
pub const CLOCK_FLOOR: u64 = 1_735_689_600;

/// Pluggable source of the current time.
pub trait TimeSource: Send + Sync {
    /// Get the current time from this source.
    fn now(&self) -> Result<SystemTime, PSError>;

    /// Lower bound for any timestamp this source may report.
    fn minimum_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(CLOCK_FLOOR)
    }

    /// Get current time as Unix timestamp (seconds since epoch).
    fn now_unix(&self) -> Result<u64, PSError> {
        let time = self.now()?;
        Ok(time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs())
    }

    /// Get current time as a UTC date-time.
    fn now_utc(&self) -> Result<DateTime<Utc>, PSError> {
        Ok(DateTime::<Utc>::from(self.now()?))
    }
}

/// System clock. The default for development and servers with NTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<SystemTime, PSError> {
        above_floor(SystemTime::now(), self.minimum_time())
    }
}

fn above_floor(time: SystemTime, floor: SystemTime) -> Result<SystemTime, PSError> {
    if time < floor {
        return Err(PSError::TimeError(format!(
            "Clock reads {}, before {}; the clock is not set",
            time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
            format_rfc3339(CLOCK_FLOOR)
        )));
    }
    Ok(time)
}

/// Fixed time source (testing, replaying a known-good timestamp).
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    timestamp: SystemTime,
}

impl FixedTimeSource {
    /// Create from Unix timestamp (seconds since epoch)
    pub fn from_unix_secs(secs: u64) -> Self {
        Self {
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    /// Create from an RFC 3339 string, e.g. `2026-03-01T12:00:00Z`
    pub fn from_rfc3339(s: &str) -> Result<Self, PSError> {
        let secs = parse_rfc3339(s)?;
        Ok(Self::from_unix_secs(secs))
    }

    /// Get the fixed timestamp
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Result<SystemTime, PSError> {
        Ok(self.timestamp)
    }

    fn minimum_time(&self) -> SystemTime {
        // Tests may pin a time before the build date.
        UNIX_EPOCH
    }
}

/// Parse an RFC 3339 timestamp into Unix seconds.
pub fn parse_rfc3339(s: &str) -> Result<u64, PSError> {
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| PSError::TimeError(format!("Invalid RFC 3339 timestamp '{}': {}", s, e)))?;
    u64::try_from(dt.timestamp())
        .map_err(|_| PSError::TimeError(format!("Timestamp before Unix epoch: {}", s)))
}

/// Format Unix seconds as an RFC 3339 UTC string (second precision).
pub fn format_rfc3339(secs: u64) -> String {
    DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(secs))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
