//! Expiration policies for cached values.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds in one day.
pub const SECONDS_IN_ONE_DAY: u64 = 86_400;

/// Far-future instant used for values that never expire (year 3000).
pub const DISTANT_FUTURE_SECS: u64 = 32_503_680_000;

/// Returns the sentinel instant used by [`StorageExpiration::Never`].
#[must_use]
pub fn distant_future() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(DISTANT_FUTURE_SECS)
}

/// Returns the sentinel instant used by [`StorageExpiration::Expired`].
#[must_use]
pub const fn distant_past() -> SystemTime {
    UNIX_EPOCH
}

/// How long a stored value stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageExpiration {
    /// The value never expires.
    Never,
    /// The value expires after the given number of seconds.
    Seconds(u64),
    /// The value expires after the given number of days.
    Days(u64),
    /// The value expires at a fixed instant.
    At(SystemTime),
    /// The value is already expired. Storing it is skipped.
    Expired,
}

impl StorageExpiration {
    /// Computes the absolute expiry instant relative to `since`.
    #[must_use]
    pub fn estimated_expiration_since(self, since: SystemTime) -> SystemTime {
        match self {
            Self::Never => distant_future(),
            Self::Seconds(seconds) => saturating_add(since, Duration::from_secs(seconds)),
            Self::Days(days) => saturating_add(
                since,
                Duration::from_secs(days.saturating_mul(SECONDS_IN_ONE_DAY)),
            ),
            Self::At(instant) => instant,
            Self::Expired => distant_past(),
        }
    }

    /// Computes the absolute expiry instant relative to now.
    #[must_use]
    pub fn estimated_expiration_since_now(self) -> SystemTime {
        self.estimated_expiration_since(SystemTime::now())
    }

    /// Length of the validity window in seconds, relative to now for
    /// [`StorageExpiration::At`].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn time_interval(self) -> f64 {
        match self {
            Self::Never => f64::INFINITY,
            Self::Seconds(seconds) => seconds as f64,
            Self::Days(days) => days.saturating_mul(SECONDS_IN_ONE_DAY) as f64,
            Self::At(instant) => match instant.duration_since(SystemTime::now()) {
                Ok(ahead) => ahead.as_secs_f64(),
                Err(behind) => -behind.duration().as_secs_f64(),
            },
            Self::Expired => f64::NEG_INFINITY,
        }
    }

    /// Returns true when a value stored with this policy would already be
    /// expired.
    #[must_use]
    pub fn is_expired(self) -> bool {
        self.time_interval() <= 0.0
    }

    /// Like [`StorageExpiration::is_expired`], with `reference` standing in
    /// for the current time.
    #[must_use]
    pub fn is_expired_at(self, reference: SystemTime) -> bool {
        is_past(self.estimated_expiration_since(reference), reference)
    }
}

/// What happens to an entry's expiry when it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationExtending {
    /// Keep the current expiry.
    None,
    /// Restart the original validity window from the access time.
    #[default]
    CacheTime,
    /// Restart with a new validity window from the access time.
    ExpirationTime(StorageExpiration),
}

/// Returns true if `instant` is at or before `reference`.
#[must_use]
pub fn is_past(instant: SystemTime, reference: SystemTime) -> bool {
    instant <= reference
}

fn saturating_add(instant: SystemTime, duration: Duration) -> SystemTime {
    instant
        .checked_add(duration)
        .map_or_else(distant_future, |value| value.min(distant_future()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn reference() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test_case(StorageExpiration::Seconds(30), 30 ; "seconds")]
    #[test_case(StorageExpiration::Days(2), 2 * SECONDS_IN_ONE_DAY ; "days")]
    #[test_case(StorageExpiration::Seconds(0), 0 ; "zero_seconds")]
    fn test_relative_expiry(expiration: StorageExpiration, offset: u64) {
        let expiry = expiration.estimated_expiration_since(reference());
        assert_eq!(expiry, reference() + Duration::from_secs(offset));
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(
            StorageExpiration::Never.estimated_expiration_since(reference()),
            distant_future()
        );
        assert_eq!(
            StorageExpiration::Expired.estimated_expiration_since(reference()),
            distant_past()
        );
        assert!(is_past(distant_past(), SystemTime::now()));
        assert!(!is_past(distant_future(), SystemTime::now()));
    }

    #[test]
    fn test_fixed_date_is_returned_verbatim() {
        let at = reference() + Duration::from_secs(12);
        assert_eq!(
            StorageExpiration::At(at).estimated_expiration_since(SystemTime::now()),
            at
        );
    }

    #[test_case(StorageExpiration::Never, false ; "never")]
    #[test_case(StorageExpiration::Seconds(1), false ; "positive_seconds")]
    #[test_case(StorageExpiration::Seconds(0), true ; "zero_seconds")]
    #[test_case(StorageExpiration::Days(0), true ; "zero_days")]
    #[test_case(StorageExpiration::Expired, true ; "expired")]
    #[test_case(StorageExpiration::At(UNIX_EPOCH), true ; "past_date")]
    fn test_is_expired(expiration: StorageExpiration, expected: bool) {
        assert_eq!(expiration.is_expired(), expected);
    }

    #[test]
    fn test_future_date_is_not_expired() {
        let at = SystemTime::now() + Duration::from_secs(3600);
        assert!(!StorageExpiration::At(at).is_expired());
    }

    #[test]
    fn test_is_expired_against_reference() {
        let at = reference() + Duration::from_secs(5);
        assert!(!StorageExpiration::At(at).is_expired_at(reference()));
        assert!(StorageExpiration::At(at).is_expired_at(at));
        assert!(StorageExpiration::At(at).is_expired());
        assert!(StorageExpiration::Seconds(0).is_expired_at(reference()));
        assert!(!StorageExpiration::Never.is_expired_at(reference()));
    }
}
