//! Cache expiration capping
//!
//! Cached responses must not outlive the nightly schedule refresh. The cutoff
//! is a civil time of day in the schedule's time zone; expirations past the
//! next cutoff are pulled back to it.

use chrono::{DateTime, Days, FixedOffset, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Civil hour at and after which the cutoff moves to the next day
pub const ROLLOVER_HOUR: u32 = 5;

/// Zone the schedule is published in
pub const DEFAULT_TIME_ZONE: &str = "Europe/Kyiv";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid cache expiration policy: {0}")]
    InvalidPolicy(String),
}

/// Cutoff time of day and the zone it is expressed in
///
/// `time-zone` is an IANA name and follows daylight saving time. Set it to
/// null to use the fixed `utc-offset-minutes` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CachePolicy {
    pub hours: u32,
    pub minutes: u32,
    pub time_zone: Option<String>,
    pub utc_offset_minutes: i32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            hours: 5,
            minutes: 0,
            time_zone: Some(DEFAULT_TIME_ZONE.to_string()),
            utc_offset_minutes: 180,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CivilZone {
    Named(Tz),
    Fixed(FixedOffset),
}

/// Validated cutoff ready for computation
#[derive(Debug, Clone, Copy)]
pub struct CacheExpiration {
    cutoff: NaiveTime,
    zone: CivilZone,
}

impl CacheExpiration {
    pub fn new(policy: &CachePolicy) -> Result<Self, CacheError> {
        debug!(?policy, "CacheExpiration::new: called");
        if policy.hours > 23 {
            return Err(CacheError::InvalidPolicy(format!("hours must be 0..=23, got {}", policy.hours)));
        }
        if policy.minutes > 59 {
            return Err(CacheError::InvalidPolicy(format!(
                "minutes must be 0..=59, got {}",
                policy.minutes
            )));
        }

        let cutoff = NaiveTime::from_hms_opt(policy.hours, policy.minutes, 0)
            .ok_or_else(|| CacheError::InvalidPolicy(format!("{}:{}", policy.hours, policy.minutes)))?;

        let zone = match &policy.time_zone {
            Some(name) => CivilZone::Named(
                name.parse::<Tz>()
                    .map_err(|e| CacheError::InvalidPolicy(format!("unknown time-zone '{}': {}", name, e)))?,
            ),
            None => CivilZone::Fixed(
                policy
                    .utc_offset_minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| {
                        CacheError::InvalidPolicy(format!(
                            "utc-offset-minutes out of range: {}",
                            policy.utc_offset_minutes
                        ))
                    })?,
            ),
        };

        Ok(Self { cutoff, zone })
    }

    /// Next cutoff as seen from `now`
    ///
    /// Before the rollover hour the cutoff applies to today's civil date,
    /// otherwise to tomorrow's. A cutoff earlier than the rollover hour can
    /// therefore lie in the past. A cutoff that falls into a daylight saving
    /// gap moves forward by the gap.
    pub fn max_expiration(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.zone {
            CivilZone::Named(tz) => self.next_cutoff(&tz, now),
            CivilZone::Fixed(offset) => self.next_cutoff(&offset, now),
        }
    }

    fn next_cutoff<Z: TimeZone>(&self, zone: &Z, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(zone);
        let today = local.date_naive();

        let date = if local.hour() >= ROLLOVER_HOUR {
            today.checked_add_days(Days::new(1)).unwrap_or(today)
        } else {
            today
        };

        let civil = date.and_time(self.cutoff);
        civil_to_utc(zone, civil).unwrap_or_else(|| civil.and_utc())
    }

    /// Cap `expiration` at the next cutoff from the current time
    pub fn clamp_expiration(&self, expiration: DateTime<Utc>) -> DateTime<Utc> {
        self.clamp_expiration_to(expiration, self.max_expiration(Utc::now()))
    }

    /// The earlier of `expiration` and `max`
    pub fn clamp_expiration_to(&self, expiration: DateTime<Utc>, max: DateTime<Utc>) -> DateTime<Utc> {
        expiration.min(max)
    }

    /// `at` in the policy's civil time, for display
    pub fn to_civil(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self.zone {
            CivilZone::Named(tz) => at.with_timezone(&tz).fixed_offset(),
            CivilZone::Fixed(offset) => at.with_timezone(&offset),
        }
    }
}

/// Earliest instant showing `civil` on the wall clock, skipping forward
/// over a gap
fn civil_to_utc<Z: TimeZone>(zone: &Z, civil: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&civil)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(civil + TimeDelta::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn expiration() -> CacheExpiration {
        CacheExpiration::new(&CachePolicy::default()).unwrap()
    }

    fn fixed_policy() -> CachePolicy {
        CachePolicy {
            time_zone: None,
            ..Default::default()
        }
    }

    /// Kyiv wall-clock time as a UTC instant
    fn kyiv(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::Europe::Kyiv
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_before_rollover_uses_today() {
        let now = kyiv(2024, 3, 10, 4, 0, 0);
        assert_eq!(expiration().max_expiration(now), kyiv(2024, 3, 10, 5, 0, 0));
    }

    #[test]
    fn test_after_rollover_uses_tomorrow() {
        let now = kyiv(2024, 3, 10, 6, 0, 0);
        assert_eq!(expiration().max_expiration(now), kyiv(2024, 3, 11, 5, 0, 0));
    }

    #[test]
    fn test_rollover_crosses_month_end() {
        let now = kyiv(2024, 2, 29, 23, 59, 59);
        assert_eq!(expiration().max_expiration(now), kyiv(2024, 3, 1, 5, 0, 0));
    }

    #[test]
    fn test_zone_decides_the_civil_date() {
        // 22:30 UTC on the 9th is already 00:30 on the 10th in Kyiv winter time
        let now = utc(2024, 3, 9, 22, 30);
        assert_eq!(expiration().max_expiration(now), utc(2024, 3, 10, 3, 0));
    }

    #[test]
    fn test_cutoff_follows_daylight_saving() {
        let cache = expiration();
        assert_eq!(cache.max_expiration(utc(2024, 1, 15, 12, 0)), utc(2024, 1, 16, 3, 0));
        assert_eq!(cache.max_expiration(utc(2024, 7, 15, 12, 0)), utc(2024, 7, 16, 2, 0));
    }

    #[test]
    fn test_cutoff_in_spring_gap_moves_forward() {
        // 03:30 does not exist in Kyiv on 2024-03-31, clocks jump 03:00 -> 04:00
        let policy = CachePolicy {
            hours: 3,
            minutes: 30,
            ..Default::default()
        };
        let now = kyiv(2024, 3, 31, 1, 0, 0);
        let max = CacheExpiration::new(&policy).unwrap().max_expiration(now);
        assert_eq!(max, utc(2024, 3, 31, 1, 30));
    }

    #[test]
    fn test_fixed_offset_zone() {
        let cache = CacheExpiration::new(&fixed_policy()).unwrap();
        // UTC+03:00 all year, no daylight saving
        assert_eq!(cache.max_expiration(utc(2024, 1, 15, 12, 0)), utc(2024, 1, 16, 2, 0));
        assert_eq!(cache.max_expiration(utc(2024, 7, 15, 12, 0)), utc(2024, 7, 16, 2, 0));
    }

    #[test]
    fn test_to_civil_uses_zone_offset() {
        let cache = expiration();
        assert_eq!(cache.to_civil(utc(2024, 1, 16, 3, 0)).offset().local_minus_utc(), 2 * 3600);
        assert_eq!(cache.to_civil(utc(2024, 7, 16, 2, 0)).offset().local_minus_utc(), 3 * 3600);
    }

    #[test]
    fn test_seconds_are_zeroed() {
        let policy = CachePolicy {
            hours: 7,
            minutes: 45,
            ..Default::default()
        };
        let now = kyiv(2024, 3, 10, 9, 12, 34) + TimeDelta::milliseconds(567);
        let max = CacheExpiration::new(&policy).unwrap().max_expiration(now);

        assert_eq!(max, kyiv(2024, 3, 11, 7, 45, 0));
        assert_eq!(max.timestamp_subsec_millis(), 0);
    }

    #[test]
    fn test_cutoff_before_rollover_can_be_in_the_past() {
        let policy = CachePolicy {
            hours: 2,
            ..Default::default()
        };
        let now = kyiv(2024, 3, 10, 3, 0, 0);
        assert_eq!(
            CacheExpiration::new(&policy).unwrap().max_expiration(now),
            kyiv(2024, 3, 10, 2, 0, 0)
        );
    }

    #[test]
    fn test_clamp_returns_cutoff_when_later() {
        let cache = expiration();
        let max = kyiv(2024, 3, 11, 5, 0, 0);

        let later = max + TimeDelta::hours(6);
        assert_eq!(cache.clamp_expiration_to(later, max), max);

        let earlier = max - TimeDelta::hours(6);
        assert_eq!(cache.clamp_expiration_to(earlier, max), earlier);
    }

    #[test]
    fn test_clamp_uses_current_time() {
        let cache = expiration();
        let far = Utc::now() + TimeDelta::days(30);
        let clamped = cache.clamp_expiration(far);

        assert!(clamped < far);
        assert!(clamped <= Utc::now() + TimeDelta::days(2));
    }

    #[test]
    fn test_invalid_policy() {
        let bad_hours = CachePolicy {
            hours: 24,
            ..Default::default()
        };
        let bad_minutes = CachePolicy {
            minutes: 60,
            ..Default::default()
        };
        let bad_offset = CachePolicy {
            utc_offset_minutes: 24 * 60,
            ..fixed_policy()
        };
        let bad_zone = CachePolicy {
            time_zone: Some("Europe/Atlantis".to_string()),
            ..Default::default()
        };

        assert!(matches!(CacheExpiration::new(&bad_hours), Err(CacheError::InvalidPolicy(_))));
        assert!(matches!(CacheExpiration::new(&bad_minutes), Err(CacheError::InvalidPolicy(_))));
        assert!(matches!(CacheExpiration::new(&bad_offset), Err(CacheError::InvalidPolicy(_))));
        assert!(matches!(CacheExpiration::new(&bad_zone), Err(CacheError::InvalidPolicy(_))));
    }

    #[test]
    fn test_policy_yaml() {
        let policy: CachePolicy = serde_yaml::from_str("hours: 4\ntime-zone: Europe/Warsaw\n").unwrap();
        assert_eq!(policy.hours, 4);
        assert_eq!(policy.minutes, 0);
        assert_eq!(policy.time_zone.as_deref(), Some("Europe/Warsaw"));

        let fixed: CachePolicy = serde_yaml::from_str("time-zone: ~\nutc-offset-minutes: 120\n").unwrap();
        assert_eq!(fixed.time_zone, None);
        assert_eq!(fixed.utc_offset_minutes, 120);
    }

    proptest! {
        #[test]
        fn prop_cutoff_at_or_after_rollover_is_in_the_future(
            secs in 0i64..4_000_000_000,
            hours in ROLLOVER_HOUR..24,
            minutes in 0u32..60,
        ) {
            let policy = CachePolicy { hours, minutes, ..Default::default() };
            let cache = CacheExpiration::new(&policy).unwrap();
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let max = cache.max_expiration(now);

            prop_assert!(max > now);
            prop_assert!(max - now <= TimeDelta::hours(49));
            prop_assert_eq!(max.timestamp() % 60, 0);
        }
    }
}
