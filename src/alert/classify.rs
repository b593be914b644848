//! Station status classification.
//!
//! A station's status is never taken on trust from the backend: it is
//! re-derived from `last_reading` + `thresholds` + the current time
//! whenever a snapshot is applied.
//!
//! Precedence:
//!   1. reading age > offline tolerance      → Offline
//!   2. level >= danger  (+ danger offset)   → Danger
//!   3. level >= warning (+ warning offset)  → Warning
//!   4. otherwise                            → Normal
//!
//! Both level comparisons are inclusive; staleness is strictly greater
//! than the tolerance, so a reading exactly at the tolerance is still live.
//!
//! # Clock injection
//! All functions accept `now: DateTime<Utc>` rather than calling
//! `Utc::now()` internally, which keeps classification deterministic in
//! tests.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Reading, Station, StationStatus, Thresholds};

/// Default offline tolerance: a station silent for longer than this is Offline.
pub const DEFAULT_OFFLINE_AFTER_HOURS: i64 = 6;

/// Policy values applied on top of each station's own thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationPolicy {
    pub offline_after: Duration,
    /// Added to `thresholds.warning` before comparison.
    pub warning_offset: f64,
    /// Added to `thresholds.danger` before comparison.
    pub danger_offset: f64,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            offline_after: Duration::hours(DEFAULT_OFFLINE_AFTER_HOURS),
            warning_offset: 0.0,
            danger_offset: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Age of the reading relative to `now`. Readings stamped in the future
/// (clock skew between station and server) count as zero age.
pub fn reading_age(reading: &Reading, now: DateTime<Utc>) -> Duration {
    let age = now - reading.timestamp;
    if age < Duration::zero() { Duration::zero() } else { age }
}

/// Returns `true` when the reading is older than `offline_after`.
///
///   age > offline_after  →  offline
///   age == offline_after →  not offline
pub fn is_offline_at(reading: &Reading, offline_after: Duration, now: DateTime<Utc>) -> bool {
    reading_age(reading, now) > offline_after
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Computes the operational status for one reading. Pure and total.
pub fn classify(
    reading: &Reading,
    thresholds: &Thresholds,
    policy: &ClassificationPolicy,
    now: DateTime<Utc>,
) -> StationStatus {
    if is_offline_at(reading, policy.offline_after, now) {
        return StationStatus::Offline;
    }

    let level = reading.water_level;
    if level >= thresholds.danger + policy.danger_offset {
        StationStatus::Danger
    } else if level >= thresholds.warning + policy.warning_offset {
        StationStatus::Warning
    } else {
        StationStatus::Normal
    }
}

/// Convenience wrapper over a whole station record.
pub fn classify_station(
    station: &Station,
    policy: &ClassificationPolicy,
    now: DateTime<Utc>,
) -> StationStatus {
    classify(&station.last_reading, &station.thresholds, policy, now)
}

/// Returns the station with its status re-derived. The record is rebuilt
/// whole; callers store the result in place of the input.
pub fn with_derived_status(
    station: Station,
    policy: &ClassificationPolicy,
    now: DateTime<Utc>,
) -> Station {
    let status = classify_station(&station, policy, now);
    Station { status, ..station }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// A fixed "now" used across all tests: 2025-10-15 06:20:00 UTC.
    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 6, 20, 0).unwrap()
    }

    fn reading(level: f64, age: Duration) -> Reading {
        Reading {
            timestamp: fixed_now() - age,
            water_level: level,
            change_1h: 0.5,
            change_24h: 2.3,
            battery_pct: 85.0,
            rssi_dbm: -72.0,
        }
    }

    fn ganges_thresholds() -> Thresholds {
        Thresholds { warning: 72.0, danger: 75.0 }
    }

    // --- Worked example -----------------------------------------------------

    #[test]
    fn test_ganges_reading_above_warning_is_warning() {
        let status = classify(
            &reading(72.8, Duration::minutes(5)),
            &ganges_thresholds(),
            &ClassificationPolicy::default(),
            fixed_now(),
        );
        assert_eq!(status, StationStatus::Warning);
    }

    #[test]
    fn test_ganges_reading_at_danger_is_danger() {
        let status = classify(
            &reading(75.0, Duration::minutes(5)),
            &ganges_thresholds(),
            &ClassificationPolicy::default(),
            fixed_now(),
        );
        assert_eq!(status, StationStatus::Danger);
    }

    #[test]
    fn test_ganges_reading_seven_hours_old_is_offline() {
        for level in [10.0, 72.8, 75.0, 120.0] {
            let status = classify(
                &reading(level, Duration::hours(7)),
                &ganges_thresholds(),
                &ClassificationPolicy::default(),
                fixed_now(),
            );
            assert_eq!(status, StationStatus::Offline, "level {} should not matter", level);
        }
    }

    // --- Boundaries ---------------------------------------------------------

    #[test]
    fn test_level_exactly_at_warning_is_warning() {
        let status = classify(
            &reading(72.0, Duration::minutes(1)),
            &ganges_thresholds(),
            &ClassificationPolicy::default(),
            fixed_now(),
        );
        assert_eq!(status, StationStatus::Warning, "warning boundary is inclusive");
    }

    #[test]
    fn test_level_just_below_warning_is_normal() {
        let status = classify(
            &reading(71.99, Duration::minutes(1)),
            &ganges_thresholds(),
            &ClassificationPolicy::default(),
            fixed_now(),
        );
        assert_eq!(status, StationStatus::Normal);
    }

    #[test]
    fn test_reading_exactly_at_tolerance_is_not_offline() {
        let status = classify(
            &reading(10.0, Duration::hours(6)),
            &ganges_thresholds(),
            &ClassificationPolicy::default(),
            fixed_now(),
        );
        assert_eq!(status, StationStatus::Normal, "offline is strictly greater than tolerance");
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let r = reading(73.0, Duration::minutes(-30));
        assert_eq!(reading_age(&r, fixed_now()), Duration::zero());
        assert!(!is_offline_at(&r, Duration::hours(6), fixed_now()));
    }

    // --- Policy -------------------------------------------------------------

    #[test]
    fn test_offsets_shift_effective_thresholds() {
        let policy = ClassificationPolicy {
            warning_offset: 1.0,
            danger_offset: -0.5,
            ..ClassificationPolicy::default()
        };
        let r = reading(72.8, Duration::minutes(5));
        assert_eq!(classify(&r, &ganges_thresholds(), &policy, fixed_now()), StationStatus::Normal);

        let r = reading(74.5, Duration::minutes(5));
        assert_eq!(classify(&r, &ganges_thresholds(), &policy, fixed_now()), StationStatus::Danger);
    }

    #[test]
    fn test_tighter_tolerance_marks_station_offline_sooner() {
        let policy = ClassificationPolicy {
            offline_after: Duration::minutes(30),
            ..ClassificationPolicy::default()
        };
        let r = reading(10.0, Duration::minutes(45));
        assert_eq!(classify(&r, &ganges_thresholds(), &policy, fixed_now()), StationStatus::Offline);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let r = reading(73.4, Duration::minutes(12));
        let policy = ClassificationPolicy::default();
        let first = classify(&r, &ganges_thresholds(), &policy, fixed_now());
        let second = classify(&r, &ganges_thresholds(), &policy, fixed_now());
        assert_eq!(first, second);
    }

    #[test]
    fn test_with_derived_status_overrides_backend_status() {
        let station = Station {
            id: "ST002".to_string(),
            name: "Ganges Monitoring Point".to_string(),
            location: crate::model::GeoPoint { lat: 25.3176, lng: 83.0064 },
            basin: "Ganges".to_string(),
            status: StationStatus::Normal, // stale backend claim
            last_reading: reading(75.2, Duration::minutes(5)),
            thresholds: ganges_thresholds(),
        };
        let derived = with_derived_status(station.clone(), &ClassificationPolicy::default(), fixed_now());
        assert_eq!(derived.status, StationStatus::Danger);
        assert_eq!(derived.last_reading, station.last_reading, "reading carried over unchanged");
    }
}
