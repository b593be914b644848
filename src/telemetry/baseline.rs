//! Baseline dataset: the fixed station/alert/basin collection served when
//! no live telemetry is configured or the live connection fails.
//!
//! The dataset is embedded at compile time from `data/baseline.json`.
//! Its timestamps are historical, so `Dataset::rebased_to` shifts them
//! forward so the newest reading lands on "now" while every relative age
//! is preserved. Classification of the rebased data reproduces the
//! statuses recorded in the file (the Cauvery station trails the rest by
//! more than the offline tolerance).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::{Alert, BasinSummary, Station, TelemetryError};
use crate::telemetry::TelemetryBackend;

const BASELINE_JSON: &str = include_str!("../../data/baseline.json");

/// A complete telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Dataset {
    pub stations: Vec<Station>,
    pub alerts: Vec<Alert>,
    pub basins: Vec<BasinSummary>,
}

impl Dataset {
    /// Parses the embedded baseline dataset, timestamps as recorded.
    pub fn baseline() -> Result<Dataset, TelemetryError> {
        Dataset::from_json(BASELINE_JSON)
    }

    pub fn from_json(json: &str) -> Result<Dataset, TelemetryError> {
        serde_json::from_str(json)
            .map_err(|e| TelemetryError::Decode(format!("baseline dataset: {}", e)))
    }

    /// Timestamp of the most recent station reading, if any.
    pub fn newest_reading(&self) -> Option<DateTime<Utc>> {
        self.stations.iter().map(|s| s.last_reading.timestamp).max()
    }

    /// Shifts every station and alert timestamp by the same amount so the
    /// newest reading equals `now`.
    pub fn rebased_to(mut self, now: DateTime<Utc>) -> Dataset {
        let Some(newest) = self.newest_reading() else {
            return self;
        };
        let shift = now - newest;

        for station in &mut self.stations {
            station.last_reading.timestamp += shift;
        }
        for alert in &mut self.alerts {
            alert.timestamp += shift;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Fixture-backed TelemetryBackend
// ---------------------------------------------------------------------------

/// In-memory backend over a `Dataset`. Each instance owns its own copy.
pub struct FixtureBackend {
    data: Mutex<Dataset>,
}

impl FixtureBackend {
    pub fn new(dataset: Dataset) -> Self {
        FixtureBackend { data: Mutex::new(dataset) }
    }

    /// Backend over the embedded baseline, rebased to `now`.
    pub fn baseline_at(now: DateTime<Utc>) -> Result<Self, TelemetryError> {
        Ok(FixtureBackend::new(Dataset::baseline()?.rebased_to(now)))
    }

    /// Copy of the current dataset.
    pub fn snapshot(&self) -> Dataset {
        self.data().clone()
    }

    fn data(&self) -> MutexGuard<'_, Dataset> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetryBackend for FixtureBackend {
    fn list_stations(&self) -> Result<Vec<Station>, TelemetryError> {
        Ok(self.data().stations.clone())
    }

    fn get_station(&self, id: &str) -> Result<Option<Station>, TelemetryError> {
        Ok(self.data().stations.iter().find(|s| s.id == id).cloned())
    }

    fn list_alerts(&self, include_acknowledged: bool) -> Result<Vec<Alert>, TelemetryError> {
        Ok(self
            .data()
            .alerts
            .iter()
            .filter(|a| include_acknowledged || !a.acknowledged)
            .cloned()
            .collect())
    }

    fn list_basins(&self) -> Result<Vec<BasinSummary>, TelemetryError> {
        Ok(self.data().basins.clone())
    }

    fn acknowledge(&self, alert_id: &str) -> Result<bool, TelemetryError> {
        let mut data = self.data();
        match data.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) if !alert.acknowledged => {
                alert.acknowledged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::classify::{classify_station, ClassificationPolicy};
    use chrono::{Duration, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_baseline_parses() {
        let data = Dataset::baseline().expect("embedded baseline should parse");
        assert_eq!(data.stations.len(), 6);
        assert_eq!(data.alerts.len(), 3);
        assert_eq!(data.basins.len(), 6);
    }

    #[test]
    fn test_rebase_moves_newest_reading_to_now() {
        let data = Dataset::baseline().unwrap().rebased_to(fixed_now());
        assert_eq!(data.newest_reading(), Some(fixed_now()));
    }

    #[test]
    fn test_rebase_preserves_relative_ages() {
        let original = Dataset::baseline().unwrap();
        let rebased = original.clone().rebased_to(fixed_now());

        let gap = |d: &Dataset| {
            let ganges = d.stations.iter().find(|s| s.id == "ST002").unwrap();
            let cauvery = d.stations.iter().find(|s| s.id == "ST006").unwrap();
            ganges.last_reading.timestamp - cauvery.last_reading.timestamp
        };
        assert_eq!(gap(&original), gap(&rebased));
        assert_eq!(gap(&rebased), Duration::minutes(11 * 60 + 30));
    }

    #[test]
    fn test_rebased_baseline_classifies_to_recorded_statuses() {
        let data = Dataset::baseline().unwrap().rebased_to(fixed_now());
        let policy = ClassificationPolicy::default();
        for station in &data.stations {
            assert_eq!(
                classify_station(station, &policy, fixed_now()),
                station.status,
                "{} should classify to its recorded status",
                station.id
            );
        }
    }

    #[test]
    fn test_fixture_lists_only_open_alerts_by_default() {
        let backend = FixtureBackend::baseline_at(fixed_now()).unwrap();
        let open = backend.list_alerts(false).unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|a| !a.acknowledged));
        assert_eq!(backend.list_alerts(true).unwrap().len(), 3);
    }

    #[test]
    fn test_fixture_get_station() {
        let backend = FixtureBackend::baseline_at(fixed_now()).unwrap();
        let station = backend.get_station("ST003").unwrap().expect("ST003 exists");
        assert_eq!(station.basin, "Brahmaputra");
        assert!(backend.get_station("ST999").unwrap().is_none());
    }

    #[test]
    fn test_fixture_acknowledge_is_one_way() {
        let backend = FixtureBackend::baseline_at(fixed_now()).unwrap();
        assert_eq!(backend.acknowledge("AL002"), Ok(true));
        assert_eq!(backend.acknowledge("AL002"), Ok(false), "second ack is a no-op");
        assert_eq!(backend.acknowledge("AL003"), Ok(false), "already acknowledged in fixture");
        assert_eq!(backend.acknowledge("AL999"), Ok(false), "unknown id");
        assert_eq!(backend.list_alerts(false).unwrap().len(), 1);
    }

    #[test]
    fn test_fixture_instances_do_not_share_state() {
        let a = FixtureBackend::baseline_at(fixed_now()).unwrap();
        let b = FixtureBackend::baseline_at(fixed_now()).unwrap();
        a.acknowledge("AL001").unwrap();
        assert_eq!(b.list_alerts(false).unwrap().len(), 2);
    }
}
