/// Fleet-level KPIs and health distributions for the dashboard panels.
///
/// Everything here is derived from the (already classified) station and
/// alert collections plus the clock. The 7-day data delivery rate is not
/// derivable from a single snapshot; it comes from a `DeliveryMetrics`
/// collaborator and is `None` when none is attached.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::model::{Alert, AlertKind, BasinSummary, Station, StationStatus};

/// Trailing window for the headline delivery rate.
pub const DELIVERY_WINDOW_DAYS: i64 = 7;

/// Reporting interval stations are expected to keep.
pub const DEFAULT_EXPECTED_INTERVAL_MINUTES: i64 = 15;

// ---------------------------------------------------------------------------
// System status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub total_stations: usize,
    /// Everything not Offline.
    pub active_stations: usize,
    pub warning_stations: usize,
    pub danger_stations: usize,
    pub offline_stations: usize,
    pub alerts_last_24h: usize,
    /// Percent of expected readings received over the last 7 days.
    pub data_delivery_rate_7d: Option<f64>,
}

impl SystemStatus {
    /// Share of stations not Offline, in percent. 0 for an empty fleet.
    pub fn operational_percent(&self) -> f64 {
        if self.total_stations == 0 {
            0.0
        } else {
            self.active_stations as f64 * 100.0 / self.total_stations as f64
        }
    }
}

fn count_status(stations: &[Station], status: StationStatus) -> usize {
    stations.iter().filter(|s| s.status == status).count()
}

pub fn system_status(
    stations: &[Station],
    alerts: &[Alert],
    metrics: Option<&dyn DeliveryMetrics>,
    now: DateTime<Utc>,
) -> SystemStatus {
    let offline = count_status(stations, StationStatus::Offline);
    let since = now - Duration::hours(24);

    SystemStatus {
        total_stations: stations.len(),
        active_stations: stations.len() - offline,
        warning_stations: count_status(stations, StationStatus::Warning),
        danger_stations: count_status(stations, StationStatus::Danger),
        offline_stations: offline,
        alerts_last_24h: alerts.iter().filter(|a| a.timestamp >= since && a.timestamp <= now).count(),
        data_delivery_rate_7d: metrics
            .and_then(|m| m.delivery_rate(None, Duration::days(DELIVERY_WINDOW_DAYS), now)),
    }
}

// ---------------------------------------------------------------------------
// Station health
// ---------------------------------------------------------------------------

/// Signal-strength distribution. Offline stations are counted apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalHealth {
    /// > -65 dBm
    pub excellent: usize,
    /// > -75 dBm
    pub good: usize,
    /// > -85 dBm
    pub fair: usize,
    pub poor: usize,
    pub offline: usize,
}

pub fn signal_health(stations: &[Station]) -> SignalHealth {
    let mut health = SignalHealth::default();
    for station in stations {
        if station.status == StationStatus::Offline {
            health.offline += 1;
            continue;
        }
        let rssi = station.last_reading.rssi_dbm;
        if rssi > -65.0 {
            health.excellent += 1;
        } else if rssi > -75.0 {
            health.good += 1;
        } else if rssi > -85.0 {
            health.fair += 1;
        } else {
            health.poor += 1;
        }
    }
    health
}

/// Battery distribution over stations that are not Offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PowerHealth {
    /// > 80 %
    pub high: usize,
    /// > 50 %
    pub medium: usize,
    /// > 20 %
    pub low: usize,
    pub critical: usize,
}

pub fn power_health(stations: &[Station]) -> PowerHealth {
    let mut health = PowerHealth::default();
    for station in stations.iter().filter(|s| s.status != StationStatus::Offline) {
        let battery = station.last_reading.battery_pct;
        if battery > 80.0 {
            health.high += 1;
        } else if battery > 50.0 {
            health.medium += 1;
        } else if battery > 20.0 {
            health.low += 1;
        } else {
            health.critical += 1;
        }
    }
    health
}

// ---------------------------------------------------------------------------
// Alert tallies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertTally {
    pub open: usize,
    pub acknowledged: usize,
    /// Open alerts per type.
    pub open_by_type: BTreeMap<String, usize>,
}

pub fn alert_tally(alerts: &[Alert]) -> AlertTally {
    let mut tally = AlertTally::default();
    for kind in AlertKind::ALL {
        tally.open_by_type.insert(format!("{:?}", kind), 0);
    }
    for alert in alerts {
        if alert.acknowledged {
            tally.acknowledged += 1;
        } else {
            tally.open += 1;
            *tally.open_by_type.entry(format!("{:?}", alert.kind)).or_insert(0) += 1;
        }
    }
    tally
}

// ---------------------------------------------------------------------------
// Delivery metrics
// ---------------------------------------------------------------------------

/// Source of data-delivery figures.
pub trait DeliveryMetrics: Send + Sync {
    /// Percent (0-100) of expected readings received in the trailing
    /// `window` ending at `now`, for one basin or (`None`) the whole fleet.
    /// `None` when nothing was expected.
    fn delivery_rate(&self, basin: Option<&str>, window: Duration, now: DateTime<Utc>) -> Option<f64>;
}

/// SLA band for a delivery rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlaBand {
    /// >= 95 %
    Met,
    /// >= 85 %
    AtRisk,
    Breached,
}

impl SlaBand {
    pub fn for_rate(percent: f64) -> SlaBand {
        if percent >= 95.0 {
            SlaBand::Met
        } else if percent >= 85.0 {
            SlaBand::AtRisk
        } else {
            SlaBand::Breached
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasinSla {
    pub basin: String,
    pub delivery_rate_7d: Option<f64>,
    pub band: Option<SlaBand>,
}

pub fn basin_sla(
    basins: &[BasinSummary],
    metrics: Option<&dyn DeliveryMetrics>,
    now: DateTime<Utc>,
) -> Vec<BasinSla> {
    basins
        .iter()
        .map(|basin| {
            let rate = metrics.and_then(|m| {
                m.delivery_rate(Some(&basin.name), Duration::days(DELIVERY_WINDOW_DAYS), now)
            });
            BasinSla {
                basin: basin.name.clone(),
                delivery_rate_7d: rate,
                band: rate.map(SlaBand::for_rate),
            }
        })
        .collect()
}

/// Delivery metrics built from the readings actually observed.
///
/// Every distinct reading timestamp seen for a station counts as one
/// delivered reading; a station is expected to report once per
/// `expected_interval`. Expectations start at the first reading the ledger
/// saw for a station, so a freshly started ledger is not charged for
/// readings from before it existed. Readings older than `retention` are
/// dropped as new ones are recorded.
pub struct ArrivalLedger {
    expected_interval: Duration,
    retention: Duration,
    stations: Mutex<HashMap<String, StationArrivals>>,
}

struct StationArrivals {
    basin: String,
    /// Earliest reading ever recorded; survives pruning.
    first_seen: DateTime<Utc>,
    readings: HashSet<DateTime<Utc>>,
}

impl ArrivalLedger {
    pub fn new(expected_interval: Duration) -> Self {
        ArrivalLedger {
            expected_interval: expected_interval.max(Duration::minutes(1)),
            retention: Duration::days(DELIVERY_WINDOW_DAYS),
            stations: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps readings for `retention` instead of the delivery window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention.max(self.expected_interval);
        self
    }

    /// Records the latest reading of every station in a snapshot and drops
    /// readings that fell out of retention at `now`.
    pub fn record(&self, stations: &[Station], now: DateTime<Utc>) {
        let mut ledger = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        for station in stations {
            let timestamp = station.last_reading.timestamp;
            let entry = ledger.entry(station.id.clone()).or_insert_with(|| StationArrivals {
                basin: station.basin.clone(),
                first_seen: timestamp,
                readings: HashSet::new(),
            });
            entry.basin = station.basin.clone();
            entry.first_seen = entry.first_seen.min(timestamp);
            entry.readings.insert(timestamp);
        }

        let cutoff = now - self.retention;
        for arrivals in ledger.values_mut() {
            arrivals.readings.retain(|t| *t >= cutoff);
        }
    }
}

impl Default for ArrivalLedger {
    fn default() -> Self {
        ArrivalLedger::new(Duration::minutes(DEFAULT_EXPECTED_INTERVAL_MINUTES))
    }
}

impl DeliveryMetrics for ArrivalLedger {
    fn delivery_rate(&self, basin: Option<&str>, window: Duration, now: DateTime<Utc>) -> Option<f64> {
        let ledger = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        let interval = self.expected_interval.num_seconds();
        let per_window = (window.num_seconds() / interval).max(1);

        let mut expected = 0i64;
        let mut received = 0i64;
        for arrivals in ledger.values().filter(|a| basin.is_none_or(|b| a.basin == b)) {
            let start = (now - window).max(arrivals.first_seen);
            if start > now {
                continue;
            }
            // One reading due at `start`, then one per interval up to `now`.
            let due = ((now - start).num_seconds() / interval + 1).min(per_window);
            let got = arrivals.readings.iter().filter(|t| **t >= start && **t <= now).count() as i64;
            expected += due;
            received += got.min(due);
        }

        (expected > 0).then(|| received as f64 * 100.0 / expected as f64)
    }
}
