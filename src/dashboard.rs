/// Top-level dashboard state container.
///
/// Owns the station/alert/basin collections and is their only writer:
/// station snapshots arrive from the `TelemetrySource` subscription,
/// alerts and basins are read on `refresh()`. Everything else (the HTTP
/// surface, tests) reads copies and submits intents: filter changes,
/// acknowledgements, viewport moves and overlay toggles.
///
/// Lifecycle is explicit. `start()` loads alerts/basins and subscribes to
/// the station path; `stop()` drops the subscription and cancels overlay
/// work; `set_station_path()` resubscribes. Each subscription carries an
/// epoch, and snapshots from an older epoch are discarded, as is any live
/// snapshot whose sequence is not newer than the last one applied.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::alert::acknowledge::{AckPolicy, AckState, AckWorkflow};
use crate::alert::classify::{with_derived_status, ClassificationPolicy};
use crate::analysis::kpi::{self, AlertTally, ArrivalLedger, BasinSla, PowerHealth, SignalHealth, SystemStatus};
use crate::analysis::rankings::{self, ChangeWindow, Mover};
use crate::config::DashboardConfig;
use crate::filter::{self, RegionFilter, StatusFilter};
use crate::logging::{self, Component};
use crate::model::{AckError, Alert, BasinSummary, Bounds, Station, TelemetryError};
use crate::overlay::{OverlayFetcher, OverlayView, PendingFetch};
use crate::telemetry::source::{SnapshotOrigin, StationSnapshot, Subscription, TelemetrySource};

/// Wall-clock source. Tests inject a fixed instant.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Construction options not carried by the config file.
#[derive(Debug, Clone)]
pub struct DashboardOptions {
    pub policy: ClassificationPolicy,
    pub ack_policy: AckPolicy,
    pub station_path: String,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        DashboardOptions {
            policy: ClassificationPolicy::default(),
            ack_policy: AckPolicy::default(),
            station_path: "stations".to_string(),
        }
    }
}

#[derive(Default)]
struct Store {
    epoch: u64,
    last_sequence: u64,
    origin: Option<SnapshotOrigin>,
    stations: Vec<Station>,
    /// Full alert collection as last read, acknowledged ones included.
    alerts: Vec<Alert>,
    basins: Vec<BasinSummary>,
    last_error: Option<String>,
    region: RegionFilter,
    status: StatusFilter,
}

impl Store {
    fn accepts(&self, epoch: u64, snapshot: &StationSnapshot) -> bool {
        epoch == self.epoch
            && (snapshot.sequence > self.last_sequence
                || (snapshot.sequence == 0 && self.last_sequence == 0))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the summary panels show, computed at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub generated_at: DateTime<Utc>,
    pub live: bool,
    pub system: SystemStatus,
    pub signal: SignalHealth,
    pub power: PowerHealth,
    pub alerts: AlertTally,
    pub top_movers: Vec<Mover>,
    pub latest_stations: Vec<Station>,
    pub basin_trends: Vec<BasinSummary>,
    pub basin_sla: Vec<BasinSla>,
}

pub struct Dashboard {
    source: TelemetrySource,
    overlay: OverlayFetcher,
    acks: AckWorkflow,
    policy: ClassificationPolicy,
    clock: Clock,
    ledger: Arc<ArrivalLedger>,
    store: Arc<Mutex<Store>>,
    station_path: Mutex<String>,
    subscription: Mutex<Option<Subscription>>,
}

impl Dashboard {
    pub fn new(source: TelemetrySource, overlay: OverlayFetcher, options: DashboardOptions, clock: Clock) -> Self {
        let acks = AckWorkflow::new(source.backend(), options.ack_policy, Vec::new());
        Dashboard {
            source,
            overlay,
            acks,
            policy: options.policy,
            clock,
            ledger: Arc::new(ArrivalLedger::default()),
            store: Arc::new(Mutex::new(Store::default())),
            station_path: Mutex::new(options.station_path),
            subscription: Mutex::new(None),
        }
    }

    /// Wires the telemetry source and overlay from configuration. Not
    /// started yet.
    pub fn from_config(config: &DashboardConfig, clock: Clock) -> Result<Dashboard, TelemetryError> {
        let source = TelemetrySource::from_settings(&config.telemetry, clock())?;
        let overlay = OverlayFetcher::from_settings(&config.overlay);
        let options = DashboardOptions {
            policy: config.classification.policy(),
            ack_policy: AckPolicy::default(),
            station_path: config.telemetry.station_path.clone(),
        };
        Ok(Dashboard::new(source, overlay, options, clock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn start(&self) {
        self.refresh();
        self.subscribe();
        logging::info(Component::System, None, "dashboard started");
    }

    pub fn stop(&self) {
        let previous = lock(&self.subscription).take();
        if let Some(subscription) = previous {
            subscription.unsubscribe();
        }
        lock(&self.store).epoch += 1;
        self.overlay.cancel();
        logging::info(Component::System, None, "dashboard stopped");
    }

    pub fn is_started(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    pub fn station_path(&self) -> String {
        lock(&self.station_path).clone()
    }

    /// Switches the station collection to `path`. Resubscribes only when
    /// started and the path actually changed.
    pub fn set_station_path(&self, path: &str) {
        {
            let mut current = lock(&self.station_path);
            if *current == path {
                return;
            }
            *current = path.to_string();
        }
        if self.is_started() {
            self.subscribe();
        }
    }

    fn subscribe(&self) {
        let path = self.station_path();
        let epoch = {
            let mut store = lock(&self.store);
            store.epoch += 1;
            store.last_sequence = 0;
            store.epoch
        };

        let previous = lock(&self.subscription).take();
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        let applier = SnapshotApplier {
            store: Arc::downgrade(&self.store),
            ledger: Arc::clone(&self.ledger),
            policy: self.policy.clone(),
            clock: Arc::clone(&self.clock),
            epoch,
        };
        let errors = Arc::downgrade(&self.store);
        let error_path = path.clone();

        let subscription = self.source.subscribe_stations(
            &path,
            move |snapshot| applier.apply(snapshot),
            move |err| {
                logging::warn(Component::Telemetry, Some(&error_path), &err.to_string());
                if let Some(store) = errors.upgrade() {
                    let mut store = lock(&store);
                    if store.epoch == epoch {
                        store.last_error = Some(err.to_string());
                    }
                }
            },
        );
        *lock(&self.subscription) = Some(subscription);
    }

    /// Re-reads alerts and basin summaries.
    pub fn refresh(&self) {
        let alerts = self.source.load_alerts();
        let basins = self.source.load_basins();
        let error = alerts.error.clone().or_else(|| basins.error.clone());

        self.acks.replace_alerts(alerts.value.clone());
        let mut store = lock(&self.store);
        store.alerts = alerts.value;
        store.basins = basins.value;
        if let Some(err) = error {
            store.last_error = Some(err.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current stations with status re-derived against the clock.
    pub fn stations(&self) -> Vec<Station> {
        let now = self.now();
        lock(&self.store)
            .stations
            .iter()
            .cloned()
            .map(|s| with_derived_status(s, &self.policy, now))
            .collect()
    }

    /// Stations passing the current region and status filters.
    pub fn visible_stations(&self) -> Vec<Station> {
        let (region, status) = self.filters();
        filter::filter_stations(&self.stations(), &region, &status)
    }

    pub fn station(&self, id: &str) -> Option<Station> {
        self.stations().into_iter().find(|s| s.id == id)
    }

    pub fn region_options(&self) -> Vec<String> {
        filter::region_options(&lock(&self.store).stations)
    }

    pub fn basins(&self) -> Vec<BasinSummary> {
        lock(&self.store).basins.clone()
    }

    /// Every alert last read from the source, acknowledged ones included.
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.store).alerts.clone()
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        self.acks.open_alerts()
    }

    pub fn open_alert_count(&self) -> usize {
        self.acks.open_count()
    }

    pub fn alert_state(&self, alert_id: &str) -> Option<AckState> {
        self.acks.state_of(alert_id)
    }

    /// True while the station data comes from a live channel.
    pub fn is_live(&self) -> bool {
        self.source.is_live(&self.station_path())
    }

    pub fn snapshot_origin(&self) -> Option<SnapshotOrigin> {
        lock(&self.store).origin
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.store).last_error.clone()
    }

    pub fn summary(&self) -> DashboardSummary {
        let now = self.now();
        let stations = self.stations();
        let (alerts, basins) = {
            let store = lock(&self.store);
            (store.alerts.clone(), store.basins.clone())
        };
        let metrics: &dyn kpi::DeliveryMetrics = self.ledger.as_ref();

        DashboardSummary {
            generated_at: now,
            live: self.is_live(),
            system: kpi::system_status(&stations, &alerts, Some(metrics), now),
            signal: kpi::signal_health(&stations),
            power: kpi::power_health(&stations),
            alerts: kpi::alert_tally(&alerts),
            top_movers: rankings::top_movers(&stations, ChangeWindow::Day, rankings::DEFAULT_TOP_MOVERS),
            latest_stations: rankings::latest_stations(&stations, rankings::DEFAULT_LATEST_STATIONS),
            basin_trends: rankings::basin_trends(&basins, rankings::DEFAULT_BASIN_TRENDS),
            basin_sla: kpi::basin_sla(&basins, Some(metrics), now),
        }
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    pub fn filters(&self) -> (RegionFilter, StatusFilter) {
        let store = lock(&self.store);
        (store.region.clone(), store.status.clone())
    }

    pub fn set_region(&self, region: RegionFilter) {
        lock(&self.store).region = region;
    }

    pub fn set_status_filter(&self, status: StatusFilter) {
        lock(&self.store).status = status;
    }

    /// Acknowledges an alert through the workflow and mirrors a confirmed
    /// acknowledgement into the alert collection.
    pub fn acknowledge(&self, alert_id: &str) -> Result<bool, AckError> {
        let acknowledged = self.acks.acknowledge(alert_id)?;
        if acknowledged {
            let mut store = lock(&self.store);
            if let Some(alert) = store.alerts.iter_mut().find(|a| a.id == alert_id) {
                alert.acknowledged = true;
            }
        }
        Ok(acknowledged)
    }

    pub fn overlay(&self) -> &OverlayFetcher {
        &self.overlay
    }

    /// Publishes the map viewport to the overlay.
    pub fn set_viewport(&self, bounds: Bounds) -> Option<PendingFetch> {
        self.overlay.set_bounds(bounds)
    }

    pub fn set_overlay_visible(&self, visible: bool) -> Option<PendingFetch> {
        self.overlay.set_visible(visible)
    }

    pub fn overlay_view(&self) -> OverlayView {
        self.overlay.view()
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        self.overlay.cancel();
    }
}

/// Applies snapshots for one subscription epoch.
struct SnapshotApplier {
    store: Weak<Mutex<Store>>,
    ledger: Arc<ArrivalLedger>,
    policy: ClassificationPolicy,
    clock: Clock,
    epoch: u64,
}

impl SnapshotApplier {
    fn apply(&self, snapshot: StationSnapshot) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let now = (self.clock)();
        let mut store = lock(&store);
        if !store.accepts(self.epoch, &snapshot) {
            logging::debug(
                Component::Telemetry,
                None,
                &format!("discarded snapshot #{} (epoch {})", snapshot.sequence, self.epoch),
            );
            return;
        }

        let stations: Vec<Station> = snapshot
            .stations
            .iter()
            .cloned()
            .map(|s| with_derived_status(s, &self.policy, now))
            .collect();
        if snapshot.origin == SnapshotOrigin::Live {
            self.ledger.record(&stations, now);
            store.last_error = None;
        }

        store.stations = stations;
        store.last_sequence = snapshot.sequence;
        store.origin = Some(snapshot.origin);
    }
}
