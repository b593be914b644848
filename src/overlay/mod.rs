//! Viewport-driven water-body overlay.
//!
//! `OverlayFetcher` keeps the overlay in step with the map viewport. Every
//! request takes a fresh generation number; a result is applied only if
//! its generation is still the latest when it completes. Results for
//! superseded viewports resolve to `FetchOutcome::Superseded` and never
//! touch overlay state, whatever order the responses arrive in. Requests
//! still queued when superseded are skipped before they reach the network;
//! a request already on the wire is abandoned, so a hung call never holds a
//! fetch worker once a newer viewport, a toggle-off or teardown replaces it.
//!
//! Toggling the overlay off clears it and cancels outstanding work;
//! toggling it on, or moving the viewport materially, refetches from
//! scratch. A missing feature service is a permanent capability flag, not
//! an error.

pub mod arcgis;
pub mod properties;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use threadpool::ThreadPool;

use crate::config::OverlaySettings;
use crate::logging::{self, Component};
use crate::model::{Bounds, OverlayError};
use crate::overlay::arcgis::ArcGisFeatureService;
use crate::overlay::properties::WaterBodyDetails;

/// Shown when a fetch genuinely fails.
pub const FETCH_FAILED_MESSAGE: &str = "Unable to load water bodies for this view";

/// How often a worker waiting on a query checks whether it was superseded.
const SUPERSEDE_POLL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// GeoJSON model
// ---------------------------------------------------------------------------

/// A GeoJSON feature collection as returned by a feature layer query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    /// Always "FeatureCollection"
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub features: Vec<Feature>,

    /// Layer-level metadata (e.g. `exceededTransferLimit`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl FeatureCollection {
    pub fn empty() -> Self {
        FeatureCollection { type_: "FeatureCollection".to_string(), features: Vec::new(), properties: None }
    }

    /// Validate the response structure.
    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.type_ != "FeatureCollection" {
            return Err(OverlayError::Decode(format!(
                "expected type 'FeatureCollection', got '{}'",
                self.type_
            )));
        }
        if let Some(bad) = self.features.iter().find(|f| f.type_ != "Feature") {
            return Err(OverlayError::Decode(format!("expected type 'Feature', got '{}'", bad.type_)));
        }
        Ok(())
    }

    /// The service says it truncated the result.
    pub fn exceeded_transfer_limit(&self) -> bool {
        self.properties
            .as_ref()
            .and_then(|p| p.get("exceededTransferLimit"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One water body: opaque geometry plus a heterogeneous property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Always "Feature"
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default)]
    pub geometry: Option<Value>,

    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    /// Display fields with fallbacks applied.
    pub fn details(&self) -> WaterBodyDetails {
        match &self.properties {
            Some(properties) => WaterBodyDetails::from_properties(properties),
            None => WaterBodyDetails::from_properties(&Map::new()),
        }
    }
}

/// Feature query endpoint.
pub trait FeatureService: Send + Sync {
    /// Every feature intersecting `bounds`, at most `max_features`.
    fn query(&self, bounds: &Bounds, max_features: u32) -> Result<FeatureCollection, OverlayError>;
}

// ---------------------------------------------------------------------------
// Fetch handles
// ---------------------------------------------------------------------------

/// How a fetch ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The result is now the overlay.
    Applied(Arc<FeatureCollection>),
    /// A newer request, a toggle-off or teardown replaced this one.
    Superseded,
}

/// Completion of one overlay fetch.
pub struct PendingFetch {
    generation: u64,
    result: Receiver<Result<FetchOutcome, OverlayError>>,
}

impl PendingFetch {
    fn settled(generation: u64, result: Result<FetchOutcome, OverlayError>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        PendingFetch { generation, result: rx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Blocks until the fetch settles.
    pub fn wait(self) -> Result<FetchOutcome, OverlayError> {
        self.result
            .recv()
            .unwrap_or_else(|_| Err(OverlayError::Network("fetch worker stopped".to_string())))
    }

    /// Like `wait`, giving up after `timeout`. `None` means still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FetchOutcome, OverlayError>> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(OverlayError::Network("fetch worker stopped".to_string())))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Overlay state
// ---------------------------------------------------------------------------

/// Read-only view of the overlay for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayView {
    /// A feature service is configured.
    pub available: bool,
    pub visible: bool,
    pub loading: bool,
    /// Viewport the current data (or current request) belongs to.
    pub bounds: Option<Bounds>,
    pub feature_count: usize,
    /// The result hit the record cap; nothing beyond it was fetched.
    pub partial: bool,
    pub error: Option<String>,
    #[serde(skip)]
    pub features: Option<Arc<FeatureCollection>>,
}

#[derive(Default)]
struct OverlayState {
    generation: u64,
    visible: bool,
    loading: bool,
    /// Latest viewport published by the map.
    viewport: Option<Bounds>,
    /// Viewport of the latest issued request.
    requested: Option<Bounds>,
    data: Option<Arc<FeatureCollection>>,
    partial: bool,
    error: Option<String>,
}

impl OverlayState {
    /// Invalidates every outstanding request.
    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.loading = false;
        self.generation
    }

    fn clear(&mut self) {
        self.data = None;
        self.partial = false;
        self.error = None;
    }
}

fn lock(state: &Mutex<OverlayState>) -> MutexGuard<'_, OverlayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub struct OverlayFetcher {
    service: Option<Arc<dyn FeatureService>>,
    max_features: u32,
    min_delta_deg: f64,
    pool: Mutex<ThreadPool>,
    state: Arc<Mutex<OverlayState>>,
}

impl OverlayFetcher {
    pub fn new(service: Option<Arc<dyn FeatureService>>, settings: &OverlaySettings) -> Self {
        OverlayFetcher {
            service,
            max_features: settings.result_record_count.max(1),
            min_delta_deg: settings.min_viewport_delta_deg.max(0.0),
            pool: Mutex::new(ThreadPool::with_name("overlay".to_string(), settings.workers.max(1))),
            state: Arc::new(Mutex::new(OverlayState::default())),
        }
    }

    /// Uses the configured feature layer, or none if the URL is absent.
    pub fn from_settings(settings: &OverlaySettings) -> Self {
        let service: Option<Arc<dyn FeatureService>> = match settings.feature_service_url.as_deref() {
            None => None,
            Some(url) => match ArcGisFeatureService::new(url) {
                Ok(service) => {
                    logging::info(Component::Overlay, None, &format!("feature layer {}", service.base_url()));
                    Some(Arc::new(service))
                }
                Err(e) => {
                    logging::warn(Component::Overlay, None, &format!("overlay disabled: {}", e));
                    None
                }
            },
        };
        if service.is_none() {
            logging::info(Component::Overlay, None, "no feature service configured, overlay unavailable");
        }
        OverlayFetcher::new(service, settings)
    }

    /// False means the overlay toggle should be disabled.
    pub fn is_available(&self) -> bool {
        self.service.is_some()
    }

    /// Fetches features for `bounds`, superseding any request in flight.
    pub fn fetch_for_bounds(&self, bounds: Bounds) -> PendingFetch {
        let Some(service) = &self.service else {
            return PendingFetch::settled(0, Err(OverlayError::NotConfigured));
        };
        if !bounds.is_valid() {
            return PendingFetch::settled(0, Err(OverlayError::InvalidBounds(bounds.envelope())));
        }

        let token = {
            let mut state = lock(&self.state);
            let token = state.bump();
            state.loading = true;
            state.requested = Some(bounds);
            state.error = None;
            token
        };
        logging::debug(Component::Overlay, None, &format!("fetch #{} for {}", token, bounds.envelope()));

        let (tx, rx) = mpsc::channel();
        let service = Arc::clone(service);
        let state = Arc::clone(&self.state);
        let max_features = self.max_features;

        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(move || {
                let _ = tx.send(run_fetch(service, &state, token, bounds, max_features));
            });

        PendingFetch { generation: token, result: rx }
    }

    /// Publishes a new map viewport. Refetches when the overlay is visible
    /// and the viewport moved materially.
    pub fn set_bounds(&self, bounds: Bounds) -> Option<PendingFetch> {
        let refetch = {
            let mut state = lock(&self.state);
            let material = state
                .viewport
                .is_none_or(|previous| previous.differs_materially(&bounds, self.min_delta_deg));
            if !material {
                return None;
            }
            state.viewport = Some(bounds);
            state.visible
        };
        (refetch && self.is_available()).then(|| self.fetch_for_bounds(bounds))
    }

    /// Shows or hides the overlay. Hiding clears it and cancels in-flight
    /// work; showing refetches for the current viewport.
    pub fn set_visible(&self, visible: bool) -> Option<PendingFetch> {
        let viewport = {
            let mut state = lock(&self.state);
            state.visible = visible;
            state.bump();
            state.clear();
            state.requested = None;
            state.viewport
        };
        if !visible {
            logging::debug(Component::Overlay, None, "overlay hidden");
            return None;
        }
        match viewport {
            Some(bounds) if self.is_available() => Some(self.fetch_for_bounds(bounds)),
            _ => None,
        }
    }

    /// Abandons any outstanding request without touching current data.
    pub fn cancel(&self) {
        lock(&self.state).bump();
    }

    pub fn view(&self) -> OverlayView {
        let state = lock(&self.state);
        let features = if state.visible { state.data.clone() } else { None };
        OverlayView {
            available: self.is_available(),
            visible: state.visible,
            loading: state.visible && state.loading,
            bounds: state.requested,
            feature_count: features.as_ref().map_or(0, |f| f.features.len()),
            partial: state.visible && state.partial,
            error: if state.visible { state.error.clone() } else { None },
            features,
        }
    }
}

impl Drop for OverlayFetcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_fetch(
    service: Arc<dyn FeatureService>,
    state: &Mutex<OverlayState>,
    token: u64,
    bounds: Bounds,
    max_features: u32,
) -> Result<FetchOutcome, OverlayError> {
    if lock(state).generation != token {
        return Ok(FetchOutcome::Superseded);
    }

    let Some(result) = query_until_superseded(service, state, token, bounds, max_features) else {
        logging::debug(Component::Overlay, None, &format!("fetch #{} abandoned", token));
        return Ok(FetchOutcome::Superseded);
    };

    let mut state = lock(state);
    if state.generation != token {
        logging::debug(Component::Overlay, None, &format!("fetch #{} superseded", token));
        return Ok(FetchOutcome::Superseded);
    }
    state.loading = false;

    match result {
        Ok(collection) => {
            let partial = collection.features.len() >= max_features as usize
                || collection.exceeded_transfer_limit();
            if partial {
                logging::info(
                    Component::Overlay,
                    None,
                    &format!("result capped at {} features, overlay is partial", max_features),
                );
            }
            let collection = Arc::new(collection);
            state.data = Some(Arc::clone(&collection));
            state.partial = partial;
            state.error = None;
            Ok(FetchOutcome::Applied(collection))
        }
        Err(err) => {
            logging::warn(Component::Overlay, None, &format!("fetch for {} failed: {}", bounds.envelope(), err));
            state.clear();
            state.error = Some(FETCH_FAILED_MESSAGE.to_string());
            Err(err)
        }
    }
}

/// Runs the query on its own thread and waits for it while `token` is
/// current. `None` means the fetch was superseded first; the query thread
/// is left to finish (or hang) on its own and its result is dropped.
fn query_until_superseded(
    service: Arc<dyn FeatureService>,
    state: &Mutex<OverlayState>,
    token: u64,
    bounds: Bounds,
    max_features: u32,
) -> Option<Result<FeatureCollection, OverlayError>> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("overlay-query-{}", token))
        .spawn(move || {
            let _ = tx.send(service.query(&bounds, max_features));
        });
    if let Err(e) = spawned {
        return Some(Err(OverlayError::Network(format!("could not start query: {}", e))));
    }

    loop {
        match rx.recv_timeout(SUPERSEDE_POLL) {
            Ok(result) => return Some(result),
            Err(RecvTimeoutError::Disconnected) => {
                return Some(Err(OverlayError::Network("query thread stopped".to_string())));
            }
            Err(RecvTimeoutError::Timeout) => {
                if lock(state).generation != token {
                    return None;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
