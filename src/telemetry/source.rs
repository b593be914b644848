//! Single read path for station, alert and basin data.
//!
//! `TelemetrySource` hides whether data comes from a live push channel or
//! from the baseline dataset. Station data is pushed through
//! `subscribe_stations`; alerts and basins are read on request with the
//! same fallback rule.
//!
//! Live channels are shared per resource path: the first subscriber opens
//! the feed, later subscribers join it and immediately receive the latest
//! snapshot, and the last subscriber to leave closes it. A channel is
//! registered before its feed connects and the connect runs outside the
//! registry lock, so a slow connect only delays the subscriber that
//! started it. Deliveries on one
//! channel are serialized, so every subscriber sees snapshots in arrival
//! order.
//!
//! Callbacks run on the channel's pump thread (or on the subscribing
//! thread for the initial replay and for baseline deliveries). They must
//! not subscribe to the same path from inside the callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::TelemetrySettings;
use crate::logging::{self, Component};
use crate::model::{Alert, BasinSummary, Station, TelemetryError};
use crate::telemetry::baseline::FixtureBackend;
use crate::telemetry::postgres::{PostgresBackend, PostgresFeed};
use crate::telemetry::{FeedCloser, FeedEvent, StationFeed, TelemetryBackend};

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    Live,
    Baseline,
}

/// A full station collection as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct StationSnapshot {
    pub stations: Arc<Vec<Station>>,
    pub origin: SnapshotOrigin,
    /// Monotonic per channel; baseline deliveries made without a channel
    /// carry 0.
    pub sequence: u64,
}

/// A collection read through the source, tagged with its origin.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub origin: SnapshotOrigin,
    /// The live read error that caused a fallback, if any.
    pub error: Option<TelemetryError>,
}

type SnapshotCallback = Arc<dyn Fn(StationSnapshot) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(TelemetryError) + Send + Sync>;
type Registry = Mutex<HashMap<String, Arc<Channel>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Shared channel
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    /// Set once the subscriber has been replayed the latest snapshot; the
    /// pump skips it until then.
    primed: bool,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

impl Subscriber {
    fn deliver(&self, snapshot: StationSnapshot) {
        if self.active.load(Ordering::SeqCst) {
            (self.on_snapshot)(snapshot);
        }
    }

    fn report(&self, err: TelemetryError) {
        if self.active.load(Ordering::SeqCst) {
            (self.on_error)(err);
        }
    }
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<Subscriber>,
    latest: Option<StationSnapshot>,
    sequence: u64,
    closer: Option<FeedCloser>,
    /// Set when the source itself shut the feed down.
    closing: bool,
}

struct Channel {
    path: String,
    /// Held for the whole of every delivery round.
    delivery: Mutex<()>,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// A channel whose feed is still connecting.
    fn connecting(path: &str) -> Self {
        Channel {
            path: path.to_string(),
            delivery: Mutex::new(()),
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Hands the connected feed's close hook to the channel. Gives it back
    /// if the channel was closed while connecting.
    fn attach(&self, closer: FeedCloser) -> Result<(), FeedCloser> {
        let mut state = lock(&self.state);
        if state.closing {
            return Err(closer);
        }
        state.closer = Some(closer);
        Ok(())
    }

    fn publish(&self, stations: Vec<Station>, origin: SnapshotOrigin) {
        let _delivery = lock(&self.delivery);
        let (snapshot, targets) = {
            let mut state = lock(&self.state);
            state.sequence += 1;
            let snapshot = StationSnapshot {
                stations: Arc::new(stations),
                origin,
                sequence: state.sequence,
            };
            state.latest = Some(snapshot.clone());
            let targets: Vec<Subscriber> =
                state.subscribers.iter().filter(|s| s.primed).cloned().collect();
            (snapshot, targets)
        };
        for subscriber in targets {
            subscriber.deliver(snapshot.clone());
        }
    }

    fn report(&self, err: &TelemetryError) {
        let _delivery = lock(&self.delivery);
        let targets: Vec<Subscriber> = lock(&self.state).subscribers.clone();
        for subscriber in targets {
            subscriber.report(err.clone());
        }
    }

    /// Replays the latest snapshot to a newly added subscriber, then lets
    /// the pump include it.
    fn prime(&self, subscriber_id: u64) {
        let _delivery = lock(&self.delivery);
        let (latest, subscriber) = {
            let mut state = lock(&self.state);
            let latest = state.latest.clone();
            let Some(entry) = state.subscribers.iter_mut().find(|s| s.id == subscriber_id) else {
                return;
            };
            entry.primed = true;
            (latest, entry.clone())
        };
        if let Some(snapshot) = latest {
            subscriber.deliver(snapshot);
        }
    }

    fn has_live_data(&self) -> bool {
        lock(&self.state)
            .latest
            .as_ref()
            .is_some_and(|s| s.origin == SnapshotOrigin::Live)
    }
}

/// Removes `channel` from the registry if it is still the registered one.
fn unregister(registry: &Registry, channel: &Arc<Channel>) {
    let mut channels = lock(registry);
    if channels.get(&channel.path).is_some_and(|c| Arc::ptr_eq(c, channel)) {
        channels.remove(&channel.path);
    }
}

/// Marks the channel closing and runs its close hook. Returns the
/// subscribers that were still attached.
fn close_channel(channel: &Channel) -> Vec<Subscriber> {
    let (closer, subscribers) = {
        let mut state = lock(&channel.state);
        state.closing = true;
        (state.closer.take(), std::mem::take(&mut state.subscribers))
    };
    if let Some(mut closer) = closer {
        closer.close();
    }
    subscribers
}

fn pump(
    channel: Arc<Channel>,
    events: Receiver<FeedEvent>,
    registry: Weak<Registry>,
    fallback: Arc<FixtureBackend>,
) {
    let mut delivered_live = false;

    for event in events.iter() {
        match event {
            FeedEvent::Snapshot(stations) => {
                logging::debug(
                    Component::Telemetry,
                    Some(&channel.path),
                    &format!("snapshot with {} stations", stations.len()),
                );
                channel.publish(stations, SnapshotOrigin::Live);
                delivered_live = true;
            }
            FeedEvent::Error(err) => {
                logging::warn(Component::Telemetry, Some(&channel.path), &err.to_string());
                channel.report(&err);
                if !delivered_live {
                    // Never got a first snapshot: give the channel up and
                    // serve the baseline once.
                    if let Some(registry) = registry.upgrade() {
                        unregister(&registry, &channel);
                    }
                    match fallback.list_stations() {
                        Ok(stations) => channel.publish(stations, SnapshotOrigin::Baseline),
                        Err(e) => channel.report(&e),
                    }
                    close_channel(&channel);
                    return;
                }
            }
        }
    }

    // Sender gone: the feed ended on its own or was closed by us.
    if let Some(registry) = registry.upgrade() {
        unregister(&registry, &channel);
    }
    let closing = lock(&channel.state).closing;
    if !closing {
        logging::warn(Component::Telemetry, Some(&channel.path), "live channel closed unexpectedly");
        channel.report(&TelemetryError::ChannelClosed(channel.path.clone()));
        close_channel(&channel);
    }
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

struct Attachment {
    registry: Weak<Registry>,
    channel: Weak<Channel>,
    subscriber_id: u64,
}

/// Releases one station subscription. `unsubscribe` is idempotent and also
/// runs on drop.
pub struct Subscription {
    active: Arc<AtomicBool>,
    attachment: Option<Attachment>,
}

impl Subscription {
    fn detached(active: Arc<AtomicBool>) -> Self {
        Subscription { active, attachment: None }
    }

    /// True until `unsubscribe` (or drop, or source shutdown).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(attachment) = &self.attachment else {
            return;
        };
        let (Some(registry), Some(channel)) =
            (attachment.registry.upgrade(), attachment.channel.upgrade())
        else {
            return;
        };

        let last = {
            let mut state = lock(&channel.state);
            state.subscribers.retain(|s| s.id != attachment.subscriber_id);
            state.subscribers.is_empty() && !state.closing
        };
        if last {
            logging::debug(Component::Telemetry, Some(&channel.path), "last subscriber left");
            unregister(&registry, &channel);
            close_channel(&channel);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// TelemetrySource
// ---------------------------------------------------------------------------

pub struct TelemetrySource {
    backend: Arc<dyn TelemetryBackend>,
    fallback: Arc<FixtureBackend>,
    feed: Option<Arc<dyn StationFeed>>,
    channels: Arc<Registry>,
    next_subscriber: AtomicU64,
}

impl TelemetrySource {
    pub fn new(
        backend: Arc<dyn TelemetryBackend>,
        fallback: Arc<FixtureBackend>,
        feed: Option<Arc<dyn StationFeed>>,
    ) -> Self {
        TelemetrySource {
            backend,
            fallback,
            feed,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Baseline-only source, rebased to `now`.
    pub fn baseline(now: DateTime<Utc>) -> Result<Self, TelemetryError> {
        let fallback = Arc::new(FixtureBackend::baseline_at(now)?);
        Ok(TelemetrySource::new(fallback.clone(), fallback, None))
    }

    /// Builds the source from settings. A configured database that cannot
    /// be reached leaves request/response reads on the baseline; the push
    /// channel still reports the failure to subscribers.
    pub fn from_settings(settings: &TelemetrySettings, now: DateTime<Utc>) -> Result<Self, TelemetryError> {
        let fallback = Arc::new(FixtureBackend::baseline_at(now)?);
        let Some(url) = settings.database_url.as_deref() else {
            logging::info(Component::Telemetry, None, "no telemetry database configured, serving baseline dataset");
            return Ok(TelemetrySource::new(fallback.clone(), fallback, None));
        };

        let backend: Arc<dyn TelemetryBackend> = match PostgresBackend::connect(url) {
            Ok(backend) => {
                logging::info(Component::Telemetry, None, "connected to telemetry database");
                Arc::new(backend)
            }
            Err(e) => {
                logging::warn(Component::Telemetry, None, &format!("{}; serving baseline dataset", e));
                fallback.clone()
            }
        };
        let feed: Arc<dyn StationFeed> =
            Arc::new(PostgresFeed::new(url, Duration::from_millis(settings.notify_poll_ms)));
        Ok(TelemetrySource::new(backend, fallback, Some(feed)))
    }

    /// Backend used for request/response reads and acknowledgements.
    pub fn backend(&self) -> Arc<dyn TelemetryBackend> {
        Arc::clone(&self.backend)
    }

    /// True when a push channel is configured at all.
    pub fn has_feed(&self) -> bool {
        self.feed.is_some()
    }

    /// True while `path` has an open channel that has delivered live data.
    pub fn is_live(&self, path: &str) -> bool {
        lock(&self.channels).get(path).is_some_and(|c| c.has_live_data())
    }

    /// Registers interest in the station collection at `path`.
    ///
    /// Every delivery is a full snapshot. Without a push channel, or when
    /// the channel cannot be opened, the baseline is delivered exactly
    /// once. Errors go to `on_error`, never to the return value.
    pub fn subscribe_stations<S, E>(&self, path: &str, on_snapshot: S, on_error: E) -> Subscription
    where
        S: Fn(StationSnapshot) + Send + Sync + 'static,
        E: Fn(TelemetryError) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            id: self.next_subscriber.fetch_add(1, Ordering::SeqCst),
            active: Arc::clone(&active),
            primed: false,
            on_snapshot: Arc::new(on_snapshot),
            on_error: Arc::new(on_error),
        };

        let Some(feed) = &self.feed else {
            self.deliver_baseline(&subscriber);
            return Subscription::detached(active);
        };

        let (channel, opener) = {
            let mut channels = lock(&self.channels);
            let (channel, opener) = match channels.get(path) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let channel = Arc::new(Channel::connecting(path));
                    channels.insert(path.to_string(), Arc::clone(&channel));
                    (channel, true)
                }
            };
            lock(&channel.state).subscribers.push(subscriber.clone());
            (channel, opener)
        };

        channel.prime(subscriber.id);
        if opener {
            self.connect(feed.as_ref(), &channel);
        }

        Subscription {
            active,
            attachment: Some(Attachment {
                registry: Arc::downgrade(&self.channels),
                channel: Arc::downgrade(&channel),
                subscriber_id: subscriber.id,
            }),
        }
    }

    /// Opens the feed for a freshly registered channel. A refused connect
    /// reports the error and serves the baseline once to everyone who
    /// joined meanwhile.
    fn connect(&self, feed: &dyn StationFeed, channel: &Arc<Channel>) {
        match feed.open(&channel.path) {
            Ok(handle) => {
                let (events, closer) = handle.into_parts();
                match channel.attach(closer) {
                    Ok(()) => {
                        self.spawn_pump(channel, events);
                        logging::info(Component::Telemetry, Some(&channel.path), "subscribed to live channel");
                    }
                    Err(mut closer) => {
                        logging::debug(Component::Telemetry, Some(&channel.path), "released while connecting");
                        closer.close();
                    }
                }
            }
            Err(err) => {
                logging::warn(
                    Component::Telemetry,
                    Some(&channel.path),
                    &format!("{}; falling back to baseline dataset", err),
                );
                unregister(&self.channels, channel);
                channel.report(&err);
                match self.fallback.list_stations() {
                    Ok(stations) => channel.publish(stations, SnapshotOrigin::Baseline),
                    Err(e) => channel.report(&e),
                }
                close_channel(channel);
            }
        }
    }

    fn spawn_pump(&self, channel: &Arc<Channel>, events: Receiver<FeedEvent>) {
        let channel = Arc::clone(channel);
        let registry = Arc::downgrade(&self.channels);
        let fallback = Arc::clone(&self.fallback);
        let path = channel.path.clone();
        let spawned = thread::Builder::new()
            .name(format!("pump-{}", path))
            .spawn(move || pump(channel, events, registry, fallback));
        if let Err(e) = spawned {
            logging::error(Component::Telemetry, Some(&path), &format!("could not start pump: {}", e));
        }
    }

    fn deliver_baseline(&self, subscriber: &Subscriber) {
        match self.fallback.list_stations() {
            Ok(stations) => subscriber.deliver(StationSnapshot {
                stations: Arc::new(stations),
                origin: SnapshotOrigin::Baseline,
                sequence: 0,
            }),
            Err(e) => subscriber.report(e),
        }
    }

    /// Every alert, acknowledged ones included.
    pub fn load_alerts(&self) -> Loaded<Vec<Alert>> {
        self.load(|backend| backend.list_alerts(true))
    }

    pub fn load_basins(&self) -> Loaded<Vec<BasinSummary>> {
        self.load(|backend| backend.list_basins())
    }

    /// True when request/response reads already go to the baseline.
    fn serving_baseline(&self) -> bool {
        Arc::as_ptr(&self.backend) as *const () == Arc::as_ptr(&self.fallback) as *const ()
    }

    fn load<T: Default>(
        &self,
        read: impl Fn(&dyn TelemetryBackend) -> Result<T, TelemetryError>,
    ) -> Loaded<T> {
        match read(&*self.backend) {
            Ok(value) => Loaded {
                value,
                origin: if self.serving_baseline() { SnapshotOrigin::Baseline } else { SnapshotOrigin::Live },
                error: None,
            },
            Err(err) => {
                logging::warn(Component::Telemetry, None, &format!("{}; using baseline dataset", err));
                let fallback: &dyn TelemetryBackend = &*self.fallback;
                Loaded {
                    value: read(fallback).unwrap_or_default(),
                    origin: SnapshotOrigin::Baseline,
                    error: Some(err),
                }
            }
        }
    }

    /// Closes every open channel. Attached subscriptions become inactive.
    pub fn shutdown(&self) {
        let channels: Vec<Arc<Channel>> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            for subscriber in close_channel(&channel) {
                subscriber.active.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for TelemetrySource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
