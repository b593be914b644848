//! Station-telemetry data sources.
//!
//! Two seams, both injectable:
//! - `TelemetryBackend`: request/response reads plus the acknowledge call.
//!   `baseline::FixtureBackend` serves the embedded baseline dataset;
//!   `postgres::PostgresBackend` serves the live database.
//! - `StationFeed`: a push channel delivering full station snapshots on
//!   every change. `postgres::PostgresFeed` implements it with
//!   LISTEN/NOTIFY.
//!
//! `source::TelemetrySource` puts both behind one subscription API and
//! owns the fallback from live data to the baseline dataset.

pub mod baseline;
pub mod postgres;
pub mod source;

use std::sync::mpsc::Receiver;

use crate::model::{Alert, BasinSummary, Station, TelemetryError};

/// Request/response access to station, alert and basin collections.
pub trait TelemetryBackend: Send + Sync {
    /// Full station collection.
    fn list_stations(&self) -> Result<Vec<Station>, TelemetryError>;

    /// One station by id, `None` if unknown.
    fn get_station(&self, id: &str) -> Result<Option<Station>, TelemetryError>;

    /// Alerts, optionally including already acknowledged ones.
    fn list_alerts(&self, include_acknowledged: bool) -> Result<Vec<Alert>, TelemetryError>;

    /// Backend-computed basin rollups.
    fn list_basins(&self) -> Result<Vec<BasinSummary>, TelemetryError>;

    /// Marks an alert acknowledged.
    ///
    /// Returns `Ok(false)` for an unknown or already acknowledged id; only
    /// transport or backend failures are errors.
    fn acknowledge(&self, alert_id: &str) -> Result<bool, TelemetryError>;
}

/// Message delivered by an open push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The full current station collection (never a delta).
    Snapshot(Vec<Station>),
    /// The channel hit an error; it may or may not keep delivering.
    Error(TelemetryError),
}

/// Push channel for a resource path such as `"stations"`.
pub trait StationFeed: Send + Sync {
    /// Opens the channel. Errors here mean the initial connection failed.
    fn open(&self, path: &str) -> Result<FeedHandle, TelemetryError>;
}

/// An open push channel: an event stream plus a hook that shuts it down.
pub struct FeedHandle {
    events: Receiver<FeedEvent>,
    closer: FeedCloser,
}

impl FeedHandle {
    pub fn new(events: Receiver<FeedEvent>, close: impl FnOnce() + Send + 'static) -> Self {
        FeedHandle {
            events,
            closer: FeedCloser { close: Some(Box::new(close)) },
        }
    }

    pub fn into_parts(self) -> (Receiver<FeedEvent>, FeedCloser) {
        (self.events, self.closer)
    }
}

/// Shuts a push channel down. Runs at most once, also on drop.
pub struct FeedCloser {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedCloser {
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for FeedCloser {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    #[test]
    fn test_feed_closer_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel();
        let counter = Arc::clone(&calls);
        let handle = FeedHandle::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_events, mut closer) = handle.into_parts();
        closer.close();
        closer.close();
        drop(closer);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
