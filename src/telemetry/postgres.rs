//! PostgreSQL-backed telemetry: request/response reads and a LISTEN/NOTIFY
//! push channel.
//!
//! Tables live in the `dashboard` schema (see `sql/001_dashboard_schema.sql`).
//! A statement-level trigger on `dashboard.stations` issues
//! `NOTIFY stations`; the feed answers every notification (or burst of
//! notifications) with a full re-read of the station table, so consumers
//! only ever see complete snapshots.

use chrono::{DateTime, Utc};
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, Row};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::db::{self, DASHBOARD_SCHEMA};
use crate::logging::{self, Component};
use crate::model::{
    Alert, AlertKind, BasinSummary, GeoPoint, Reading, Station, StationStatus, TelemetryError,
    Thresholds,
};
use crate::telemetry::{FeedEvent, FeedHandle, StationFeed, TelemetryBackend};

const STATION_COLUMNS: &str = "id, name, latitude, longitude, basin, status, \
     reading_time, water_level, change_1h, change_24h, battery_pct, rssi_dbm, \
     warning_level, danger_level";

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn decode_err(e: postgres::Error) -> TelemetryError {
    TelemetryError::Decode(e.to_string())
}

fn query_err(e: postgres::Error) -> TelemetryError {
    if e.is_closed() {
        TelemetryError::ConnectionUnavailable(e.to_string())
    } else {
        TelemetryError::QueryFailed(e.to_string())
    }
}

fn numeric(row: &Row, column: &str) -> Result<f64, TelemetryError> {
    let value: Decimal = row.try_get(column).map_err(decode_err)?;
    value
        .to_f64()
        .ok_or_else(|| TelemetryError::Decode(format!("{} out of range: {}", column, value)))
}

fn count(row: &Row, column: &str) -> Result<u32, TelemetryError> {
    let value: i32 = row.try_get(column).map_err(decode_err)?;
    Ok(value.max(0) as u32)
}

/// Decodes one `dashboard.stations` row. The stored status is advisory;
/// an unrecognized value decodes as `Normal` and is re-derived downstream.
pub(crate) fn station_from_row(row: &Row) -> Result<Station, TelemetryError> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let timestamp: DateTime<Utc> = row.try_get("reading_time").map_err(decode_err)?;
    let battery: Option<f64> = row.try_get("battery_pct").map_err(decode_err)?;
    let rssi: Option<f64> = row.try_get("rssi_dbm").map_err(decode_err)?;

    Ok(Station {
        id: row.try_get("id").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        location: GeoPoint {
            lat: row.try_get("latitude").map_err(decode_err)?,
            lng: row.try_get("longitude").map_err(decode_err)?,
        },
        basin: row.try_get("basin").map_err(decode_err)?,
        status: StationStatus::parse(&status).unwrap_or(StationStatus::Normal),
        last_reading: Reading {
            timestamp,
            water_level: numeric(row, "water_level")?,
            change_1h: numeric(row, "change_1h")?,
            change_24h: numeric(row, "change_24h")?,
            battery_pct: battery.unwrap_or(0.0),
            rssi_dbm: rssi.unwrap_or(-999.0),
        },
        thresholds: Thresholds {
            warning: numeric(row, "warning_level")?,
            danger: numeric(row, "danger_level")?,
        },
    })
}

fn alert_kind(raw: &str) -> Result<AlertKind, TelemetryError> {
    match raw {
        "Warning" => Ok(AlertKind::Warning),
        "Danger" => Ok(AlertKind::Danger),
        "Offline" => Ok(AlertKind::Offline),
        "Recovery" => Ok(AlertKind::Recovery),
        other => Err(TelemetryError::Decode(format!("unknown alert type '{}'", other))),
    }
}

fn alert_from_row(row: &Row) -> Result<Alert, TelemetryError> {
    let kind: String = row.try_get("alert_type").map_err(decode_err)?;
    Ok(Alert {
        id: row.try_get("id").map_err(decode_err)?,
        station_id: row.try_get("station_id").map_err(decode_err)?,
        station_name: row.try_get("station_name").map_err(decode_err)?,
        timestamp: row.try_get("raised_at").map_err(decode_err)?,
        kind: alert_kind(&kind)?,
        message: row.try_get("message").map_err(decode_err)?,
        acknowledged: row.try_get("acknowledged").map_err(decode_err)?,
    })
}

fn basin_from_row(row: &Row) -> Result<BasinSummary, TelemetryError> {
    Ok(BasinSummary {
        name: row.try_get("name").map_err(decode_err)?,
        station_count: count(row, "station_count")?,
        active_stations: count(row, "active_stations")?,
        warning_stations: count(row, "warning_stations")?,
        danger_stations: count(row, "danger_stations")?,
        avg_change_24h: numeric(row, "avg_change_24h")?,
    })
}

fn query_stations(client: &mut Client) -> Result<Vec<Station>, TelemetryError> {
    let sql = format!("SELECT {} FROM dashboard.stations ORDER BY id", STATION_COLUMNS);
    let rows = client.query(sql.as_str(), &[]).map_err(query_err)?;
    rows.iter().map(station_from_row).collect()
}

// ---------------------------------------------------------------------------
// Request/response backend
// ---------------------------------------------------------------------------

/// Live backend over one PostgreSQL connection.
pub struct PostgresBackend {
    client: Mutex<Client>,
}

impl PostgresBackend {
    /// Connects and verifies the dashboard schema.
    pub fn connect(db_url: &str) -> Result<Self, TelemetryError> {
        let client = db::connect_and_verify(db_url, &[DASHBOARD_SCHEMA])
            .map_err(|e| TelemetryError::ConnectionUnavailable(e.to_string()))?;
        Ok(PostgresBackend { client: Mutex::new(client) })
    }

    fn client(&self) -> MutexGuard<'_, Client> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetryBackend for PostgresBackend {
    fn list_stations(&self) -> Result<Vec<Station>, TelemetryError> {
        query_stations(&mut self.client())
    }

    fn get_station(&self, id: &str) -> Result<Option<Station>, TelemetryError> {
        let sql = format!("SELECT {} FROM dashboard.stations WHERE id = $1", STATION_COLUMNS);
        let rows = self.client().query(sql.as_str(), &[&id]).map_err(query_err)?;
        rows.first().map(station_from_row).transpose()
    }

    fn list_alerts(&self, include_acknowledged: bool) -> Result<Vec<Alert>, TelemetryError> {
        let rows = self
            .client()
            .query(
                "SELECT id, station_id, station_name, raised_at, alert_type, message, acknowledged
                 FROM dashboard.alerts
                 WHERE $1 OR NOT acknowledged
                 ORDER BY raised_at DESC",
                &[&include_acknowledged],
            )
            .map_err(query_err)?;
        rows.iter().map(alert_from_row).collect()
    }

    fn list_basins(&self) -> Result<Vec<BasinSummary>, TelemetryError> {
        let rows = self
            .client()
            .query(
                "SELECT name, station_count, active_stations, warning_stations,
                        danger_stations, avg_change_24h
                 FROM dashboard.basin_summaries
                 ORDER BY name",
                &[],
            )
            .map_err(query_err)?;
        rows.iter().map(basin_from_row).collect()
    }

    fn acknowledge(&self, alert_id: &str) -> Result<bool, TelemetryError> {
        // Only the false → true transition updates a row.
        let changed = self
            .client()
            .execute(
                "UPDATE dashboard.alerts SET acknowledged = TRUE
                 WHERE id = $1 AND NOT acknowledged",
                &[&alert_id],
            )
            .map_err(query_err)?;
        Ok(changed == 1)
    }
}

// ---------------------------------------------------------------------------
// LISTEN/NOTIFY push channel
// ---------------------------------------------------------------------------

/// Push channel: one dedicated connection per opened path.
pub struct PostgresFeed {
    db_url: String,
    poll: Duration,
}

impl PostgresFeed {
    /// `poll` bounds how long the listener blocks before re-checking for
    /// shutdown.
    pub fn new(db_url: &str, poll: Duration) -> Self {
        PostgresFeed { db_url: db_url.to_string(), poll }
    }
}

/// Resource paths double as NOTIFY channel names, so they must be plain
/// identifiers.
pub fn channel_name(path: &str) -> Option<&str> {
    let mut chars = path.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    (first_ok && rest_ok && path.len() <= 63).then_some(path)
}

impl StationFeed for PostgresFeed {
    fn open(&self, path: &str) -> Result<FeedHandle, TelemetryError> {
        let channel = channel_name(path)
            .ok_or_else(|| TelemetryError::QueryFailed(format!("invalid resource path '{}'", path)))?;

        let mut client = db::connect_with_validation(&self.db_url)
            .map_err(|e| TelemetryError::ConnectionUnavailable(e.to_string()))?;
        client
            .batch_execute(&format!("LISTEN \"{}\"", channel))
            .map_err(|e| TelemetryError::ConnectionUnavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let poll = self.poll;
        let path = path.to_string();

        thread::Builder::new()
            .name(format!("feed-{}", path))
            .spawn(move || run_listener(client, &path, poll, &worker_stop, &tx))
            .map_err(|e| TelemetryError::ConnectionUnavailable(e.to_string()))?;

        Ok(FeedHandle::new(rx, move || stop.store(true, Ordering::SeqCst)))
    }
}

/// Listener loop: initial snapshot, then one snapshot per change burst.
/// Exits on shutdown, on a dropped receiver, or on a lost connection.
fn run_listener(
    mut client: Client,
    path: &str,
    poll: Duration,
    stop: &AtomicBool,
    tx: &Sender<FeedEvent>,
) {
    logging::info(Component::Telemetry, Some(path), "live channel open");

    if !publish_snapshot(&mut client, tx) {
        return;
    }

    while !stop.load(Ordering::SeqCst) {
        match wait_for_change(&mut client, poll) {
            Ok(false) => {}
            Ok(true) => {
                if !publish_snapshot(&mut client, tx) {
                    return;
                }
            }
            Err(e) => {
                logging::warn(Component::Telemetry, Some(path), &format!("listener failed: {}", e));
                let _ = tx.send(FeedEvent::Error(TelemetryError::ChannelClosed(path.to_string())));
                return;
            }
        }
    }

    logging::debug(Component::Telemetry, Some(path), "live channel closed");
}

/// Sends the current station table. Returns `false` when the loop should end.
fn publish_snapshot(client: &mut Client, tx: &Sender<FeedEvent>) -> bool {
    let event = match query_stations(client) {
        Ok(stations) => FeedEvent::Snapshot(stations),
        Err(e) => FeedEvent::Error(e),
    };
    tx.send(event).is_ok() && !client.is_closed()
}

/// Blocks up to `poll` for a notification, then drains any burst that
/// arrived with it.
fn wait_for_change(client: &mut Client, poll: Duration) -> Result<bool, postgres::Error> {
    let mut notifications = client.notifications();
    if notifications.timeout_iter(poll).next()?.is_none() {
        return Ok(false);
    }
    notifications.iter().count()?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
