//! Core data types for the basin monitoring dashboard.
//!
//! This module defines the shared domain model imported by all other
//! modules: stations and their latest readings, alerts, basin rollups,
//! map viewport bounds, and the error enums each subsystem reports.
//! It contains no I/O.
//!
//! Field names serialize in camelCase so the same types read the
//! telemetry wire format (realtime payloads, the embedded baseline
//! dataset) and write the dashboard's JSON endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Station types
// ---------------------------------------------------------------------------

/// Operational status of a station, in ascending order of severity with
/// `Offline` last (connectivity, not level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StationStatus {
    Normal,
    Warning,
    Danger,
    Offline,
}

impl StationStatus {
    /// Every status, in display order.
    pub const ALL: [StationStatus; 4] = [
        StationStatus::Normal,
        StationStatus::Warning,
        StationStatus::Danger,
        StationStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Normal => "Normal",
            StationStatus::Warning => "Warning",
            StationStatus::Danger => "Danger",
            StationStatus::Offline => "Offline",
        }
    }

    /// Case-insensitive parse, used for query strings.
    pub fn parse(s: &str) -> Option<StationStatus> {
        StationStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGS84 position of a station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Latest telemetry frame reported by a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// Water level in metres.
    pub water_level: f64,
    pub change_1h: f64,
    pub change_24h: f64,
    /// Battery charge, percent.
    #[serde(rename = "battery")]
    pub battery_pct: f64,
    /// Received signal strength, dBm.
    #[serde(rename = "rssi")]
    pub rssi_dbm: f64,
}

/// Per-station water-level thresholds, in metres.
///
/// `warning <= danger` for a well-formed station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub danger: f64,
}

/// A fixed telemetry device and its most recent state.
///
/// Station records are replaced whole; nothing in the dashboard patches
/// individual fields of a stored station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    /// Realtime payloads key stations by id and may omit it from the body.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub location: GeoPoint,
    pub basin: String,
    pub status: StationStatus,
    pub last_reading: Reading,
    pub thresholds: Thresholds,
}

// ---------------------------------------------------------------------------
// Alert types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    Warning,
    Danger,
    Offline,
    Recovery,
}

impl AlertKind {
    pub const ALL: [AlertKind; 4] = [
        AlertKind::Warning,
        AlertKind::Danger,
        AlertKind::Offline,
        AlertKind::Recovery,
    ];
}

/// An alert raised by the telemetry backend when a station crosses a
/// threshold or changes connectivity state.
///
/// `acknowledged` only ever moves from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub station_id: String,
    pub station_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub acknowledged: bool,
}

// ---------------------------------------------------------------------------
// Basin rollups
// ---------------------------------------------------------------------------

/// Backend-computed rollup for one basin. Read-only snapshot on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasinSummary {
    pub name: String,
    pub station_count: u32,
    pub active_stations: u32,
    pub warning_stations: u32,
    pub danger_stations: u32,
    pub avg_change_24h: f64,
}

// ---------------------------------------------------------------------------
// Viewport
// ---------------------------------------------------------------------------

/// Geographic rectangle currently visible on the map, in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Bounds { west, south, east, north }
    }

    /// All edges finite, latitudes in range and `south <= north`.
    ///
    /// `west > east` is allowed: the viewport crosses the antimeridian.
    pub fn is_valid(&self) -> bool {
        let edges = [self.west, self.south, self.east, self.north];
        edges.iter().all(|v| v.is_finite())
            && (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
            && self.south <= self.north
    }

    /// `west,south,east,north` envelope string used by feature queries.
    pub fn envelope(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }

    /// True when any edge moved by more than `tolerance_deg`.
    pub fn differs_materially(&self, other: &Bounds, tolerance_deg: f64) -> bool {
        (self.west - other.west).abs() > tolerance_deg
            || (self.south - other.south).abs() > tolerance_deg
            || (self.east - other.east).abs() > tolerance_deg
            || (self.north - other.north).abs() > tolerance_deg
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from the station-telemetry service or its push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// No telemetry backend is configured.
    NotConfigured,
    /// The backend or push channel could not be reached.
    ConnectionUnavailable(String),
    /// The backend was reached but a query failed.
    QueryFailed(String),
    /// A payload could not be decoded into the data model.
    Decode(String),
    /// An open push channel stopped delivering.
    ChannelClosed(String),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::NotConfigured => write!(f, "Telemetry backend not configured"),
            TelemetryError::ConnectionUnavailable(msg) => {
                write!(f, "Telemetry connection unavailable: {}", msg)
            }
            TelemetryError::QueryFailed(msg) => write!(f, "Telemetry query failed: {}", msg),
            TelemetryError::Decode(msg) => write!(f, "Telemetry decode error: {}", msg),
            TelemetryError::ChannelClosed(path) => {
                write!(f, "Telemetry channel '{}' closed", path)
            }
        }
    }
}

impl std::error::Error for TelemetryError {}

/// A genuinely failed overlay fetch. Superseded fetches are not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayError {
    /// No feature service endpoint is configured (permanent).
    NotConfigured,
    /// Non-2xx HTTP response.
    HttpStatus(u16),
    /// The service answered with an error document.
    Service(String),
    /// Transport failure (DNS, connect, reset).
    Network(String),
    /// The body was not a feature collection.
    Decode(String),
    /// The requested viewport is not a usable envelope.
    InvalidBounds(String),
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::NotConfigured => write!(f, "Feature service endpoint not configured"),
            OverlayError::HttpStatus(code) => write!(f, "Feature service HTTP error: {}", code),
            OverlayError::Service(msg) => write!(f, "Feature service error: {}", msg),
            OverlayError::Network(msg) => write!(f, "Feature service unreachable: {}", msg),
            OverlayError::Decode(msg) => write!(f, "Feature collection decode error: {}", msg),
            OverlayError::InvalidBounds(envelope) => write!(f, "Invalid viewport bounds: {}", envelope),
        }
    }
}

impl std::error::Error for OverlayError {}

/// Failure of a remote alert acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum AckError {
    /// The backend rejected or failed the call.
    Rejected(String),
    /// The backend could not be reached.
    Unreachable(String),
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckError::Rejected(msg) => write!(f, "Acknowledgement rejected: {}", msg),
            AckError::Unreachable(msg) => write!(f, "Acknowledgement backend unreachable: {}", msg),
        }
    }
}

impl std::error::Error for AckError {}

impl From<TelemetryError> for AckError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::QueryFailed(msg) | TelemetryError::Decode(msg) => AckError::Rejected(msg),
            other => AckError::Unreachable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_deserializes_wire_format() {
        let json = r#"{
            "id": "ST002",
            "name": "Ganges Monitoring Point",
            "location": { "lat": 25.3176, "lng": 83.0064 },
            "basin": "Ganges",
            "status": "Warning",
            "lastReading": {
                "timestamp": "2025-10-15T06:15:00Z",
                "waterLevel": 72.8,
                "change1h": 0.5,
                "change24h": 2.3,
                "battery": 85,
                "rssi": -72
            },
            "thresholds": { "warning": 72.0, "danger": 75.0 }
        }"#;

        let station: Station = serde_json::from_str(json).expect("wire format should parse");
        assert_eq!(station.id, "ST002");
        assert_eq!(station.status, StationStatus::Warning);
        assert_eq!(station.last_reading.water_level, 72.8);
        assert_eq!(station.last_reading.change_24h, 2.3);
        assert_eq!(station.last_reading.battery_pct, 85.0);
        assert_eq!(station.last_reading.rssi_dbm, -72.0);
    }

    #[test]
    fn test_station_id_defaults_when_keyed_externally() {
        let json = r#"{
            "name": "Keyed",
            "location": { "lat": 1.0, "lng": 2.0 },
            "basin": "B",
            "status": "Normal",
            "lastReading": {
                "timestamp": "2025-10-15T06:15:00Z",
                "waterLevel": 1.0, "change1h": 0, "change24h": 0,
                "battery": 50, "rssi": -70
            },
            "thresholds": { "warning": 2.0, "danger": 3.0 }
        }"#;
        let station: Station = serde_json::from_str(json).expect("id is optional in payload");
        assert!(station.id.is_empty());
    }

    #[test]
    fn test_alert_kind_uses_type_key() {
        let json = r#"{
            "id": "AL002", "stationId": "ST003", "stationName": "Brahmaputra Station",
            "timestamp": "2025-10-15T04:30:00Z", "type": "Danger",
            "message": "Water level exceeded danger threshold of 49.0m",
            "acknowledged": false
        }"#;
        let alert: Alert = serde_json::from_str(json).expect("alert should parse");
        assert_eq!(alert.kind, AlertKind::Danger);
        assert!(!alert.acknowledged);
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(StationStatus::parse("danger"), Some(StationStatus::Danger));
        assert_eq!(StationStatus::parse(" Offline "), Some(StationStatus::Offline));
        assert_eq!(StationStatus::parse("flooded"), None);
    }

    #[test]
    fn test_bounds_validity_and_envelope() {
        let b = Bounds::new(77.0, 20.0, 80.5, 24.25);
        assert!(b.is_valid());
        assert_eq!(b.envelope(), "77,20,80.5,24.25");

        assert!(!Bounds::new(77.0, 30.0, 80.0, 20.0).is_valid(), "south above north");
        assert!(!Bounds::new(f64::NAN, 0.0, 1.0, 1.0).is_valid());
        assert!(Bounds::new(170.0, -10.0, -170.0, 10.0).is_valid(), "antimeridian crossing");
    }

    #[test]
    fn test_bounds_material_change() {
        let a = Bounds::new(77.0, 20.0, 80.0, 24.0);
        let nudged = Bounds::new(77.00001, 20.0, 80.0, 24.0);
        let panned = Bounds::new(78.0, 20.0, 81.0, 24.0);
        assert!(!a.differs_materially(&nudged, 0.0001));
        assert!(a.differs_materially(&panned, 0.0001));
    }

    #[test]
    fn test_telemetry_error_maps_to_ack_error() {
        let unreachable: AckError = TelemetryError::ConnectionUnavailable("refused".into()).into();
        assert!(matches!(unreachable, AckError::Unreachable(_)));

        let rejected: AckError = TelemetryError::QueryFailed("constraint".into()).into();
        assert_eq!(rejected, AckError::Rejected("constraint".into()));
    }
}
