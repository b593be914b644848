/// HTTP endpoint over a running dashboard
///
/// A small JSON API for external tools and the map front end. Routing is
/// a pure function of (method, url) so it can be tested without a socket;
/// `start_endpoint_server` wraps it in a `tiny_http` accept loop.
///
/// Endpoints:
/// - GET  /health                                  - Service health check
/// - GET  /stations?region=&status=A,B             - Filtered stations
/// - GET  /stations/{id}                           - One station
/// - GET  /regions                                 - Region filter options
/// - GET  /alerts[?all=true]                       - Open (or all) alerts
/// - POST /alerts/{id}/ack                         - Acknowledge an alert
/// - GET  /basins                                  - Basin summaries
/// - GET  /summary                                 - KPI and ranking panels
/// - GET  /overlay[?west=&south=&east=&north=]     - Water-body overlay
/// - POST /overlay/visible?on=true|false           - Toggle the overlay

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::dashboard::Dashboard;
use crate::filter::{RegionFilter, StatusFilter};
use crate::logging::{self, Component};
use crate::model::{AckError, Bounds};
use crate::overlay::properties::WaterBodyDetails;
use crate::overlay::PendingFetch;

/// How long a request waits for an overlay fetch before answering with
/// the in-progress view. The fetch itself keeps running.
pub const OVERLAY_RESPONSE_WAIT: Duration = Duration::from_secs(30);

const AVAILABLE_ENDPOINTS: [&str; 10] = [
    "GET /health",
    "GET /stations?region=&status=",
    "GET /stations/{id}",
    "GET /regions",
    "GET /alerts",
    "POST /alerts/{id}/ack",
    "GET /basins",
    "GET /summary",
    "GET /overlay?west=&south=&east=&north=",
    "POST /overlay/visible?on=",
];

pub type RouteResult = (u16, Value);

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// Splits a request URL into its path and decoded query parameters.
fn split_url(url: &str) -> (&str, HashMap<String, String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let params = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect();
    (path.trim_end_matches('/'), params)
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// `Ok(None)` when no bound is given at all.
fn parse_bounds(params: &HashMap<String, String>) -> Result<Option<Bounds>, String> {
    let keys = ["west", "south", "east", "north"];
    if keys.iter().all(|k| !params.contains_key(*k)) {
        return Ok(None);
    }
    let mut edges = [0.0f64; 4];
    for (edge, key) in edges.iter_mut().zip(keys) {
        let raw = params.get(key).ok_or_else(|| format!("missing '{}'", key))?;
        *edge = raw.trim().parse().map_err(|_| format!("'{}' is not a number: {}", key, raw))?;
    }
    let bounds = Bounds::new(edges[0], edges[1], edges[2], edges[3]);
    if !bounds.is_valid() {
        return Err(format!("invalid bounds {}", bounds.envelope()));
    }
    Ok(Some(bounds))
}

fn error(status: u16, message: impl Into<String>) -> RouteResult {
    (status, json!({ "error": message.into() }))
}

fn ok<T: Serialize>(body: &T) -> RouteResult {
    match serde_json::to_value(body) {
        Ok(value) => (200, value),
        Err(e) => error(500, format!("Failed to serialize response: {}", e)),
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Routes one request. Never panics; every failure is a status + JSON body.
pub fn route(method: &str, url: &str, dashboard: &Dashboard) -> RouteResult {
    let (path, params) = split_url(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => handle_health(dashboard),
        ("GET", ["stations"]) => handle_stations(dashboard, &params),
        ("GET", ["stations", id]) => match dashboard.station(&decode(id)) {
            Some(station) => ok(&station),
            None => error(404, format!("Station {} not found", decode(id))),
        },
        ("GET", ["regions"]) => ok(&dashboard.region_options()),
        ("GET", ["alerts"]) => {
            if params.get("all").and_then(|v| parse_bool(v)).unwrap_or(false) {
                ok(&dashboard.alerts())
            } else {
                ok(&dashboard.open_alerts())
            }
        }
        ("POST", ["alerts", id, "ack"]) => handle_acknowledge(dashboard, &decode(id)),
        ("GET", ["basins"]) => ok(&dashboard.basins()),
        ("GET", ["summary"]) => ok(&dashboard.summary()),
        ("GET", ["overlay"]) => handle_overlay(dashboard, &params),
        ("POST", ["overlay", "visible"]) => handle_overlay_visible(dashboard, &params),
        _ => (
            404,
            json!({
                "error": "Not found",
                "available_endpoints": AVAILABLE_ENDPOINTS,
            }),
        ),
    }
}

fn handle_health(dashboard: &Dashboard) -> RouteResult {
    (
        200,
        json!({
            "status": "ok",
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "live": dashboard.is_live(),
            "lastError": dashboard.last_error(),
            "overlayAvailable": dashboard.overlay().is_available(),
        }),
    )
}

/// Query parameters override the dashboard's current filters for this
/// request only.
fn handle_stations(dashboard: &Dashboard, params: &HashMap<String, String>) -> RouteResult {
    let (mut region, mut status) = dashboard.filters();
    if let Some(raw) = params.get("region") {
        region = RegionFilter::parse(raw);
    }
    if let Some(raw) = params.get("status") {
        match StatusFilter::parse_list(raw) {
            Ok(parsed) => status = parsed,
            Err(bad) => return error(400, format!("Unknown status '{}'", bad)),
        }
    }
    ok(&crate::filter::filter_stations(&dashboard.stations(), &region, &status))
}

fn handle_acknowledge(dashboard: &Dashboard, alert_id: &str) -> RouteResult {
    match dashboard.acknowledge(alert_id) {
        Ok(acknowledged) => (
            200,
            json!({
                "alertId": alert_id,
                "acknowledged": acknowledged,
                "openCount": dashboard.open_alert_count(),
            }),
        ),
        Err(e) => {
            let status = match e {
                AckError::Rejected(_) => 409,
                AckError::Unreachable(_) => 503,
            };
            (status, json!({ "alertId": alert_id, "error": e.to_string() }))
        }
    }
}

fn handle_overlay(dashboard: &Dashboard, params: &HashMap<String, String>) -> RouteResult {
    let pending = match parse_bounds(params) {
        Ok(Some(bounds)) => dashboard.set_viewport(bounds),
        Ok(None) => None,
        Err(message) => return error(400, message),
    };
    settle(pending);
    overlay_body(dashboard)
}

fn handle_overlay_visible(dashboard: &Dashboard, params: &HashMap<String, String>) -> RouteResult {
    let Some(visible) = params.get("on").and_then(|v| parse_bool(v)) else {
        return error(400, "expected ?on=true or ?on=false");
    };
    if visible && !dashboard.overlay().is_available() {
        return error(409, "No feature service configured");
    }
    settle(dashboard.set_overlay_visible(visible));
    overlay_body(dashboard)
}

/// Waits a bounded time for a fetch. Failures are already reflected in the
/// overlay view, so the outcome itself is not needed here.
fn settle(pending: Option<PendingFetch>) {
    if let Some(pending) = pending {
        let _ = pending.wait_timeout(OVERLAY_RESPONSE_WAIT);
    }
}

fn overlay_body(dashboard: &Dashboard) -> RouteResult {
    let view = dashboard.overlay_view();
    let details: Vec<WaterBodyDetails> = view
        .features
        .as_ref()
        .map(|c| c.features.iter().map(|f| f.details()).collect())
        .unwrap_or_default();

    let mut body = match serde_json::to_value(&view) {
        Ok(body) => body,
        Err(e) => return error(500, format!("Failed to serialize overlay: {}", e)),
    };
    if let Value::Object(map) = &mut body {
        map.insert("features".to_string(), json!(view.features.as_deref()));
        map.insert("details".to_string(), json!(details));
    }
    (200, body)
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Serves the dashboard on `port` until the listener fails.
pub fn start_endpoint_server(port: u16, dashboard: Arc<Dashboard>) -> Result<(), String> {
    let server = tiny_http::Server::http(format!("0.0.0.0:{}", port))
        .map_err(|e| format!("Failed to start HTTP server: {}", e))?;

    logging::info(Component::Http, None, &format!("listening on http://0.0.0.0:{}", port));

    for request in server.incoming_requests() {
        let method = request.method().to_string();
        let url = request.url().to_string();
        let (status, body) = route(&method, &url, &dashboard);
        logging::debug(Component::Http, None, &format!("{} {} -> {}", method, url, status));

        if let Err(e) = request.respond(create_response(status, &body)) {
            logging::warn(Component::Http, None, &format!("failed to send response: {}", e));
        }
    }

    Ok(())
}

/// Create HTTP response with JSON body
fn create_response(status_code: u16, json: &Value) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let body = serde_json::to_string_pretty(json).unwrap_or_else(|_| "{}".to_string());
    let response = tiny_http::Response::from_data(body.into_bytes())
        .with_status_code(tiny_http::StatusCode::from(status_code));

    match tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlaySettings;
    use crate::dashboard::DashboardOptions;
    use crate::overlay::OverlayFetcher;
    use crate::telemetry::source::TelemetrySource;
    use chrono::{TimeZone, Utc};

    fn started() -> Dashboard {
        let now = Utc.with_ymd_and_hms(2025, 10, 15, 6, 20, 0).unwrap();
        let source = TelemetrySource::baseline(now).unwrap();
        let overlay = OverlayFetcher::new(None, &OverlaySettings::default());
        let dashboard = Dashboard::new(source, overlay, DashboardOptions::default(), Arc::new(move || now));
        dashboard.start();
        dashboard
    }

    fn ids(body: &Value) -> Vec<String> {
        body.as_array()
            .expect("array body")
            .iter()
            .map(|s| s["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_split_url_decodes_query() {
        let (path, params) = split_url("/stations/?region=Ganges&status=Warning%2CDanger&x");
        assert_eq!(path, "/stations");
        assert_eq!(params["region"], "Ganges");
        assert_eq!(params["status"], "Warning,Danger");
        assert_eq!(params["x"], "");
    }

    #[test]
    fn test_health() {
        let (status, body) = route("GET", "/health", &started());
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live"], false);
        assert_eq!(body["overlayAvailable"], false);
    }

    #[test]
    fn test_stations_with_filters() {
        let dashboard = started();
        let (status, body) = route("GET", "/stations", &dashboard);
        assert_eq!(status, 200);
        assert_eq!(ids(&body).len(), 6);

        let (_, body) = route("GET", "/stations?status=warning,danger", &dashboard);
        assert_eq!(ids(&body), vec!["ST002", "ST003"]);

        let (_, body) = route("GET", "/stations?region=Cauvery", &dashboard);
        assert_eq!(ids(&body), vec!["ST006"]);
        assert_eq!(body[0]["status"], "Offline");

        let (status, _) = route("GET", "/stations?status=Flooded", &dashboard);
        assert_eq!(status, 400);
    }

    #[test]
    fn test_single_station_and_regions() {
        let dashboard = started();
        let (status, body) = route("GET", "/stations/ST003", &dashboard);
        assert_eq!(status, 200);
        assert_eq!(body["lastReading"]["waterLevel"], 49.8);
        assert_eq!(route("GET", "/stations/ST999", &dashboard).0, 404);

        let (_, body) = route("GET", "/regions", &dashboard);
        assert_eq!(body[0], "All");
        assert_eq!(body.as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_acknowledge_route() {
        let dashboard = started();
        let (_, open) = route("GET", "/alerts", &dashboard);
        assert_eq!(open.as_array().unwrap().len(), 2);

        let (status, body) = route("POST", "/alerts/AL002/ack", &dashboard);
        assert_eq!(status, 200);
        assert_eq!(body["acknowledged"], true);
        assert_eq!(body["openCount"], 1);

        let (_, again) = route("POST", "/alerts/AL002/ack", &dashboard);
        assert_eq!(again["acknowledged"], false);

        let (_, all) = route("GET", "/alerts?all=true", &dashboard);
        assert_eq!(all.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_summary_and_basins() {
        let dashboard = started();
        let (status, body) = route("GET", "/summary", &dashboard);
        assert_eq!(status, 200);
        assert_eq!(body["system"]["totalStations"], 6);
        assert_eq!(body["system"]["alertsLast24h"], 3);
        assert_eq!(body["topMovers"][0]["stationId"], "ST003");

        let (_, basins) = route("GET", "/basins", &dashboard);
        assert_eq!(basins.as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_overlay_routes_without_service() {
        let dashboard = started();
        let (status, body) = route("GET", "/overlay?west=77&south=20&east=80&north=24", &dashboard);
        assert_eq!(status, 200);
        assert_eq!(body["available"], false);
        assert_eq!(body["featureCount"], 0);
        assert!(body["features"].is_null());

        assert_eq!(route("GET", "/overlay?west=77&south=30&east=80&north=20", &dashboard).0, 400);
        assert_eq!(route("GET", "/overlay?west=77", &dashboard).0, 400);
        assert_eq!(route("POST", "/overlay/visible?on=true", &dashboard).0, 409);
        assert_eq!(route("POST", "/overlay/visible", &dashboard).0, 400);
    }

    #[test]
    fn test_unknown_route_lists_endpoints() {
        let (status, body) = route("DELETE", "/stations", &started());
        assert_eq!(status, 404);
        assert_eq!(body["available_endpoints"].as_array().unwrap().len(), AVAILABLE_ENDPOINTS.len());
    }
}
