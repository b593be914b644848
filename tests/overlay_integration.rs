/// Integration tests for the water-body overlay against a local HTTP layer
///
/// A `tiny_http` server on an ephemeral port plays the feature layer. It
/// records every request URL and answers from a per-test script, so these
/// tests exercise the real reqwest client, query construction, status
/// handling and GeoJSON parsing end to end.

use basin_dashboard::config::OverlaySettings;
use basin_dashboard::model::{Bounds, OverlayError};
use basin_dashboard::overlay::arcgis::ArcGisFeatureService;
use basin_dashboard::overlay::{FeatureService, FetchOutcome, OverlayFetcher, FETCH_FAILED_MESSAGE};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock feature layer
// ---------------------------------------------------------------------------

struct MockLayer {
    base_url: String,
    requests: Receiver<String>,
}

/// Serves `responses` in order, one per request, then stops.
fn mock_layer(responses: Vec<(u16, String)>) -> MockLayer {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind ephemeral port");
    let addr = server.server_addr().to_ip().expect("ip listener");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, body) in responses {
            let Ok(request) = server.recv() else { return };
            let _ = tx.send(request.url().to_string());
            let response = tiny_http::Response::from_string(body).with_status_code(status);
            let _ = request.respond(response);
        }
    });

    MockLayer {
        base_url: format!("http://{}/arcgis/rest/services/Hydro/FeatureServer/0", addr),
        requests: rx,
    }
}

fn collection(names: &[&str], exceeded: bool) -> String {
    let features: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                r#"{{ "type": "Feature", "id": {},
                     "geometry": {{ "type": "Point", "coordinates": [78.0, 22.0] }},
                     "properties": {{ "NAME": "{}", "STATE": "MP", "AREA_SQKM": 4.5 }} }}"#,
                i, name
            )
        })
        .collect();
    format!(
        r#"{{ "type": "FeatureCollection", "features": [{}], "properties": {{ "exceededTransferLimit": {} }} }}"#,
        features.join(","),
        exceeded
    )
}

fn viewport() -> Bounds {
    Bounds::new(77.0, 20.0, 80.0, 24.0)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[test]
fn test_query_carries_envelope_and_cap() {
    let layer = mock_layer(vec![(200, collection(&["Upper Lake"], false))]);
    let service = ArcGisFeatureService::new(&layer.base_url).unwrap();

    let result = service.query(&viewport(), 250).expect("query should succeed");
    assert_eq!(result.features.len(), 1);
    assert_eq!(result.features[0].details().name, "Upper Lake");

    let url = layer.requests.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(url.starts_with("/arcgis/rest/services/Hydro/FeatureServer/0/query?"), "{}", url);
    for expected in ["geometry=77%2C20%2C80%2C24", "inSR=4326", "outSR=4326", "resultRecordCount=250", "f=geojson"] {
        assert!(url.contains(expected), "missing {} in {}", expected, url);
    }
}

#[test]
fn test_http_error_status_is_reported() {
    let layer = mock_layer(vec![(500, "internal error".to_string())]);
    let service = ArcGisFeatureService::new(&layer.base_url).unwrap();
    assert_eq!(service.query(&viewport(), 2000), Err(OverlayError::HttpStatus(500)));
}

#[test]
fn test_error_document_is_a_service_error() {
    let body = r#"{ "error": { "code": 498, "message": "Invalid token." } }"#.to_string();
    let layer = mock_layer(vec![(200, body)]);
    let service = ArcGisFeatureService::new(&layer.base_url).unwrap();
    assert_eq!(
        service.query(&viewport(), 2000),
        Err(OverlayError::Service("Invalid token. (code 498)".to_string()))
    );
}

#[test]
fn test_unreachable_layer_is_a_network_error() {
    // Bind then drop, so the port is very likely closed.
    let addr = {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        server.server_addr().to_ip().unwrap()
    };
    let service = ArcGisFeatureService::new(&format!("http://{}/layer", addr)).unwrap();
    assert!(matches!(service.query(&viewport(), 10), Err(OverlayError::Network(_))));
}

// ---------------------------------------------------------------------------
// Fetcher over the real client
// ---------------------------------------------------------------------------

fn fetcher_for(layer: &MockLayer, cap: u32) -> OverlayFetcher {
    let service: Arc<dyn FeatureService> = Arc::new(ArcGisFeatureService::new(&layer.base_url).unwrap());
    let settings = OverlaySettings {
        feature_service_url: Some(layer.base_url.clone()),
        result_record_count: cap,
        ..OverlaySettings::default()
    };
    OverlayFetcher::new(Some(service), &settings)
}

#[test]
fn test_visible_overlay_loads_and_flags_partial_results() {
    let layer = mock_layer(vec![(200, collection(&["A", "B"], true))]);
    let fetcher = fetcher_for(&layer, 2000);

    assert!(fetcher.set_bounds(viewport()).is_none(), "hidden overlay does not fetch");
    let pending = fetcher.set_visible(true).expect("toggle on fetches");
    assert!(matches!(pending.wait(), Ok(FetchOutcome::Applied(_))));

    let view = fetcher.view();
    assert!(view.visible && view.available);
    assert_eq!(view.feature_count, 2);
    assert!(view.partial, "service reported exceededTransferLimit");
    assert!(view.error.is_none());
}

#[test]
fn test_failed_fetch_clears_overlay_and_shows_message() {
    let layer = mock_layer(vec![(200, collection(&["A"], false)), (503, String::new())]);
    let fetcher = fetcher_for(&layer, 2000);

    fetcher.set_bounds(viewport());
    fetcher.set_visible(true).unwrap().wait().unwrap();
    assert_eq!(fetcher.view().feature_count, 1);

    let moved = Bounds::new(81.0, 20.0, 84.0, 24.0);
    let result = fetcher.set_bounds(moved).expect("material move refetches").wait();
    assert_eq!(result, Err(OverlayError::HttpStatus(503)));

    let view = fetcher.view();
    assert_eq!(view.feature_count, 0, "stale data is not kept after a failure");
    assert_eq!(view.error.as_deref(), Some(FETCH_FAILED_MESSAGE));
}

#[test]
fn test_toggle_off_clears_and_toggle_on_refetches() {
    let layer = mock_layer(vec![(200, collection(&["A"], false)), (200, collection(&["A", "B", "C"], false))]);
    let fetcher = fetcher_for(&layer, 3);

    fetcher.set_bounds(viewport());
    fetcher.set_visible(true).unwrap().wait().unwrap();
    assert!(fetcher.set_visible(false).is_none());
    assert_eq!(fetcher.view().feature_count, 0);

    fetcher.set_visible(true).unwrap().wait().unwrap();
    let view = fetcher.view();
    assert_eq!(view.feature_count, 3);
    assert!(view.partial, "result reached the record cap");
    assert_eq!(layer.requests.iter().take(2).count(), 2, "each toggle-on is a fresh request");
}
