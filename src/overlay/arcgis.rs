/// ArcGIS-style feature layer client: query URL construction + GeoJSON
/// response parsing.
///
/// A layer URL such as
/// `https://host/arcgis/rest/services/Hydro/FeatureServer/0` is queried at
/// `<layer>/query` for every feature intersecting the viewport envelope,
/// in and out of WGS84, as GeoJSON, capped at a fixed record count.
/// Responses carrying more than the cap are not paginated.

use reqwest::blocking::Client;
use serde_json::Value;

use crate::model::{Bounds, OverlayError};
use crate::overlay::{FeatureCollection, FeatureService};

/// Default cap on features per query.
pub const DEFAULT_RESULT_RECORD_COUNT: u32 = 2000;

/// WGS84 spatial reference id, used for both input envelope and output.
const WGS84_WKID: &str = "4326";

/// Trims whitespace and one trailing slash. Blank means not configured.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Builds the query URL for every feature intersecting `bounds`.
///
/// # Example
/// ```
/// use basin_dashboard::model::Bounds;
/// use basin_dashboard::overlay::arcgis::build_query_url;
///
/// let url = build_query_url("https://host/FeatureServer/0", &Bounds::new(77.0, 20.0, 80.0, 24.0), 2000);
/// assert!(url.starts_with("https://host/FeatureServer/0/query?f=geojson"));
/// ```
pub fn build_query_url(base_url: &str, bounds: &Bounds, max_features: u32) -> String {
    format!(
        "{}/query?f=geojson&where={}&outFields=*&geometry={}&geometryType=esriGeometryEnvelope\
         &inSR={}&spatialRel=esriSpatialRelIntersects&outSR={}&resultRecordCount={}&returnGeometry=true",
        base_url,
        urlencoding::encode("1=1"),
        urlencoding::encode(&bounds.envelope()),
        WGS84_WKID,
        WGS84_WKID,
        max_features,
    )
}

/// Parses a query response body.
///
/// ArcGIS reports failures as HTTP 200 with an `{"error": {...}}` body;
/// those map to `OverlayError::Service`.
pub fn parse_feature_collection(body: &str) -> Result<FeatureCollection, OverlayError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| OverlayError::Decode(format!("invalid JSON: {}", e)))?;

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified service error");
        return Err(OverlayError::Service(match code {
            Some(code) => format!("{} (code {})", message, code),
            None => message.to_string(),
        }));
    }

    let collection: FeatureCollection = serde_json::from_value(value)
        .map_err(|e| OverlayError::Decode(e.to_string()))?;
    collection.validate()?;
    Ok(collection)
}

/// Blocking client for one feature layer.
pub struct ArcGisFeatureService {
    client: Client,
    base_url: String,
}

impl ArcGisFeatureService {
    /// Requests carry no timeout: a hung request is abandoned when a newer
    /// viewport, a toggle-off or teardown supersedes it.
    pub fn new(base_url: &str) -> Result<Self, OverlayError> {
        let base_url = normalize_base_url(base_url).ok_or(OverlayError::NotConfigured)?;
        let client = Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| OverlayError::Network(e.to_string()))?;
        Ok(ArcGisFeatureService { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl FeatureService for ArcGisFeatureService {
    fn query(&self, bounds: &Bounds, max_features: u32) -> Result<FeatureCollection, OverlayError> {
        let url = build_query_url(&self.base_url, bounds, max_features);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/geo+json, application/json")
            .send()
            .map_err(|e| OverlayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OverlayError::HttpStatus(status.as_u16()));
        }

        let body = response.text().map_err(|e| OverlayError::Network(e.to_string()))?;
        parse_feature_collection(&body)
    }
}
