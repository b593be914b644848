//! Display resolution for water-body feature properties.
//!
//! Feature layers name their attributes differently (`NAME`, `Name`,
//! `WATERBODY`, ...). Each displayed field tries an ordered list of
//! candidate keys and falls back to a fixed sentinel; a missing or
//! malformed property is never an error.

use serde::Serialize;
use serde_json::{Map, Value};

pub const NAME_KEYS: &[&str] = &["NAME", "Name", "WATERBODY", "Waterbody", "waterbody"];
pub const STATE_KEYS: &[&str] = &["STATE", "STATE_NAME", "State"];
pub const CATEGORY_KEYS: &[&str] = &["CATEGORY", "Type", "TYPE"];
pub const AREA_KEYS: &[&str] = &["AREA_SQKM", "Area_sqkm", "area_sqkm", "AREA", "Shape_Area"];

pub const NAME_FALLBACK: &str = "Water Body";
pub const STATE_FALLBACK: &str = "Unknown";
pub const CATEGORY_FALLBACK: &str = "N/A";
pub const AREA_FALLBACK: &str = "Not provided";

/// Areas above this (in unlabelled units) are taken to be square metres.
const SQUARE_METRE_CUTOFF: f64 = 1_000.0;

/// First candidate whose value is a non-blank string, trimmed.
pub fn resolve_text(properties: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| properties.get(*key)?.as_str())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(String::from)
}

pub fn resolve_or(properties: &Map<String, Value>, keys: &[&str], fallback: &str) -> String {
    resolve_text(properties, keys).unwrap_or_else(|| fallback.to_string())
}

fn positive_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}

/// Area in square kilometres from the first usable area attribute.
///
/// Keys mentioning `sqkm` are already in km². Other keys are assumed to be
/// m² when the value exceeds 1000, km² otherwise.
pub fn area_sq_km(properties: &Map<String, Value>) -> Option<f64> {
    AREA_KEYS.iter().find_map(|key| {
        let value = positive_number(properties.get(*key)?)?;
        if key.to_ascii_lowercase().contains("sqkm") || value <= SQUARE_METRE_CUTOFF {
            Some(value)
        } else {
            Some(value / 1_000_000.0)
        }
    })
}

pub fn format_area(properties: &Map<String, Value>) -> Option<String> {
    area_sq_km(properties).map(|km2| format!("{:.2} sq km", km2))
}

/// The fields shown for a selected water body, sentinels applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaterBodyDetails {
    pub name: String,
    pub state: String,
    pub area: String,
    pub category: String,
}

impl WaterBodyDetails {
    pub fn from_properties(properties: &Map<String, Value>) -> Self {
        WaterBodyDetails {
            name: resolve_or(properties, NAME_KEYS, NAME_FALLBACK),
            state: resolve_or(properties, STATE_KEYS, STATE_FALLBACK),
            area: format_area(properties).unwrap_or_else(|| AREA_FALLBACK.to_string()),
            category: resolve_or(properties, CATEGORY_KEYS, CATEGORY_FALLBACK),
        }
    }
}
