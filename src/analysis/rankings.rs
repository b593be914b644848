/// Ranked station and basin lists for the summary panels.

use serde::Serialize;

use crate::model::{BasinSummary, Station, StationStatus};

pub const DEFAULT_TOP_MOVERS: usize = 5;
pub const DEFAULT_LATEST_STATIONS: usize = 3;
pub const DEFAULT_BASIN_TRENDS: usize = 5;

/// Which reading delta a ranking uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeWindow {
    OneHour,
    #[default]
    Day,
}

impl ChangeWindow {
    pub fn parse(s: &str) -> Option<ChangeWindow> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" | "hour" => Some(ChangeWindow::OneHour),
            "24h" | "day" => Some(ChangeWindow::Day),
            _ => None,
        }
    }

    pub fn change_of(&self, station: &Station) -> f64 {
        match self {
            ChangeWindow::OneHour => station.last_reading.change_1h,
            ChangeWindow::Day => station.last_reading.change_24h,
        }
    }
}

/// One row of the "largest changes" panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mover {
    pub station_id: String,
    pub station_name: String,
    pub basin: String,
    pub status: StationStatus,
    pub change: f64,
    pub water_level: f64,
}

/// Stations with the largest absolute change over `window`, largest first.
/// Offline stations are skipped; ties keep input order.
pub fn top_movers(stations: &[Station], window: ChangeWindow, count: usize) -> Vec<Mover> {
    let mut ranked: Vec<&Station> = stations
        .iter()
        .filter(|s| s.status != StationStatus::Offline)
        .collect();
    ranked.sort_by(|a, b| window.change_of(b).abs().total_cmp(&window.change_of(a).abs()));

    ranked
        .into_iter()
        .take(count)
        .map(|s| Mover {
            station_id: s.id.clone(),
            station_name: s.name.clone(),
            basin: s.basin.clone(),
            status: s.status,
            change: window.change_of(s),
            water_level: s.last_reading.water_level,
        })
        .collect()
}

/// Most recently reporting stations, newest first.
pub fn latest_stations(stations: &[Station], limit: usize) -> Vec<Station> {
    let mut ranked: Vec<&Station> = stations.iter().collect();
    ranked.sort_by(|a, b| b.last_reading.timestamp.cmp(&a.last_reading.timestamp));
    ranked.into_iter().take(limit).cloned().collect()
}

/// Basins with the largest absolute 24h average change, largest first.
pub fn basin_trends(basins: &[BasinSummary], count: usize) -> Vec<BasinSummary> {
    let mut ranked: Vec<&BasinSummary> = basins.iter().collect();
    ranked.sort_by(|a, b| b.avg_change_24h.abs().total_cmp(&a.avg_change_24h.abs()));
    ranked.into_iter().take(count).cloned().collect()
}
