/// Region and status filtering for the station map and list views.
///
/// `filter_stations` is pure and order-preserving. Region options are
/// derived from the station collection itself, so they follow the data
/// as basins appear or disappear.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::{Station, StationStatus};

/// Sentinel region meaning "no region restriction".
pub const ALL_REGIONS: &str = "All";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegionFilter {
    #[default]
    All,
    /// Exact match against `station.basin`.
    Basin(String),
}

impl RegionFilter {
    /// `"All"` (or blank) is the sentinel; anything else names a basin.
    pub fn parse(s: &str) -> RegionFilter {
        let s = s.trim();
        if s.is_empty() || s == ALL_REGIONS {
            RegionFilter::All
        } else {
            RegionFilter::Basin(s.to_string())
        }
    }

    pub fn matches(&self, station: &Station) -> bool {
        match self {
            RegionFilter::All => true,
            RegionFilter::Basin(basin) => station.basin == *basin,
        }
    }
}

impl fmt::Display for RegionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionFilter::All => f.write_str(ALL_REGIONS),
            RegionFilter::Basin(basin) => f.write_str(basin),
        }
    }
}

/// Set of statuses to show. Empty means every status passes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusFilter {
    statuses: BTreeSet<StationStatus>,
}

impl StatusFilter {
    pub fn any() -> Self {
        StatusFilter::default()
    }

    pub fn only(statuses: impl IntoIterator<Item = StationStatus>) -> Self {
        StatusFilter { statuses: statuses.into_iter().collect() }
    }

    /// Parses a comma-separated list such as `"Warning,Danger"`.
    /// Unrecognized names are returned as the error.
    pub fn parse_list(s: &str) -> Result<Self, String> {
        let mut statuses = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status = StationStatus::parse(part).ok_or_else(|| part.to_string())?;
            statuses.insert(status);
        }
        Ok(StatusFilter { statuses })
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn contains(&self, status: StationStatus) -> bool {
        self.statuses.contains(&status)
    }

    pub fn matches(&self, station: &Station) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&station.status)
    }

    /// Adds `status` if absent, removes it if present (map legend chips).
    pub fn toggle(&mut self, status: StationStatus) {
        if !self.statuses.remove(&status) {
            self.statuses.insert(status);
        }
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
    }

    pub fn statuses(&self) -> impl Iterator<Item = StationStatus> + '_ {
        self.statuses.iter().copied()
    }
}

/// Stations passing both filters, in input order.
pub fn filter_stations(stations: &[Station], region: &RegionFilter, status: &StatusFilter) -> Vec<Station> {
    stations
        .iter()
        .filter(|s| region.matches(s) && status.matches(s))
        .cloned()
        .collect()
}

/// `"All"` followed by the distinct basins, sorted.
pub fn region_options(stations: &[Station]) -> Vec<String> {
    let basins: BTreeSet<&str> = stations.iter().map(|s| s.basin.as_str()).collect();
    std::iter::once(ALL_REGIONS.to_string())
        .chain(basins.into_iter().map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::baseline::Dataset;

    fn stations() -> Vec<Station> {
        Dataset::baseline().expect("baseline").stations
    }

    fn ids(stations: &[Station]) -> Vec<&str> {
        stations.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_all_and_empty_status_is_identity() {
        let input = stations();
        let out = filter_stations(&input, &RegionFilter::All, &StatusFilter::any());
        assert_eq!(out, input);
    }

    #[test]
    fn test_region_is_exact_basin_match() {
        let input = stations();
        let out = filter_stations(&input, &RegionFilter::parse("Ganges"), &StatusFilter::any());
        assert_eq!(ids(&out), vec!["ST002"]);

        let none = filter_stations(&input, &RegionFilter::parse("ganges"), &StatusFilter::any());
        assert!(none.is_empty(), "match is case-sensitive");
    }

    #[test]
    fn test_status_set_membership_preserves_order() {
        let input = stations();
        let filter = StatusFilter::only([StationStatus::Offline, StationStatus::Normal]);
        let out = filter_stations(&input, &RegionFilter::All, &filter);
        assert_eq!(ids(&out), vec!["ST001", "ST004", "ST005", "ST006"]);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let input = stations();
        let cases = [
            (RegionFilter::All, StatusFilter::only([StationStatus::Warning, StationStatus::Danger])),
            (RegionFilter::parse("Cauvery"), StatusFilter::any()),
            (RegionFilter::parse("Yamuna"), StatusFilter::only([StationStatus::Danger])),
        ];
        for (region, status) in cases {
            let once = filter_stations(&input, &region, &status);
            let twice = filter_stations(&once, &region, &status);
            assert_eq!(once, twice, "filtering twice with {} changed the result", region);
        }
    }

    #[test]
    fn test_input_is_not_mutated() {
        let input = stations();
        let copy = input.clone();
        let _ = filter_stations(&input, &RegionFilter::parse("Krishna"), &StatusFilter::only([StationStatus::Normal]));
        assert_eq!(input, copy);
    }

    #[test]
    fn test_region_options_are_derived_and_sorted() {
        let mut input = stations();
        assert_eq!(
            region_options(&input),
            vec!["All", "Brahmaputra", "Cauvery", "Ganges", "Godavari", "Krishna", "Yamuna"]
        );

        input.retain(|s| s.basin != "Cauvery");
        assert!(!region_options(&input).contains(&"Cauvery".to_string()));
        assert_eq!(region_options(&[]), vec!["All"]);
    }

    #[test]
    fn test_status_list_parsing_and_toggle() {
        let mut filter = StatusFilter::parse_list("warning, Danger").unwrap();
        assert!(filter.contains(StationStatus::Warning));
        assert!(filter.contains(StationStatus::Danger));
        assert_eq!(StatusFilter::parse_list("Flooded"), Err("Flooded".to_string()));
        assert!(StatusFilter::parse_list("").unwrap().is_empty());

        filter.toggle(StationStatus::Danger);
        assert!(!filter.contains(StationStatus::Danger));
        filter.toggle(StationStatus::Offline);
        assert_eq!(filter.statuses().collect::<Vec<_>>(), vec![StationStatus::Warning, StationStatus::Offline]);
    }
}
