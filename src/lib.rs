/// basin_dashboard: operations core for a river-basin water-level monitoring dashboard.
///
/// # Module structure
///
/// ```text
/// basin_dashboard
/// ├── model       shared data types (Station, Alert, BasinSummary, Bounds, error enums)
/// ├── config      policy + connection settings (dashboard.toml, environment)
/// ├── db          PostgreSQL connection and schema validation
/// ├── logging     leveled, component-tagged logger
/// ├── alert
/// │   ├── classify     status derivation from thresholds and staleness
/// │   └── acknowledge  optimistic, single-flight alert acknowledgement
/// ├── telemetry
/// │   ├── baseline  embedded fallback dataset + fixture backend
/// │   ├── postgres  database backend and LISTEN/NOTIFY push feed
/// │   └── source    shared live channels with baseline fallback
/// ├── overlay
/// │   ├── arcgis      feature layer query URL + GeoJSON parsing
/// │   └── properties  tolerant property lookup for water bodies
/// ├── filter      region / status filtering
/// ├── analysis
/// │   ├── kpi       fleet counts, health buckets, delivery SLA
/// │   └── rankings  movers, latest reporters, basin trends
/// ├── dashboard   top-level state container and lifecycle
/// └── endpoint    JSON HTTP API over the dashboard
/// ```

/// Public modules
pub mod alert;
pub mod analysis;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod endpoint;
pub mod filter;
pub mod logging;
pub mod model;
pub mod overlay;
pub mod telemetry;
