/// Derived views over the current telemetry for the summary panels.
///
/// Submodules:
/// - `kpi` for fleet counts, health distributions and delivery SLA.
/// - `rankings` for largest movers, latest reporters and basin trends.

pub mod kpi;
pub mod rankings;
