/// Dashboard configuration loader - parses dashboard.toml
///
/// Keeps classification policy, data-source descriptors and overlay
/// limits out of code. Every key is optional. Connection descriptors can
/// be overridden from the environment (`DATABASE_URL`,
/// `FEATURE_SERVICE_URL`, loaded through `.env` when present); blank
/// values count as absent, and absence is a supported mode: no database
/// means the baseline dataset, no feature service means no overlay.

use chrono::Duration;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::alert::classify::{ClassificationPolicy, DEFAULT_OFFLINE_AFTER_HOURS};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "dashboard.toml";

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const FEATURE_SERVICE_URL_ENV: &str = "FEATURE_SERVICE_URL";

/// Classification policy values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    pub offline_after_hours: f64,
    pub warning_offset: f64,
    pub danger_offset: f64,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        ClassificationSettings {
            offline_after_hours: DEFAULT_OFFLINE_AFTER_HOURS as f64,
            warning_offset: 0.0,
            danger_offset: 0.0,
        }
    }
}

impl ClassificationSettings {
    pub fn policy(&self) -> ClassificationPolicy {
        let seconds = (self.offline_after_hours.max(0.0) * 3600.0).round() as i64;
        ClassificationPolicy {
            offline_after: Duration::seconds(seconds),
            warning_offset: self.warning_offset,
            danger_offset: self.danger_offset,
        }
    }
}

/// Station telemetry source settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Resource path of the station collection (also the NOTIFY channel).
    pub station_path: String,
    pub database_url: Option<String>,
    /// How long the listener blocks between shutdown checks.
    pub notify_poll_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        TelemetrySettings {
            station_path: "stations".to_string(),
            database_url: None,
            notify_poll_ms: 500,
        }
    }
}

/// Water-body overlay settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub feature_service_url: Option<String>,
    pub result_record_count: u32,
    pub workers: usize,
    /// Viewport edges must move more than this to trigger a refetch.
    pub min_viewport_delta_deg: f64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        OverlaySettings {
            feature_service_url: None,
            result_record_count: 2000,
            workers: 4,
            min_viewport_delta_deg: 0.0001,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub classification: ClassificationSettings,
    pub telemetry: TelemetrySettings,
    pub overlay: OverlaySettings,
    pub endpoint: EndpointSettings,
}

#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Io { path: String, source: std::io::Error },
    /// The file is not valid configuration.
    Parse { path: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "Failed to read {}: {}", path, source),
            ConfigError::Parse { path, message } => write!(f, "Failed to parse {}: {}", path, message),
        }
    }
}

impl std::error::Error for ConfigError {}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl DashboardConfig {
    /// Builds configuration from TOML text plus an environment lookup.
    /// `origin` names the source in parse errors.
    pub fn from_sources(
        toml_text: &str,
        origin: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<DashboardConfig, ConfigError> {
        let mut config: DashboardConfig = toml::from_str(toml_text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

        if let Some(url) = non_blank(env(DATABASE_URL_ENV)) {
            config.telemetry.database_url = Some(url);
        }
        if let Some(url) = non_blank(env(FEATURE_SERVICE_URL_ENV)) {
            config.overlay.feature_service_url = Some(url);
        }
        config.telemetry.database_url = non_blank(config.telemetry.database_url.take());
        config.overlay.feature_service_url = non_blank(config.overlay.feature_service_url.take());

        Ok(config)
    }

    /// Loads `path` (missing file means defaults) and applies the process
    /// environment, after reading `.env` if one exists.
    pub fn load(path: &Path) -> Result<DashboardConfig, ConfigError> {
        dotenv::dotenv().ok();

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(ConfigError::Io { path: path.display().to_string(), source });
            }
        };

        DashboardConfig::from_sources(&text, &path.display().to_string(), |key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DashboardConfig::from_sources("", "dashboard.toml", no_env).unwrap();
        assert_eq!(config, DashboardConfig::default());
        assert_eq!(config.classification.policy(), ClassificationPolicy::default());
        assert_eq!(config.telemetry.station_path, "stations");
        assert_eq!(config.overlay.result_record_count, 2000);
        assert!(config.telemetry.database_url.is_none());
        assert!(config.overlay.feature_service_url.is_none());
    }

    #[test]
    fn test_shipped_config_parses() {
        let text = fs::read_to_string(DEFAULT_CONFIG_PATH).expect("dashboard.toml should exist");
        let config = DashboardConfig::from_sources(&text, DEFAULT_CONFIG_PATH, no_env).unwrap();
        assert_eq!(config.classification.offline_after_hours, 6.0);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let text = r#"
            [classification]
            offline_after_hours = 1.5
            danger_offset = -0.25

            [overlay]
            feature_service_url = "https://example.test/arcgis/rest/services/Water/FeatureServer/0"
        "#;
        let config = DashboardConfig::from_sources(text, "t.toml", no_env).unwrap();
        let policy = config.classification.policy();
        assert_eq!(policy.offline_after, Duration::minutes(90));
        assert_eq!(policy.warning_offset, 0.0);
        assert_eq!(policy.danger_offset, -0.25);
        assert_eq!(config.overlay.workers, 4);
        assert!(config.overlay.feature_service_url.is_some());
    }

    #[test]
    fn test_environment_overrides_file() {
        let text = r#"
            [telemetry]
            database_url = "postgresql://file@localhost/telemetry"
        "#;
        let env = |key: &str| match key {
            DATABASE_URL_ENV => Some("postgresql://env@localhost/telemetry".to_string()),
            FEATURE_SERVICE_URL_ENV => Some("https://features.test/0".to_string()),
            _ => None,
        };
        let config = DashboardConfig::from_sources(text, "t.toml", env).unwrap();
        assert_eq!(config.telemetry.database_url.as_deref(), Some("postgresql://env@localhost/telemetry"));
        assert_eq!(config.overlay.feature_service_url.as_deref(), Some("https://features.test/0"));
    }

    #[test]
    fn test_blank_values_count_as_absent() {
        let text = r#"
            [overlay]
            feature_service_url = "   "
        "#;
        let env = |key: &str| (key == DATABASE_URL_ENV).then(|| "".to_string());
        let config = DashboardConfig::from_sources(text, "t.toml", env).unwrap();
        assert!(config.telemetry.database_url.is_none());
        assert!(config.overlay.feature_service_url.is_none());
    }

    #[test]
    fn test_malformed_file_names_origin() {
        let err = DashboardConfig::from_sources("[overlay\nworkers = ", "broken.toml", no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config = DashboardConfig::load(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.classification, ClassificationSettings::default());
        assert_eq!(config.overlay.result_record_count, 2000);
    }
}
