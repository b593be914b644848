//! Basin Dashboard - service entry point
//!
//! Loads configuration, starts the dashboard (live telemetry when a
//! database is configured, the baseline dataset otherwise) and either
//! serves the JSON endpoint or keeps refreshing alerts and basin
//! summaries in the foreground.
//!
//! Usage:
//!   cargo run --release                              # Refresh loop only
//!   cargo run --release -- --endpoint 8080           # Serve HTTP on port 8080
//!   cargo run --release -- --config other.toml       # Alternate policy file
//!   cargo run --release -- --log-level debug --log-file dashboard.log
//!
//! Environment:
//!   DATABASE_URL        - PostgreSQL connection string (optional)
//!   FEATURE_SERVICE_URL - water-body feature layer URL (optional)

use basin_dashboard::config::{DashboardConfig, DEFAULT_CONFIG_PATH};
use basin_dashboard::dashboard::{self, Dashboard};
use basin_dashboard::endpoint;
use basin_dashboard::logging::{self, Component, LogLevel};
use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Alerts and basin summaries are read on request; this is how often the
/// foreground loop re-reads them.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct Args {
    config_path: PathBuf,
    endpoint_port: Option<u16>,
    log_level: LogLevel,
    log_file: Option<String>,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {} [--config PATH] [--endpoint PORT] [--log-level debug|info|warn|error] [--log-file PATH]",
        program
    )
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let program = args.first().map(String::as_str).unwrap_or("basin_dashboard");
    let mut parsed = Args {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        endpoint_port: None,
        log_level: LogLevel::Info,
        log_file: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).ok_or_else(|| format!("{} requires a value\n{}", flag, usage(program)))?;
        match flag {
            "--config" => parsed.config_path = PathBuf::from(value),
            "--endpoint" => {
                let port = value.parse().map_err(|_| format!("Invalid port: {}", value))?;
                parsed.endpoint_port = Some(port);
            }
            "--log-level" => {
                parsed.log_level = LogLevel::parse(value).ok_or_else(|| format!("Invalid log level: {}", value))?;
            }
            "--log-file" => parsed.log_file = Some(value.clone()),
            _ => return Err(format!("Unknown argument: {}\n{}", flag, usage(program))),
        }
        i += 2;
    }
    Ok(parsed)
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    logging::init_logger(args.log_level, args.log_file.as_deref());

    let config = DashboardConfig::load(&args.config_path)?;
    logging::info(
        Component::System,
        None,
        &format!("configuration loaded from {}", args.config_path.display()),
    );

    let dashboard = Arc::new(Dashboard::from_config(&config, dashboard::system_clock())?);
    dashboard.start();

    let summary = dashboard.summary();
    logging::info(
        Component::System,
        None,
        &format!(
            "{} stations ({} active, {} warning, {} danger, {} offline), {} open alerts, live: {}",
            summary.system.total_stations,
            summary.system.active_stations,
            summary.system.warning_stations,
            summary.system.danger_stations,
            summary.system.offline_stations,
            dashboard.open_alert_count(),
            summary.live,
        ),
    );

    if let Some(port) = args.endpoint_port.or(config.endpoint.port) {
        let refresher = Arc::clone(&dashboard);
        thread::Builder::new()
            .name("refresh".to_string())
            .spawn(move || refresh_loop(&refresher))?;
        endpoint::start_endpoint_server(port, Arc::clone(&dashboard))?;
    } else {
        refresh_loop(&dashboard);
    }

    dashboard.stop();
    Ok(())
}

fn refresh_loop(dashboard: &Dashboard) {
    loop {
        thread::sleep(REFRESH_INTERVAL);
        dashboard.refresh();
        if let Some(err) = dashboard.last_error() {
            logging::warn(Component::System, None, &format!("degraded: {}", err));
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let parsed = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(2);
        }
    };

    if let Err(e) = run(parsed) {
        eprintln!("Basin dashboard failed: {}", e);
        process::exit(1);
    }
}
