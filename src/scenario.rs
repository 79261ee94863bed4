use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::incident::{Corridor, SeverityRules, DUPLICATE_RADIUS_M};

fn default_duration_ticks() -> u64 {
    3_600
}

fn default_weather_poll_ticks() -> u64 {
    1
}

fn default_incident_poll_ticks() -> u64 {
    900
}

fn default_latitude() -> f64 {
    52.42
}

fn default_longitude() -> f64 {
    10.78
}

fn default_weather_endpoint() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

fn default_weather_timeout() -> f64 {
    10.0
}

fn default_incident_base_url() -> String {
    "https://verkehr.autobahn.de/o/autobahn".to_string()
}

fn default_incident_timeout() -> f64 {
    5.0
}

fn default_corridors() -> Vec<Corridor> {
    vec![Corridor::A2, Corridor::A39]
}

fn default_services() -> Vec<String> {
    vec![
        "warning".to_string(),
        "roadworks".to_string(),
        "closure".to_string(),
    ]
}

fn default_dedup_radius() -> f64 {
    DUPLICATE_RADIUS_M
}

fn default_high_penalty() -> f64 {
    100_000.0
}

fn default_medium_penalty() -> f64 {
    10_000.0
}

fn default_low_penalty() -> f64 {
    2_000.0
}

fn default_high_radius() -> f64 {
    200.0
}

fn default_medium_radius() -> f64 {
    100.0
}

fn default_low_radius() -> f64 {
    50.0
}

fn default_length_fraction() -> f64 {
    0.1
}

fn default_max_length_bonus() -> f64 {
    100.0
}

fn default_cell_size() -> f64 {
    250.0
}

fn default_router_binary() -> PathBuf {
    PathBuf::from("duarouter")
}

fn default_minimal_route_count() -> usize {
    2
}

fn default_max_speed() -> f64 {
    19.44
}

fn default_speed_dev() -> f64 {
    0.1
}

fn default_accel() -> f64 {
    2.6
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WeatherMode {
    Live,
    /// Fixed severe-storm observation, never touches the network.
    #[default]
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_duration_ticks")]
    pub duration_ticks: u64,
    #[serde(default)]
    pub seed: u64,
    pub paths: PathsConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub incidents: IncidentConfig,
    #[serde(default)]
    pub penalties: PenaltyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub simulator: KinematicConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub network_file: PathBuf,
    pub trip_file: PathBuf,
    /// Pre-computed initial routes; generated from the trips when absent.
    #[serde(default)]
    pub route_file: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default)]
    pub mode: WeatherMode,
    #[serde(default = "default_weather_poll_ticks")]
    pub poll_interval_ticks: u64,
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
    #[serde(default = "default_weather_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_weather_timeout")]
    pub timeout_secs: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            mode: WeatherMode::default(),
            poll_interval_ticks: default_weather_poll_ticks(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            endpoint: default_weather_endpoint(),
            timeout_secs: default_weather_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    #[serde(default = "default_incident_poll_ticks")]
    pub poll_interval_ticks: u64,
    #[serde(default = "default_corridors")]
    pub corridors: Vec<Corridor>,
    #[serde(default = "default_incident_base_url")]
    pub base_url: String,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_incident_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_dedup_radius")]
    pub dedup_radius_m: f64,
    #[serde(default)]
    pub severity_rules: SeverityRules,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ticks: default_incident_poll_ticks(),
            corridors: default_corridors(),
            base_url: default_incident_base_url(),
            services: default_services(),
            timeout_secs: default_incident_timeout(),
            dedup_radius_m: default_dedup_radius(),
            severity_rules: SeverityRules::default(),
        }
    }
}

/// Routing penalties and incident-to-segment matching radii per severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_high_penalty")]
    pub high: f64,
    #[serde(default = "default_medium_penalty")]
    pub medium: f64,
    #[serde(default = "default_low_penalty")]
    pub low: f64,
    #[serde(default = "default_high_radius")]
    pub high_radius_m: f64,
    #[serde(default = "default_medium_radius")]
    pub medium_radius_m: f64,
    #[serde(default = "default_low_radius")]
    pub low_radius_m: f64,
    /// Share of a segment's length added to the matching radius.
    #[serde(default = "default_length_fraction")]
    pub length_fraction: f64,
    #[serde(default = "default_max_length_bonus")]
    pub max_length_bonus_m: f64,
    #[serde(default = "default_cell_size")]
    pub index_cell_size_m: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            high: default_high_penalty(),
            medium: default_medium_penalty(),
            low: default_low_penalty(),
            high_radius_m: default_high_radius(),
            medium_radius_m: default_medium_radius(),
            low_radius_m: default_low_radius(),
            length_fraction: default_length_fraction(),
            max_length_bonus_m: default_max_length_bonus(),
            index_cell_size_m: default_cell_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_router_binary")]
    pub router_binary: PathBuf,
    /// Network in the router's own format. Defaults to `paths.network_file`.
    #[serde(default)]
    pub network_file: Option<PathBuf>,
    /// Scratch directory for router input and output files.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_minimal_route_count")]
    pub minimal_route_count: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            router_binary: default_router_binary(),
            network_file: None,
            work_dir: None,
            minimal_route_count: default_minimal_route_count(),
        }
    }
}

/// Vehicle parameters for the built-in kinematic simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinematicConfig {
    #[serde(default = "default_max_speed")]
    pub max_speed_mps: f64,
    #[serde(default = "default_speed_dev")]
    pub speed_dev: f64,
    #[serde(default = "default_accel")]
    pub accel_mps2: f64,
}

impl Default for KinematicConfig {
    fn default() -> Self {
        Self {
            max_speed_mps: default_max_speed(),
            speed_dev: default_speed_dev(),
            accel_mps2: default_accel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration validation error: {0}")]
    Validation(String),
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation("run must define a name".into()));
        }
        if self.duration_ticks == 0 {
            return Err(ConfigError::Validation(
                "duration_ticks must be greater than zero".into(),
            ));
        }
        if self.weather.poll_interval_ticks == 0 || self.incidents.poll_interval_ticks == 0 {
            return Err(ConfigError::Validation(
                "poll intervals must be greater than zero".into(),
            ));
        }
        if !(self.weather.timeout_secs > 0.0 && self.incidents.timeout_secs > 0.0) {
            return Err(ConfigError::Validation(
                "feed timeouts must be positive".into(),
            ));
        }
        if self.incidents.dedup_radius_m < 0.0 {
            return Err(ConfigError::Validation(
                "dedup_radius_m must not be negative".into(),
            ));
        }
        let penalties = &self.penalties;
        for (label, value) in [
            ("high", penalties.high),
            ("medium", penalties.medium),
            ("low", penalties.low),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::Validation(format!(
                    "{label} penalty must be non-negative"
                )));
            }
        }
        if !(penalties.high > penalties.medium && penalties.medium > penalties.low) {
            return Err(ConfigError::Validation(
                "penalties must be ordered high > medium > low".into(),
            ));
        }
        if self.routing.minimal_route_count == 0 {
            return Err(ConfigError::Validation(
                "minimal_route_count must be at least one".into(),
            ));
        }
        if !(self.simulator.max_speed_mps > 0.0) {
            return Err(ConfigError::Validation(
                "simulator max_speed_mps must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn router_network_file(&self) -> PathBuf {
        self.routing
            .network_file
            .clone()
            .unwrap_or_else(|| self.paths.network_file.clone())
    }

    /// Directory the route engine writes collaborator files into.
    pub fn routing_work_dir(&self) -> PathBuf {
        self.routing
            .work_dir
            .clone()
            .unwrap_or_else(|| self.paths.output_dir.join("routing"))
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.paths.network_file);
        resolve(&mut self.paths.trip_file);
        if let Some(route_file) = self.paths.route_file.as_mut() {
            resolve(route_file);
        }
        resolve(&mut self.paths.output_dir);
        if let Some(work_dir) = self.routing.work_dir.as_mut() {
            resolve(work_dir);
        }
        if let Some(network_file) = self.routing.network_file.as_mut() {
            resolve(network_file);
        }
    }
}

pub struct ScenarioLoader {
    base_dir: PathBuf,
}

impl ScenarioLoader {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Reads, validates and path-resolves a run configuration. Relative paths
    /// inside the file are taken relative to the file's own directory.
    pub fn load(&self, file: impl AsRef<Path>) -> Result<RunConfig> {
        let path = self.base_dir.join(file);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run configuration {}", path.display()))?;
        let mut config: RunConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid run configuration {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }
}
