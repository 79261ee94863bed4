//! Run reports: a JSON file in the output directory and a logged summary.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::{
    metrics::{IncidentCycle, MetricsCollector, MetricsSummary, StepRecord, WeatherChange},
    routing::TierAttempt,
    scenario::WeatherMode,
};

pub const REPORT_FILE_NAME: &str = "report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationReached,
    NoVehiclesRemaining,
    Cancelled,
    SimulatorFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_name: String,
    pub weather_mode: WeatherMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ticks_completed: u64,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub summary: MetricsSummary,
    pub steps: Vec<StepRecord>,
    pub weather_changes: Vec<WeatherChange>,
    pub incident_cycles: Vec<IncidentCycle>,
    pub route_attempts: Vec<RouteAttemptLog>,
}

/// Tier attempts of one route build, tagged with the tick it ran on.
#[derive(Debug, Clone, Serialize)]
pub struct RouteAttemptLog {
    pub tick: u64,
    pub attempts: Vec<TierAttempt>,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub fn from_metrics(
        run_name: impl Into<String>,
        weather_mode: WeatherMode,
        started_at: DateTime<Utc>,
        ticks_completed: u64,
        stop_reason: StopReason,
        failure: Option<String>,
        metrics: &MetricsCollector,
        route_attempts: Vec<RouteAttemptLog>,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            weather_mode,
            started_at,
            finished_at: Utc::now(),
            ticks_completed,
            stop_reason,
            failure,
            summary: metrics.summary(),
            steps: metrics.steps().to_vec(),
            weather_changes: metrics.weather_changes().to_vec(),
            incident_cycles: metrics.incident_cycles().to_vec(),
            route_attempts,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait Reporter {
    fn report(&mut self, report: &RunReport) -> Result<(), ReportError>;
}

pub struct JsonReportWriter {
    output_dir: PathBuf,
    last_path: Option<PathBuf>,
}

impl JsonReportWriter {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            last_path: None,
        }
    }

    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }
}

impl Reporter for JsonReportWriter {
    fn report(&mut self, report: &RunReport) -> Result<(), ReportError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| ReportError::Io {
            path: self.output_dir.clone(),
            source,
        })?;
        let path = self.output_dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        info!("report written to {}", path.display());
        self.last_path = Some(path);
        Ok(())
    }
}

/// Logs the run summary and the weather change log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, report: &RunReport) -> Result<(), ReportError> {
        let summary = &report.summary;
        info!(
            "run '{}' finished after {} ticks ({:?})",
            report.run_name, report.ticks_completed, report.stop_reason
        );
        info!(
            "mean speed {:.2} km/h, peak {:.2} km/h",
            summary.mean_speed_kmh, summary.peak_speed_kmh
        );
        info!(
            "{} incident checks, {} reroutes, {} weather changes",
            summary.incident_checks, summary.reroutes, summary.weather_changes
        );
        for change in &report.weather_changes {
            info!(
                "  tick {:>5}: {} (friction {:.2})",
                change.tick, change.label, change.friction
            );
        }
        if let Some(failure) = &report.failure {
            info!("run ended early: {failure}");
        }
        Ok(())
    }
}

/// Hands the report to several reporters; the first error wins but every
/// reporter still runs.
pub struct ReportFanout {
    reporters: Vec<Box<dyn Reporter + Send>>,
}

impl ReportFanout {
    pub fn new(reporters: Vec<Box<dyn Reporter + Send>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for ReportFanout {
    fn report(&mut self, report: &RunReport) -> Result<(), ReportError> {
        let mut first_error = None;
        for reporter in &mut self.reporters {
            if let Err(err) = reporter.report(report) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
