//! Per-tick speed samples plus logs of weather changes and incident checks.

use serde::Serialize;

use crate::{
    road_state::SeverityCounts, routing::RouteTier, simulator::SpeedSample,
    weather::WeatherObservation,
};

const MPS_TO_KMH: f64 = 3.6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub tick: u64,
    pub average_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub weather_label: String,
    pub friction: f64,
    pub vehicle_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherChange {
    pub tick: u64,
    pub code: i32,
    pub label: String,
    pub friction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentCycle {
    pub tick: u64,
    pub incidents: usize,
    pub changed: bool,
    pub penalized: SeverityCounts,
    pub reroute_tier: Option<RouteTier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub steps: usize,
    pub mean_speed_kmh: f64,
    pub peak_speed_kmh: f64,
    pub weather_changes: usize,
    pub incident_checks: usize,
    pub reroutes: usize,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    steps: Vec<StepRecord>,
    weather_changes: Vec<WeatherChange>,
    incident_cycles: Vec<IncidentCycle>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step(
        &mut self,
        tick: u64,
        samples: &[SpeedSample],
        weather: &WeatherObservation,
        vehicle_count: usize,
    ) -> &StepRecord {
        let (average, max) = if samples.is_empty() {
            (0.0, 0.0)
        } else {
            let sum: f64 = samples.iter().map(|sample| sample.speed_mps).sum();
            let max = samples
                .iter()
                .map(|sample| sample.speed_mps)
                .fold(0.0_f64, f64::max);
            (sum / samples.len() as f64, max)
        };
        self.steps.push(StepRecord {
            tick,
            average_speed_kmh: average * MPS_TO_KMH,
            max_speed_kmh: max * MPS_TO_KMH,
            weather_label: weather.label.clone(),
            friction: weather.coefficient,
            vehicle_count,
        });
        &self.steps[self.steps.len() - 1]
    }

    /// Logs `weather` if it differs from the last logged condition. Returns
    /// whether it was logged.
    pub fn record_weather(&mut self, tick: u64, weather: &WeatherObservation) -> bool {
        let changed = self.weather_changes.last().map_or(true, |last| {
            last.code != weather.code || last.friction != weather.coefficient
        });
        if changed {
            self.weather_changes.push(WeatherChange {
                tick,
                code: weather.code,
                label: weather.label.clone(),
                friction: weather.coefficient,
            });
        }
        changed
    }

    pub fn record_incident_cycle(&mut self, cycle: IncidentCycle) {
        self.incident_cycles.push(cycle);
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn weather_changes(&self) -> &[WeatherChange] {
        &self.weather_changes
    }

    pub fn incident_cycles(&self) -> &[IncidentCycle] {
        &self.incident_cycles
    }

    pub fn summary(&self) -> MetricsSummary {
        let steps = self.steps.len();
        let mean_speed_kmh = if steps == 0 {
            0.0
        } else {
            self.steps.iter().map(|s| s.average_speed_kmh).sum::<f64>() / steps as f64
        };
        MetricsSummary {
            steps,
            mean_speed_kmh,
            peak_speed_kmh: self
                .steps
                .iter()
                .map(|s| s.max_speed_kmh)
                .fold(0.0, f64::max),
            weather_changes: self.weather_changes.len(),
            incident_checks: self.incident_cycles.len(),
            reroutes: self
                .incident_cycles
                .iter()
                .filter(|cycle| cycle.reroute_tier.is_some())
                .count(),
        }
    }
}
