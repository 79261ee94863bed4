//! Simulation driver: owns the tick loop, feeds weather friction to the
//! simulator every tick and re-routes when the incident picture changes.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    feed::FeedError,
    incident::{Corridor, IncidentDelta, IncidentFeed, IncidentRecord},
    metrics::{IncidentCycle, MetricsCollector},
    network::{Network, NetworkError},
    report::{
        JsonReportWriter, LogReporter, ReportError, ReportFanout, Reporter, RouteAttemptLog,
        RunReport, StopReason,
    },
    road_state::RoadStateResolver,
    routing::{
        RebuildOutcome, RouteEngine, RouteError, RoutePreprocessor, RouteSet, RouteTier,
        RouteValidationError, RouterProcess, TripDemand,
    },
    scenario::{KinematicConfig, PenaltyConfig, RunConfig, WeatherMode},
    simulator::{KinematicSimulator, SimulationConfig, Simulator, SimulatorError, SimulatorSession},
    weather::WeatherFeed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Stepping,
    Rerouting,
    Finalizing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Initializing => "initializing",
            Phase::Stepping => "stepping",
            Phase::Rerouting => "rerouting",
            Phase::Finalizing => "finalizing",
        };
        f.write_str(label)
    }
}

/// What happened during one tick, handed to the per-tick hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub tick: u64,
    pub friction: f64,
    pub weather_label: String,
    pub average_speed_kmh: f64,
    pub vehicle_count: usize,
    pub incident_poll: bool,
    pub reroute_tier: Option<RouteTier>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("initial routes are invalid: {0}")]
    InvalidRoutes(#[from] RouteValidationError),
    #[error("simulator failed at tick {tick}: {source}")]
    Simulator {
        tick: u64,
        #[source]
        source: SimulatorError,
    },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Routes(#[from] RouteError),
    #[error("failed to set up feed: {0}")]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub run_name: String,
    pub duration_ticks: u64,
    pub incident_poll_interval_ticks: u64,
    pub corridors: Vec<Corridor>,
    pub seed: u64,
    pub weather_mode: WeatherMode,
    pub penalties: PenaltyConfig,
    pub vehicle: KinematicConfig,
    pub minimal_route_count: usize,
}

impl DriverSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            run_name: config.name.clone(),
            duration_ticks: config.duration_ticks,
            incident_poll_interval_ticks: config.incidents.poll_interval_ticks,
            corridors: config.incidents.corridors.clone(),
            seed: config.seed,
            weather_mode: config.weather.mode,
            penalties: config.penalties.clone(),
            vehicle: config.simulator.clone(),
            minimal_route_count: config.routing.minimal_route_count,
        }
    }
}

pub struct DriverBuilder {
    settings: DriverSettings,
    network: Arc<Network>,
    trips: TripDemand,
    initial_routes: Option<RouteSet>,
    weather: Option<WeatherFeed>,
    incidents: Option<IncidentFeed>,
    router: Option<Box<dyn RoutePreprocessor + Send>>,
    simulator: Option<Box<dyn Simulator + Send>>,
    reporter: Option<Box<dyn Reporter + Send>>,
    stop: Option<Arc<AtomicBool>>,
}

impl DriverBuilder {
    pub fn new(settings: DriverSettings, network: Network, trips: TripDemand) -> Self {
        Self {
            settings,
            network: Arc::new(network),
            trips,
            initial_routes: None,
            weather: None,
            incidents: None,
            router: None,
            simulator: None,
            reporter: None,
            stop: None,
        }
    }

    /// Loads the network, trips and optional route file named in `config` and
    /// wires the live feeds, the router process, the kinematic simulator and
    /// the log and JSON reporters.
    pub fn from_config(config: &RunConfig) -> Result<Self, DriverError> {
        let network = Network::load(&config.paths.network_file)?;
        let trips = TripDemand::load(&config.paths.trip_file)?;
        let initial_routes = match &config.paths.route_file {
            Some(path) => Some(RouteSet::load(path)?),
            None => None,
        };
        let router = RouterProcess::new(
            &config.routing.router_binary,
            config.router_network_file(),
            config.routing_work_dir(),
            config.duration_ticks,
        );
        let reporters: Vec<Box<dyn Reporter + Send>> = vec![
            Box::new(LogReporter),
            Box::new(JsonReportWriter::new(&config.paths.output_dir)),
        ];

        let mut builder = Self::new(DriverSettings::from_config(config), network, trips)
            .with_weather(WeatherFeed::from_config(&config.weather)?)
            .with_incidents(IncidentFeed::from_config(&config.incidents)?)
            .with_router(router)
            .with_simulator(KinematicSimulator::new())
            .with_reporter(ReportFanout::new(reporters));
        if let Some(routes) = initial_routes {
            builder = builder.with_initial_routes(routes);
        }
        Ok(builder)
    }

    pub fn with_initial_routes(mut self, routes: RouteSet) -> Self {
        self.initial_routes = Some(routes);
        self
    }

    pub fn with_weather(mut self, weather: WeatherFeed) -> Self {
        self.weather = Some(weather);
        self
    }

    pub fn with_incidents(mut self, incidents: IncidentFeed) -> Self {
        self.incidents = Some(incidents);
        self
    }

    pub fn with_router(mut self, router: impl RoutePreprocessor + Send + 'static) -> Self {
        self.router = Some(Box::new(router));
        self
    }

    pub fn with_simulator(mut self, simulator: impl Simulator + Send + 'static) -> Self {
        self.simulator = Some(Box::new(simulator));
        self
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + Send + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn build(self) -> Result<Driver, DriverError> {
        let settings = self.settings;
        if settings.duration_ticks == 0 {
            return Err(DriverError::Precondition(
                "duration must be at least one tick".into(),
            ));
        }
        if settings.incident_poll_interval_ticks == 0 {
            return Err(DriverError::Precondition(
                "incident poll interval must be at least one tick".into(),
            ));
        }
        if self.network.is_empty() {
            return Err(DriverError::Precondition("network has no segments".into()));
        }
        let weather = match (self.weather, settings.weather_mode) {
            (Some(weather), _) => weather,
            (None, WeatherMode::Test) => WeatherFeed::test(),
            (None, WeatherMode::Live) => {
                return Err(DriverError::Precondition(
                    "live weather mode needs a weather feed".into(),
                ))
            }
        };
        let incidents = self
            .incidents
            .ok_or_else(|| DriverError::Precondition("no incident feed configured".into()))?;
        let router = self
            .router
            .ok_or_else(|| DriverError::Precondition("no route preprocessor configured".into()))?;

        Ok(Driver {
            road_state: RoadStateResolver::new(&self.network, settings.penalties.clone()),
            routes: RouteEngine::new(
                Arc::clone(&self.network),
                router,
                self.trips,
                settings.minimal_route_count,
            ),
            network: self.network,
            initial_routes: self.initial_routes,
            weather,
            incidents,
            simulator: self
                .simulator
                .unwrap_or_else(|| Box::new(KinematicSimulator::new())),
            reporter: self.reporter.unwrap_or_else(|| Box::new(LogReporter)),
            stop: self.stop.unwrap_or_default(),
            settings,
            phase: Phase::Initializing,
            metrics: MetricsCollector::new(),
            active_routes: RouteSet::default(),
            active_incidents: Vec::new(),
            route_log: Vec::new(),
        })
    }
}

pub struct Driver {
    settings: DriverSettings,
    network: Arc<Network>,
    initial_routes: Option<RouteSet>,
    weather: WeatherFeed,
    incidents: IncidentFeed,
    road_state: RoadStateResolver,
    routes: RouteEngine,
    simulator: Box<dyn Simulator + Send>,
    reporter: Box<dyn Reporter + Send>,
    stop: Arc<AtomicBool>,
    phase: Phase,
    metrics: MetricsCollector,
    active_routes: RouteSet,
    active_incidents: Vec<IncidentRecord>,
    route_log: Vec<RouteAttemptLog>,
}

impl Driver {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Flag checked between ticks; setting it ends the run after the current tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn road_state(&self) -> &RoadStateResolver {
        &self.road_state
    }

    pub fn run(self) -> Result<RunReport, DriverError> {
        self.run_with_hook(|_| {})
    }

    pub fn run_with_hook<F>(mut self, mut hook: F) -> Result<RunReport, DriverError>
    where
        F: FnMut(&TickSummary),
    {
        let started_at = Utc::now();
        let mut session = self.initialize()?;
        self.enter(Phase::Stepping);

        let mut tick = 0;
        let mut stop_reason = StopReason::DurationReached;
        let mut fatal = None;
        while tick < self.settings.duration_ticks {
            if self.stop.load(Ordering::SeqCst) {
                info!("stop requested; ending run after tick {tick}");
                stop_reason = StopReason::Cancelled;
                break;
            }
            tick += 1;
            match self.tick(tick, session.as_mut()) {
                Ok(summary) => {
                    hook(&summary);
                    if summary.vehicle_count == 0 {
                        info!("tick {tick}: no vehicles remain");
                        stop_reason = StopReason::NoVehiclesRemaining;
                        break;
                    }
                }
                Err(source) => {
                    error!("tick {tick}: simulator failed: {source}");
                    stop_reason = StopReason::SimulatorFailed;
                    fatal = Some(DriverError::Simulator { tick, source });
                    break;
                }
            }
        }

        let ticks_completed = match fatal {
            Some(_) => tick.saturating_sub(1),
            None => tick,
        };
        self.finalize(session, started_at, ticks_completed, stop_reason, fatal)
    }

    fn enter(&mut self, phase: Phase) {
        debug!("driver phase {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn initialize(&mut self) -> Result<Box<dyn SimulatorSession + Send>, DriverError> {
        info!(
            "initializing run '{}' on network '{}' ({} segments, {} weather)",
            self.settings.run_name,
            self.network.name(),
            self.network.len(),
            if self.weather.is_test_mode() { "test" } else { "live" }
        );
        let routes = match self.initial_routes.take() {
            Some(routes) => routes,
            None => {
                let outcome = self.routes.initial_routes();
                self.log_attempts(0, &outcome);
                outcome.routes
            }
        };
        if routes.is_empty() {
            return Err(DriverError::Precondition("initial route set is empty".into()));
        }
        routes.validate(&self.network)?;

        let config = SimulationConfig {
            network: Arc::clone(&self.network),
            seed: self.settings.seed,
            vehicle: self.settings.vehicle.clone(),
        };
        let start_failed = |source| DriverError::Simulator { tick: 0, source };
        let mut session = self.simulator.start(&config).map_err(start_failed)?;
        session.set_routes(&routes).map_err(start_failed)?;
        info!("simulator started with {} vehicles", routes.len());
        self.active_routes = routes;
        Ok(session)
    }

    fn tick(
        &mut self,
        tick: u64,
        session: &mut (dyn SimulatorSession + Send),
    ) -> Result<TickSummary, SimulatorError> {
        let observation = self.weather.poll(tick);
        self.road_state.apply_weather(&observation);
        if self.metrics.record_weather(tick, &observation) {
            info!(
                "tick {tick}: weather {} (code {}), friction {:.2}",
                observation.label, observation.code, observation.coefficient
            );
        }

        // Every segment, including ones only vehicles left off a rebuilt route
        // set still drive on.
        for state in self.road_state.states() {
            session.set_edge_friction(&state.segment_id, state.friction)?;
        }

        let samples = session.step()?;
        let record = self.metrics.record_step(
            tick,
            &samples,
            &observation,
            session.vehicle_count(),
        );
        let average_speed_kmh = record.average_speed_kmh;

        let incident_poll = tick % self.settings.incident_poll_interval_ticks == 0;
        let reroute_tier = if incident_poll {
            self.enter(Phase::Rerouting);
            let tier = self.check_incidents(tick, session);
            self.enter(Phase::Stepping);
            tier?
        } else {
            None
        };

        Ok(TickSummary {
            tick,
            friction: observation.coefficient,
            weather_label: observation.label,
            average_speed_kmh,
            vehicle_count: session.vehicle_count(),
            incident_poll,
            reroute_tier,
        })
    }

    /// Polls incidents and re-routes only when an incident appeared, cleared
    /// or changed severity since the previous poll.
    fn check_incidents(
        &mut self,
        tick: u64,
        session: &mut (dyn SimulatorSession + Send),
    ) -> Result<Option<RouteTier>, SimulatorError> {
        let current = self.incidents.poll(&self.settings.corridors);
        let delta = IncidentDelta::between(&self.active_incidents, &current);

        let mut reroute_tier = None;
        if delta.is_material() {
            info!(
                "tick {tick}: incidents changed (+{} -{} ~{}), {} active",
                delta.added,
                delta.removed,
                delta.severity_changed,
                current.len()
            );
            let impact = self.road_state.apply_incidents(&current);
            if impact.unmatched > 0 {
                warn!(
                    "tick {tick}: {} incident(s) matched no segment",
                    impact.unmatched
                );
            }
            let outcome = self.routes.rebuild_routes(&self.active_routes, &self.road_state);
            self.log_attempts(tick, &outcome);
            session.set_routes(&outcome.routes)?;
            reroute_tier = Some(outcome.tier);
            self.active_routes = outcome.routes;
        } else {
            debug!("tick {tick}: incidents unchanged ({} active)", current.len());
        }

        self.metrics.record_incident_cycle(IncidentCycle {
            tick,
            incidents: current.len(),
            changed: delta.is_material(),
            penalized: self.road_state.severity_counts(),
            reroute_tier,
        });
        self.active_incidents = current;
        Ok(reroute_tier)
    }

    fn log_attempts(&mut self, tick: u64, outcome: &RebuildOutcome) {
        info!(
            "tick {tick}: routes from {} tier ({} vehicles)",
            outcome.tier,
            outcome.routes.len()
        );
        self.route_log.push(RouteAttemptLog {
            tick,
            attempts: outcome.attempts.clone(),
        });
    }

    fn finalize(
        mut self,
        mut session: Box<dyn SimulatorSession + Send>,
        started_at: DateTime<Utc>,
        ticks_completed: u64,
        stop_reason: StopReason,
        fatal: Option<DriverError>,
    ) -> Result<RunReport, DriverError> {
        self.enter(Phase::Finalizing);
        if let Err(err) = session.stop() {
            warn!("simulator did not stop cleanly: {err}");
        }

        let report = RunReport::from_metrics(
            self.settings.run_name.clone(),
            self.settings.weather_mode,
            started_at,
            ticks_completed,
            stop_reason,
            fatal.as_ref().map(ToString::to_string),
            &self.metrics,
            std::mem::take(&mut self.route_log),
        );
        let reported = self.reporter.report(&report);

        match fatal {
            Some(err) => {
                if let Err(report_err) = reported {
                    warn!("partial report was not written: {report_err}");
                }
                Err(err)
            }
            None => {
                reported?;
                Ok(report)
            }
        }
    }
}
