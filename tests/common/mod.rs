#![allow(dead_code)]

use std::{
    ops::Range,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use roadstate::{
    feed::FeedError,
    geo::GeoPoint,
    incident::{Corridor, IncidentFeed, IncidentSource, RawIncident, SeverityRules},
    network::{Network, SegmentId},
    routing::{
        RouteError, RouteMode, RoutePreprocessor, RouteRequest, RouteSet, TripDemand,
        VehicleRoute,
    },
    scenario::{RunConfig, ScenarioLoader},
};

pub fn scenario_loader() -> ScenarioLoader {
    ScenarioLoader::new(env!("CARGO_MANIFEST_DIR"))
}

pub fn scenario_path() -> PathBuf {
    PathBuf::from("scenarios/wolfsburg.yaml")
}

pub fn load_scenario() -> (RunConfig, Network, TripDemand) {
    let config = scenario_loader().load(scenario_path()).unwrap();
    let network = Network::load(&config.paths.network_file).unwrap();
    let trips = TripDemand::load(&config.paths.trip_file).unwrap();
    (config, network, trips)
}

pub fn center_of(network: &Network, id: &str) -> GeoPoint {
    network.segment(id).unwrap().center
}

pub fn incident(title: &str, position: GeoPoint) -> RawIncident {
    RawIncident {
        identifier: None,
        title: title.to_string(),
        description: Vec::new(),
        position,
        start_timestamp: None,
        blocked: false,
    }
}

/// Answers every request with the next scripted incident list (repeating
/// the last one) and counts requests.
pub struct ScriptedSource {
    polls: Vec<Vec<RawIncident>>,
    pub fetches: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(polls: Vec<Vec<RawIncident>>) -> Self {
        Self {
            polls,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl IncidentSource for ScriptedSource {
    fn fetch(&mut self, _corridor: &Corridor, _service: &str) -> Result<Vec<RawIncident>, FeedError> {
        let index = self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .polls
            .get(index)
            .or_else(|| self.polls.last())
            .cloned()
            .unwrap_or_default())
    }
}

pub fn feed(source: ScriptedSource, service: &str) -> IncidentFeed {
    IncidentFeed::new(
        Box::new(source),
        vec![service.to_string()],
        SeverityRules::default(),
        100.0,
    )
}

/// Routes by fewest segments: every trip in fresh mode, the endpoints of
/// every existing route otherwise. Requests in `failing` modes or whose
/// index falls in `outage` fail; the overrides of every request are recorded.
pub struct GraphRouter {
    network: Arc<Network>,
    failing: Vec<RouteMode>,
    outage: Range<usize>,
    pub requests: Arc<Mutex<Vec<(RouteMode, Vec<(SegmentId, f64)>)>>>,
}

impl GraphRouter {
    pub fn new(network: &Network) -> Self {
        Self {
            network: Arc::new(network.clone()),
            failing: Vec::new(),
            outage: 0..0,
            requests: Arc::default(),
        }
    }

    pub fn failing(mut self, modes: &[RouteMode]) -> Self {
        self.failing = modes.to_vec();
        self
    }

    /// Fails the requests numbered `requests`, counting from zero.
    pub fn outage(mut self, requests: Range<usize>) -> Self {
        self.outage = requests;
        self
    }

    fn path(&self, vehicle: &str, depart: u64, from: &str, to: &str) -> Option<VehicleRoute> {
        Some(VehicleRoute {
            vehicle: vehicle.to_string(),
            depart,
            edges: self.network.shortest_path(from, to)?,
        })
    }
}

impl RoutePreprocessor for GraphRouter {
    fn route(&mut self, request: &RouteRequest<'_>) -> Result<RouteSet, RouteError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((request.mode, request.overrides.to_vec()));
            requests.len() - 1
        };
        if self.failing.contains(&request.mode) || self.outage.contains(&index) {
            return Err(RouteError::Process {
                status: "exit status: 1".into(),
                stderr: format!("{:?} routing failed", request.mode),
            });
        }
        let routes = match request.mode {
            RouteMode::Fresh => request
                .trips
                .trips
                .iter()
                .filter_map(|trip| {
                    self.path(&trip.id, trip.depart, trip.from.as_str(), trip.to.as_str())
                })
                .collect(),
            RouteMode::Reweighted | RouteMode::Repair => request
                .existing
                .routes
                .iter()
                .filter_map(|route| {
                    let from = route.edges.first()?;
                    let to = route.edges.last()?;
                    self.path(&route.vehicle, route.depart, from.as_str(), to.as_str())
                })
                .collect(),
        };
        Ok(RouteSet::new(routes))
    }
}
