//! Route penalty engine: turns incident penalties into edge-weight overrides,
//! asks the route preprocessor for new routes and falls back tier by tier
//! until a valid route set exists.

mod process;

use std::{collections::BTreeSet, fmt, fs, path::Path, sync::Arc};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    network::{Network, SegmentId},
    road_state::RoadStateResolver,
};

pub use process::{read_route_xml, write_route_xml, write_trip_xml, write_weight_xml, RouterProcess};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub from: SegmentId,
    pub to: SegmentId,
    #[serde(default)]
    pub depart: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripDemand {
    pub trips: Vec<Trip>,
}

impl TripDemand {
    pub fn new(trips: Vec<Trip>) -> Self {
        Self { trips }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let text = fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&text).map_err(|err| RouteError::Parse(err.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRoute {
    pub vehicle: String,
    #[serde(default)]
    pub depart: u64,
    pub edges: Vec<SegmentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSet {
    pub routes: Vec<VehicleRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct RouteValidationError {
    pub unknown_segments: Vec<SegmentId>,
    pub empty_routes: Vec<String>,
    pub no_routes: bool,
}

impl fmt::Display for RouteValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_routes {
            return write!(f, "route set is empty");
        }
        write!(
            f,
            "{} unknown segment(s), {} route(s) without edges",
            self.unknown_segments.len(),
            self.empty_routes.len()
        )?;
        if let Some(first) = self.unknown_segments.first() {
            write!(f, " (first unknown: {first})")?;
        }
        Ok(())
    }
}

impl RouteSet {
    pub fn new(routes: Vec<VehicleRoute>) -> Self {
        Self { routes }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let text = fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&text).map_err(|err| RouteError::Parse(err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Non-empty, every route has edges, every edge exists in `network`.
    pub fn validate(&self, network: &Network) -> Result<(), RouteValidationError> {
        let mut error = RouteValidationError {
            no_routes: self.routes.is_empty(),
            ..Default::default()
        };
        let mut unknown = BTreeSet::new();
        for route in &self.routes {
            if route.edges.is_empty() {
                error.empty_routes.push(route.vehicle.clone());
            }
            for edge in &route.edges {
                if !network.contains(edge.as_str()) {
                    unknown.insert(edge.clone());
                }
            }
        }
        error.unknown_segments = unknown.into_iter().collect();
        if error == RouteValidationError::default() {
            Ok(())
        } else {
            Err(error)
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("router i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("router exited with {status}: {stderr}")]
    Process { status: String, stderr: String },
    #[error("failed to parse routes: {0}")]
    Parse(String),
    #[error("invalid routes: {0}")]
    Validation(#[from] RouteValidationError),
    #[error("route preprocessor unavailable: {0}")]
    Unavailable(String),
}

/// Which input the preprocessor is asked to work from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Re-route the existing vehicles under the edge-weight overrides.
    Reweighted,
    /// Fix broken edge references in the existing routes, keeping endpoints.
    Repair,
    /// Ignore existing routes and route the trip demand from scratch.
    Fresh,
}

pub struct RouteRequest<'a> {
    pub mode: RouteMode,
    pub trips: &'a TripDemand,
    pub existing: &'a RouteSet,
    pub overrides: &'a [(SegmentId, f64)],
}

/// The external route-preprocessing tool.
pub trait RoutePreprocessor {
    fn route(&mut self, request: &RouteRequest<'_>) -> Result<RouteSet, RouteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Reweighted,
    Repair,
    Fresh,
    Minimal,
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RouteTier::Reweighted => "reweighted",
            RouteTier::Repair => "repair",
            RouteTier::Fresh => "fresh",
            RouteTier::Minimal => "minimal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TierOutcome {
    Succeeded { routes: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierAttempt {
    pub tier: RouteTier,
    pub outcome: TierOutcome,
}

#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub routes: RouteSet,
    pub tier: RouteTier,
    pub attempts: Vec<TierAttempt>,
}

impl RebuildOutcome {
    pub fn fell_back(&self) -> bool {
        self.attempts.len() > 1
    }
}

pub struct RouteEngine {
    network: Arc<Network>,
    preprocessor: Box<dyn RoutePreprocessor + Send>,
    trips: TripDemand,
    minimal_route_count: usize,
}

impl RouteEngine {
    pub fn new(
        network: Arc<Network>,
        preprocessor: Box<dyn RoutePreprocessor + Send>,
        trips: TripDemand,
        minimal_route_count: usize,
    ) -> Self {
        Self {
            network,
            preprocessor,
            trips,
            minimal_route_count: minimal_route_count.max(1),
        }
    }

    pub fn trips(&self) -> &TripDemand {
        &self.trips
    }

    /// Routes for the start of the run, before any incident is known.
    pub fn initial_routes(&mut self) -> RebuildOutcome {
        let empty = RouteSet::default();
        self.run_tiers(&[RouteTier::Fresh], &empty, &[])
    }

    /// New routes reflecting the resolver's current penalties.
    pub fn rebuild_routes(
        &mut self,
        current: &RouteSet,
        road_state: &RoadStateResolver,
    ) -> RebuildOutcome {
        let overrides = road_state.edge_weight_overrides();
        let counts = road_state.severity_counts();
        info!(
            "rebuilding routes with {} penalized segments (high:{}, medium:{}, low:{})",
            overrides.len(),
            counts.high,
            counts.medium,
            counts.low
        );
        let current = self.restore_missing_trips(current);
        self.run_tiers(
            &[RouteTier::Reweighted, RouteTier::Repair, RouteTier::Fresh],
            &current,
            &overrides,
        )
    }

    /// `current` plus an unpenalized route for every trip it lacks, so a set
    /// that shrank to the minimal tier regains the full demand.
    fn restore_missing_trips(&self, current: &RouteSet) -> RouteSet {
        let known: BTreeSet<&str> = current
            .routes
            .iter()
            .map(|route| route.vehicle.as_str())
            .collect();
        let missing: Vec<VehicleRoute> = self
            .trips
            .trips
            .iter()
            .filter(|trip| !known.contains(trip.id.as_str()))
            .filter_map(|trip| self.trip_route(trip))
            .collect();
        if missing.is_empty() || current.is_empty() {
            return current.clone();
        }
        info!(
            "restoring {} trip(s) missing from the current route set",
            missing.len()
        );
        let mut routes = current.routes.clone();
        routes.extend(missing);
        RouteSet::new(routes)
    }

    /// Fewest-segment route for `trip`, or just its origin segment when the
    /// destination is unreachable. `None` when the origin is not in the network.
    fn trip_route(&self, trip: &Trip) -> Option<VehicleRoute> {
        if !self.network.contains(trip.from.as_str()) {
            return None;
        }
        let edges = self
            .network
            .shortest_path(trip.from.as_str(), trip.to.as_str())
            .unwrap_or_else(|| vec![trip.from.clone()]);
        Some(VehicleRoute {
            vehicle: trip.id.clone(),
            depart: trip.depart,
            edges,
        })
    }

    fn run_tiers(
        &mut self,
        tiers: &[RouteTier],
        current: &RouteSet,
        overrides: &[(SegmentId, f64)],
    ) -> RebuildOutcome {
        let mut attempts = Vec::with_capacity(tiers.len() + 1);
        for &tier in tiers {
            match self.attempt(tier, current, overrides) {
                Ok(routes) => {
                    attempts.push(TierAttempt {
                        tier,
                        outcome: TierOutcome::Succeeded {
                            routes: routes.len(),
                        },
                    });
                    if tier != tiers[0] {
                        warn!("routes recovered by {tier} tier ({} vehicles)", routes.len());
                    }
                    return RebuildOutcome {
                        routes,
                        tier,
                        attempts,
                    };
                }
                Err(err) => {
                    warn!("{tier} routing tier failed: {err}");
                    attempts.push(TierAttempt {
                        tier,
                        outcome: TierOutcome::Failed {
                            reason: err.to_string(),
                        },
                    });
                }
            }
        }

        let routes = self.minimal_routes();
        warn!(
            "all routing tiers failed; using {} minimal unpenalized routes",
            routes.len()
        );
        attempts.push(TierAttempt {
            tier: RouteTier::Minimal,
            outcome: TierOutcome::Succeeded {
                routes: routes.len(),
            },
        });
        RebuildOutcome {
            routes,
            tier: RouteTier::Minimal,
            attempts,
        }
    }

    fn attempt(
        &mut self,
        tier: RouteTier,
        current: &RouteSet,
        overrides: &[(SegmentId, f64)],
    ) -> Result<RouteSet, RouteError> {
        let mode = match tier {
            RouteTier::Reweighted => RouteMode::Reweighted,
            RouteTier::Repair => RouteMode::Repair,
            RouteTier::Fresh => RouteMode::Fresh,
            RouteTier::Minimal => return Ok(self.minimal_routes()),
        };
        if mode != RouteMode::Fresh && current.is_empty() {
            return Err(RouteError::Unavailable(format!(
                "no existing routes to {tier}"
            )));
        }
        let request = RouteRequest {
            mode,
            trips: &self.trips,
            existing: current,
            overrides,
        };
        let routes = self.preprocessor.route(&request)?;
        routes.validate(&self.network)?;
        Ok(routes)
    }

    /// Small unpenalized route set that is valid by construction: the first
    /// trips with a known origin, routed by fewest segments (or just their
    /// origin segment when the destination is unreachable), else one vehicle
    /// on the first network segment.
    pub fn minimal_routes(&self) -> RouteSet {
        let mut routes: Vec<VehicleRoute> = self
            .trips
            .trips
            .iter()
            .filter_map(|trip| self.trip_route(trip))
            .take(self.minimal_route_count)
            .collect();
        if routes.is_empty() {
            if let Some(first) = self.network.segments().first() {
                routes.push(VehicleRoute {
                    vehicle: "fallback_1".to_string(),
                    depart: 0,
                    edges: vec![first.id.clone()],
                });
            }
        }
        RouteSet::new(routes)
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::{route, ScriptedRouter};
    use super::*;
    use crate::{
        incident::{Corridor, IncidentKind, IncidentRecord, Severity},
        network::fixtures::{corridor_network, ORIGIN},
        scenario::PenaltyConfig,
    };

    fn trips() -> TripDemand {
        TripDemand::new(vec![
            Trip {
                id: "vehicle_1".into(),
                from: "a".into(),
                to: "d".into(),
                depart: 0,
            },
            Trip {
                id: "vehicle_2".into(),
                from: "b".into(),
                to: "c".into(),
                depart: 5,
            },
            Trip {
                id: "vehicle_3".into(),
                from: "a".into(),
                to: "c".into(),
                depart: 10,
            },
        ])
    }

    fn engine(router: ScriptedRouter) -> RouteEngine {
        RouteEngine::new(Arc::new(corridor_network()), Box::new(router), trips(), 2)
    }

    fn closed_resolver() -> RoadStateResolver {
        let mut resolver = RoadStateResolver::new(&corridor_network(), PenaltyConfig::default());
        resolver.apply_incidents(&[IncidentRecord {
            id: "closure".into(),
            corridor: Corridor::A2,
            position: ORIGIN.offset_m(0.0, 1_000.0),
            severity: Severity::High,
            kind: IncidentKind::Closure,
            title: "Vollsperrung".into(),
            reported_at: None,
        }]);
        resolver
    }

    fn existing() -> RouteSet {
        RouteSet::new(vec![route("vehicle_1", &["a", "b", "c", "d"])])
    }

    #[test]
    fn validation_flags_unknown_and_empty() {
        let network = corridor_network();
        assert!(existing().validate(&network).is_ok());

        let broken = RouteSet::new(vec![route("v1", &["a", "ghost"]), route("v2", &[])]);
        let err = broken.validate(&network).unwrap_err();
        assert_eq!(err.unknown_segments, vec![SegmentId::from("ghost")]);
        assert_eq!(err.empty_routes, vec!["v2".to_string()]);
        assert!(RouteSet::default().validate(&network).unwrap_err().no_routes);
    }

    #[test]
    fn reweighted_routes_are_used_when_valid() {
        let detour = RouteSet::new(vec![route("vehicle_1", &["a", "x", "d"])]);
        let mut engine = engine(ScriptedRouter::new(vec![Ok(detour.clone())]));
        let outcome = engine.rebuild_routes(&existing(), &closed_resolver());
        assert_eq!(outcome.tier, RouteTier::Reweighted);
        assert_eq!(outcome.routes, detour);
        assert!(!outcome.fell_back());
    }

    #[test]
    fn invalid_output_falls_through_to_repair_then_fresh() {
        let invalid = RouteSet::new(vec![route("vehicle_1", &["a", "nowhere"])]);
        let fresh = RouteSet::new(vec![route("vehicle_1", &["a", "x", "d"])]);
        let router = ScriptedRouter::new(vec![
            Ok(invalid),
            Err(RouteError::Process {
                status: "exit status: 1".into(),
                stderr: "Error: repair failed".into(),
            }),
            Ok(fresh.clone()),
        ]);
        let calls = router.calls.clone();
        let mut engine = engine(router);
        let outcome = engine.rebuild_routes(&existing(), &closed_resolver());
        assert_eq!(outcome.tier, RouteTier::Fresh);
        assert_eq!(outcome.routes, fresh);
        let tiers: Vec<RouteTier> = outcome.attempts.iter().map(|a| a.tier).collect();
        assert_eq!(
            tiers,
            vec![RouteTier::Reweighted, RouteTier::Repair, RouteTier::Fresh]
        );
        let modes: Vec<RouteMode> = calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(
            modes,
            vec![RouteMode::Reweighted, RouteMode::Repair, RouteMode::Fresh]
        );
        assert!(matches!(
            outcome.attempts[0].outcome,
            TierOutcome::Failed { .. }
        ));
    }

    #[test]
    fn collaborator_failure_still_yields_minimal_routes() {
        let mut engine = engine(ScriptedRouter::new(vec![
            Err(RouteError::Unavailable("router missing".into())),
            Err(RouteError::Unavailable("router missing".into())),
            Err(RouteError::Unavailable("router missing".into())),
        ]));
        let outcome = engine.rebuild_routes(&existing(), &closed_resolver());
        assert_eq!(outcome.tier, RouteTier::Minimal);
        assert_eq!(outcome.attempts.len(), 4);
        assert!(!outcome.routes.is_empty());
        assert!(outcome.routes.validate(&corridor_network()).is_ok());
    }

    #[test]
    fn minimal_routes_are_idempotent() {
        let engine = engine(ScriptedRouter::default());
        let first = engine.minimal_routes();
        let second = engine.minimal_routes();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.routes[0].edges, vec![SegmentId::from("a"), "x".into(), "d".into()]);
        assert_eq!(first.routes[1].depart, 5);
        assert!(first.validate(&corridor_network()).is_ok());
    }

    #[test]
    fn minimal_routes_survive_unknown_trip_segments() {
        let demand = TripDemand::new(vec![Trip {
            id: "lost".into(),
            from: "ghost".into(),
            to: "d".into(),
            depart: 0,
        }]);
        let engine = RouteEngine::new(
            Arc::new(corridor_network()),
            Box::new(ScriptedRouter::default()),
            demand,
            2,
        );
        let routes = engine.minimal_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes.routes[0].vehicle, "fallback_1");
        assert!(routes.validate(&corridor_network()).is_ok());
    }

    #[test]
    fn overrides_reach_the_preprocessor() {
        let router = ScriptedRouter::new(vec![Ok(existing())]);
        let calls = router.calls.clone();
        let mut engine = engine(router);
        let outcome = engine.rebuild_routes(&existing(), &closed_resolver());
        assert_eq!(outcome.tier, RouteTier::Reweighted);
        // The closure sits on segment c only.
        assert_eq!(*calls.lock().unwrap(), vec![(RouteMode::Reweighted, 1)]);
    }

    #[test]
    fn rebuild_after_minimal_tier_routes_the_whole_demand() {
        let router = ScriptedRouter::new(vec![Ok(existing())]);
        let existing_seen = router.existing.clone();
        let mut engine = engine(router);
        let shrunk = engine.minimal_routes();
        assert_eq!(shrunk.len(), 2);

        engine.rebuild_routes(&shrunk, &closed_resolver());
        let seen = existing_seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["vehicle_1", "vehicle_2", "vehicle_3"]);
    }

    #[test]
    fn initial_routes_skip_repair_tiers() {
        let mut engine = engine(ScriptedRouter::new(vec![Err(RouteError::Unavailable(
            "no router".into(),
        ))]));
        let outcome = engine.initial_routes();
        assert_eq!(outcome.tier, RouteTier::Minimal);
        let tiers: Vec<RouteTier> = outcome.attempts.iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![RouteTier::Fresh, RouteTier::Minimal]);
    }
}
