//! Built-in deterministic simulator: vehicles follow their routes at a speed
//! capped by `max_speed * friction`, accelerating at a fixed rate.

use std::{collections::HashMap, sync::Arc};

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SimulationConfig, Simulator, SimulatorError, SimulatorSession, SpeedSample};
use crate::{
    friction::CLEAR_FRICTION,
    network::{Network, SegmentId},
    routing::{RouteSet, VehicleRoute},
    scenario::KinematicConfig,
};

#[derive(Debug, Default)]
pub struct KinematicSimulator;

impl KinematicSimulator {
    pub fn new() -> Self {
        Self
    }
}

impl Simulator for KinematicSimulator {
    fn start(
        &mut self,
        config: &SimulationConfig,
    ) -> Result<Box<dyn SimulatorSession + Send>, SimulatorError> {
        Ok(Box::new(KinematicSession::new(config)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VehicleState {
    Pending,
    Running,
    Arrived,
}

#[derive(Debug, Clone)]
struct Vehicle {
    id: String,
    depart: u64,
    edges: Vec<SegmentId>,
    edge_index: usize,
    offset_m: f64,
    speed_mps: f64,
    speed_factor: f64,
    state: VehicleState,
}

impl Vehicle {
    fn current_edge(&self) -> Option<&SegmentId> {
        self.edges.get(self.edge_index)
    }
}

pub struct KinematicSession {
    network: Arc<Network>,
    params: KinematicConfig,
    rng: ChaCha8Rng,
    friction: HashMap<SegmentId, f64>,
    vehicles: Vec<Vehicle>,
    tick: u64,
    stopped: bool,
}

impl KinematicSession {
    pub fn new(config: &SimulationConfig) -> Result<Self, SimulatorError> {
        if config.network.is_empty() {
            return Err(SimulatorError::Start("network has no segments".into()));
        }
        if !(config.vehicle.max_speed_mps > 0.0) {
            return Err(SimulatorError::Start("max speed must be positive".into()));
        }
        Ok(Self {
            network: Arc::clone(&config.network),
            params: config.vehicle.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            friction: HashMap::new(),
            vehicles: Vec::new(),
            tick: 0,
            stopped: false,
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn friction(&self, segment: &str) -> f64 {
        self.friction.get(segment).copied().unwrap_or(CLEAR_FRICTION)
    }

    fn insert(&mut self, route: &VehicleRoute) {
        let dev = self.params.speed_dev.clamp(0.0, 0.9);
        let speed_factor = if dev > 0.0 {
            self.rng.gen_range(1.0 - dev..=1.0 + dev)
        } else {
            1.0
        };
        self.vehicles.push(Vehicle {
            id: route.vehicle.clone(),
            depart: route.depart,
            edges: route.edges.clone(),
            edge_index: 0,
            offset_m: 0.0,
            speed_mps: 0.0,
            speed_factor,
            state: VehicleState::Pending,
        });
    }

    fn check_route(&self, route: &VehicleRoute) -> Result<(), SimulatorError> {
        match route
            .edges
            .iter()
            .find(|edge| !self.network.contains(edge.as_str()))
        {
            Some(unknown) => Err(SimulatorError::UnknownSegment(unknown.clone())),
            None => Ok(()),
        }
    }

    fn length_of(&self, segment: &SegmentId) -> f64 {
        self.network
            .segment(segment.as_str())
            .map(|segment| segment.length_m)
            .unwrap_or(1.0)
            .max(1.0)
    }
}

impl SimulatorSession for KinematicSession {
    fn step(&mut self) -> Result<Vec<SpeedSample>, SimulatorError> {
        if self.stopped {
            return Err(SimulatorError::Stopped);
        }
        self.tick += 1;
        let tick = self.tick;
        let max_speed = self.params.max_speed_mps;
        let accel = self.params.accel_mps2.max(0.0);

        let mut vehicles = std::mem::take(&mut self.vehicles);
        let mut samples = Vec::new();
        for vehicle in vehicles.iter_mut() {
            if vehicle.state == VehicleState::Pending && vehicle.depart < tick {
                vehicle.state = if vehicle.edges.is_empty() {
                    VehicleState::Arrived
                } else {
                    VehicleState::Running
                };
            }
            if vehicle.state != VehicleState::Running {
                continue;
            }
            let Some(edge) = vehicle.current_edge().cloned() else {
                vehicle.state = VehicleState::Arrived;
                continue;
            };

            let target = max_speed * self.friction(edge.as_str()) * vehicle.speed_factor;
            vehicle.speed_mps = (vehicle.speed_mps + accel).min(target).max(0.0);
            samples.push(SpeedSample {
                vehicle: vehicle.id.clone(),
                segment: edge.clone(),
                speed_mps: vehicle.speed_mps,
            });

            vehicle.offset_m += vehicle.speed_mps;
            let mut length = self.length_of(&edge);
            while vehicle.offset_m >= length {
                vehicle.offset_m -= length;
                vehicle.edge_index += 1;
                match vehicle.current_edge() {
                    Some(next) => length = self.length_of(next),
                    None => {
                        vehicle.state = VehicleState::Arrived;
                        debug!("tick {tick}: vehicle {} arrived", vehicle.id);
                        break;
                    }
                }
            }
        }
        self.vehicles = vehicles;
        Ok(samples)
    }

    fn set_edge_friction(
        &mut self,
        segment: &SegmentId,
        friction: f64,
    ) -> Result<(), SimulatorError> {
        if !self.network.contains(segment.as_str()) {
            return Err(SimulatorError::UnknownSegment(segment.clone()));
        }
        self.friction
            .insert(segment.clone(), friction.clamp(0.0, CLEAR_FRICTION));
        Ok(())
    }

    fn set_routes(&mut self, routes: &RouteSet) -> Result<(), SimulatorError> {
        if self.stopped {
            return Err(SimulatorError::Stopped);
        }
        for route in &routes.routes {
            self.check_route(route)?;
        }

        let mut seen = Vec::with_capacity(routes.len());
        for route in &routes.routes {
            seen.push(route.vehicle.as_str());
            match self.vehicles.iter_mut().find(|v| v.id == route.vehicle) {
                Some(vehicle) => match vehicle.state {
                    VehicleState::Pending => {
                        vehicle.edges = route.edges.clone();
                        vehicle.depart = route.depart;
                    }
                    VehicleState::Running => {
                        let current = vehicle.current_edge().cloned();
                        if let Some(index) = current
                            .and_then(|edge| route.edges.iter().position(|e| *e == edge))
                        {
                            vehicle.edges = route.edges.clone();
                            vehicle.edge_index = index;
                        } else {
                            debug!(
                                "vehicle {} keeps its route; new route skips its current segment",
                                vehicle.id
                            );
                        }
                    }
                    VehicleState::Arrived => {}
                },
                None => self.insert(route),
            }
        }
        // Vehicles dropped from the set only leave if they have not departed.
        self.vehicles
            .retain(|v| v.state != VehicleState::Pending || seen.contains(&v.id.as_str()));
        Ok(())
    }

    fn vehicle_count(&self) -> usize {
        self.vehicles
            .iter()
            .filter(|vehicle| vehicle.state != VehicleState::Arrived)
            .count()
    }

    fn stop(&mut self) -> Result<(), SimulatorError> {
        self.stopped = true;
        Ok(())
    }
}
