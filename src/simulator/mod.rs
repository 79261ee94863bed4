//! Interface to the traffic micro-simulator.

mod kinematic;

use std::sync::Arc;

use thiserror::Error;

use crate::{
    network::{Network, SegmentId},
    routing::RouteSet,
    scenario::KinematicConfig,
};

pub use kinematic::{KinematicSession, KinematicSimulator};

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub network: Arc<Network>,
    pub seed: u64,
    pub vehicle: KinematicConfig,
}

/// Speed of one running vehicle after a step.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedSample {
    pub vehicle: String,
    pub segment: SegmentId,
    pub speed_mps: f64,
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("simulator failed to start: {0}")]
    Start(String),
    #[error("unknown segment {0}")]
    UnknownSegment(SegmentId),
    #[error("simulation step {tick} failed: {reason}")]
    Step { tick: u64, reason: String },
    #[error("simulator session already stopped")]
    Stopped,
}

pub trait Simulator {
    fn start(
        &mut self,
        config: &SimulationConfig,
    ) -> Result<Box<dyn SimulatorSession + Send>, SimulatorError>;
}

pub trait SimulatorSession {
    /// Advances one tick and returns speeds of the vehicles that moved.
    fn step(&mut self) -> Result<Vec<SpeedSample>, SimulatorError>;

    fn set_edge_friction(&mut self, segment: &SegmentId, friction: f64)
        -> Result<(), SimulatorError>;

    /// Installs a new route set. Running vehicles keep their current segment.
    fn set_routes(&mut self, routes: &RouteSet) -> Result<(), SimulatorError>;

    /// Vehicles still running or waiting to depart.
    fn vehicle_count(&self) -> usize;

    fn stop(&mut self) -> Result<(), SimulatorError>;
}
