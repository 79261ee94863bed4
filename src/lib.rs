pub mod engine;
pub mod feed;
pub mod friction;
pub mod geo;
pub mod incident;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod report;
pub mod road_state;
pub mod routing;
pub mod scenario;
pub mod simulator;
pub mod weather;

pub use engine::{Driver, DriverBuilder, DriverError, TickSummary};
pub use scenario::{RunConfig, ScenarioLoader};
