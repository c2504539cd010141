pub mod agents;
pub mod audit;
pub mod config;
pub mod errors;
pub mod gates;
pub mod orchestrator;
pub mod phase;
pub mod phaseflow_config;
pub mod prompt;
pub mod routing;
pub mod session;
pub mod telemetry;
pub mod util;

pub use errors::WorkflowError;
pub use orchestrator::{DoneOutcome, NextOutcome, Workflow};
