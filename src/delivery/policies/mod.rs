pub mod simulated;

pub use simulated::{FailureStage, SimulatedPolicy};
