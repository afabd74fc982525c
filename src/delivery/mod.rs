//! # Delivery
//!
//! Everything that happens to a message after it is handed over for sending.
//!
//! ```text
//!  dispatch ──▶ DeliverySimulator ──▶ DeliveryPolicy (upload / ack / reply)
//!                     │
//!                     └──▶ MessageStore (progress, status, typing, replies)
//! ```
//!
//! The simulator owns the per-message tasks and their cancellation. The
//! policy decides how long things take and whether they succeed; swap in a
//! real transport by implementing [`DeliveryPolicy`].

pub mod policies;
pub mod policy;
pub mod simulator;

pub use policies::{FailureStage, SimulatedPolicy};
pub use policy::{DeliveryError, DeliveryPolicy};
pub use simulator::DeliverySimulator;
