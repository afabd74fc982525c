//! # Core
//!
//! Conversation state and the plumbing around it. Nothing here spawns tasks.
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │      MessageStore       │
//!                    │                         │
//!                    │  • threads & messages   │
//!                    │  • status transitions   │
//!                    │  • typing flags         │
//!                    │  • subscriptions        │
//!                    └───────────┬─────────────┘
//!                                │ ThreadUpdate
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!     ┌────────────┐      ┌────────────┐      ┌────────────┐
//!     │  Listener  │      │  Channel   │      │   Demo     │
//!     │ (callback) │      │ (mpsc rx)  │      │  (stdout)  │
//!     └────────────┘      └────────────┘      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`]: ids, threads, messages, attachments, statuses
//! - [`store`]: the `MessageStore` and its notifications
//! - [`clock`]: wall time that follows tokio's (pausable) clock
//! - [`config`]: `~/.chatline/config.toml` and its resolution

pub mod clock;
pub mod config;
pub mod store;
pub mod types;
