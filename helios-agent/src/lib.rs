//! Helios Agent - node-local convergence agent
//!
//! Keeps one managed service on this node at the version and configuration
//! published in the coordination backend:
//! - Version and config drift detection
//! - Fleet-wide upgrade lock, one node upgrading at a time
//! - Template re-rendering keyed by a config fingerprint
//! - Health-gated leader election for primary services

pub mod artifacts;
pub mod checks;
pub mod config;
pub mod control;
pub mod converge;
pub mod coordination;
pub mod discovery;
pub mod drift;
pub mod error;
pub mod execution;
pub mod health;
pub mod layout;
pub mod leader;
pub mod stats;
pub mod tags;
pub mod templates;
pub mod upgrade;

pub use config::AgentConfig;
pub use control::{Collaborators, ControlLoop, CyclePhase, CycleReport};
pub use error::{AgentError, AgentResult, CoordinationError};
