//! Update orchestration for a printer host.
//!
//! Manages the host application, its control process, web clients and the
//! operating system package set: refreshes their remote state, applies
//! updates one session at a time and reports progress to observers.

pub mod config;
pub mod coordinator;
pub mod deployment;
pub mod device;
pub mod http;
pub mod ipc;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod shell;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use coordinator::{Collaborators, Coordinator};
pub use orchestrator::{FullUpdateReport, Orchestrator, OrchestratorSettings, StatusSnapshot};
pub use types::UpdateError;
