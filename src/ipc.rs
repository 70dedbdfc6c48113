//! Bridge to a signal-driven package management service on the system bus.
//!
//! The bus itself is supplied by the embedding application. Each call runs
//! as a single-use [`Transaction`] that turns the signal stream into one
//! awaited result.

pub mod enums;
mod transaction;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::UpdateError;

pub use transaction::{Effect, Outcome, Transaction, TransactionItem};

pub const PERMISSION_REFRESH: &str = "org.freedesktop.packagekit.system-sources-refresh";
pub const PERMISSION_INSTALL: &str = "org.freedesktop.packagekit.package-install";
pub const PERMISSION_UPDATE: &str = "org.freedesktop.packagekit.system-update";

#[async_trait]
pub trait IpcBus: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Whether the current user holds the policy action.
    async fn check_permission(&self, action: &str) -> Result<bool, UpdateError>;

    /// Open a new transaction and subscribe to its signals.
    async fn create_transaction(&self) -> Result<TransactionLink, UpdateError>;
}

#[async_trait]
pub trait TransactionHandle: Send + Sync {
    async fn call(&self, call: TransactionCall) -> Result<(), UpdateError>;
}

pub struct TransactionLink {
    pub handle: Box<dyn TransactionHandle>,
    pub events: mpsc::UnboundedReceiver<TransactionEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionCall {
    RefreshCache { force: bool },
    GetUpdates { filter: u64 },
    GetPackages { filter: u64 },
    GetRepoList { filter: u64 },
    Resolve { filter: u64, packages: Vec<String> },
    InstallPackages { flags: u64, package_ids: Vec<String> },
    UpdatePackages { flags: u64, package_ids: Vec<String> },
}

impl TransactionCall {
    pub fn method(&self) -> &'static str {
        match self {
            TransactionCall::RefreshCache { .. } => "refresh_cache",
            TransactionCall::GetUpdates { .. } => "get_updates",
            TransactionCall::GetPackages { .. } => "get_packages",
            TransactionCall::GetRepoList { .. } => "get_repo_list",
            TransactionCall::Resolve { .. } => "resolve",
            TransactionCall::InstallPackages { .. } => "install_packages",
            TransactionCall::UpdatePackages { .. } => "update_packages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    U32(u32),
    U64(u64),
    Str(String),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::U32(value) => Some(u64::from(*value)),
            PropertyValue::U64(value) => Some(*value),
            _ => None,
        }
    }
}

/// Signals emitted by a running transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Package {
        info: u32,
        package_id: String,
        summary: String,
    },
    RepoDetail {
        repo_id: String,
        description: String,
        enabled: bool,
    },
    ItemProgress {
        item_id: String,
        status: u32,
        percentage: u32,
    },
    ErrorCode {
        code: u32,
        details: String,
    },
    Finished {
        exit_code: u32,
        run_time_ms: u64,
    },
    PropertiesChanged(Vec<(String, PropertyValue)>),
}
