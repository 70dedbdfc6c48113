use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{InstallOptions, PackageProvider, ProviderKind};
use crate::coordinator::Coordinator;
use crate::ipc::enums::{filter, transaction_flag};
use crate::ipc::{
    IpcBus, Transaction, TransactionCall, TransactionItem, PERMISSION_INSTALL,
    PERMISSION_REFRESH, PERMISSION_UPDATE,
};
use crate::types::UpdateError;

/// Package backend driven over the system bus, one transaction per call.
pub struct IpcProvider {
    coordinator: Arc<Coordinator>,
    bus: Arc<dyn IpcBus>,
}

impl IpcProvider {
    pub async fn initialize(
        coordinator: Arc<Coordinator>,
        bus: Arc<dyn IpcBus>,
    ) -> Result<Self, UpdateError> {
        if !bus.is_connected() {
            return Err(UpdateError::Transaction(
                "IPC bus connection not available".to_string(),
            ));
        }
        let checks = [
            (
                PERMISSION_REFRESH,
                "The Update Manager will fail to fetch package updates",
            ),
            (
                PERMISSION_INSTALL,
                "The Update Manager will fail to install packages",
            ),
            (
                PERMISSION_UPDATE,
                "The Update Manager will fail to update packages",
            ),
        ];
        for (action, consequence) in checks {
            if !bus.check_permission(action).await? {
                warn!(action, "Missing package management permission");
                coordinator.warn(&format!(
                    "Missing permission {action}. {consequence}"
                ));
            }
        }
        Ok(Self { coordinator, bus })
    }

    async fn run_transaction(
        &self,
        call: TransactionCall,
        notify: bool,
    ) -> Result<Vec<TransactionItem>, UpdateError> {
        let link = self.bus.create_transaction().await?;
        Transaction::new(notify)
            .run(link, call, &self.coordinator)
            .await
    }

    async fn pending_update_ids(&self) -> Result<Vec<String>, UpdateError> {
        let items = self
            .run_transaction(
                TransactionCall::GetUpdates {
                    filter: filter::NONE,
                },
                false,
            )
            .await?;
        Ok(package_ids(&items))
    }
}

fn package_ids(items: &[TransactionItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(TransactionItem::package_id)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl PackageProvider for IpcProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ipc
    }

    async fn refresh_packages(&self, notify: bool) -> Result<(), UpdateError> {
        self.run_transaction(TransactionCall::RefreshCache { force: false }, notify)
            .await
            .map(|_| ())
    }

    async fn get_packages(&self) -> Result<Vec<String>, UpdateError> {
        Ok(self
            .pending_update_ids()
            .await?
            .iter()
            .map(|id| id.split(';').next().unwrap_or(id).to_string())
            .collect())
    }

    async fn install_packages(
        &self,
        packages: &[String],
        options: InstallOptions,
    ) -> Result<(), UpdateError> {
        self.refresh_packages(options.notify).await?;
        let resolved = self
            .run_transaction(
                TransactionCall::Resolve {
                    filter: filter::NEWEST | filter::NOT_INSTALLED | filter::BASENAME | filter::ARCH,
                    packages: packages.to_vec(),
                },
                false,
            )
            .await?;
        let package_ids = package_ids(&resolved);
        if package_ids.is_empty() {
            return Ok(());
        }
        debug!(?package_ids, "Installing packages");
        self.run_transaction(
            TransactionCall::InstallPackages {
                flags: transaction_flag::ONLY_TRUSTED,
                package_ids,
            },
            options.notify,
        )
        .await
        .map(|_| ())
    }

    async fn upgrade_system(&self) -> Result<(), UpdateError> {
        let package_ids = self.pending_update_ids().await?;
        if package_ids.is_empty() {
            return Ok(());
        }
        debug!(?package_ids, "Upgrading packages");
        self.run_transaction(
            TransactionCall::UpdatePackages {
                flags: transaction_flag::ONLY_TRUSTED,
                package_ids,
            },
            true,
        )
        .await
        .map(|_| ())
    }
}
