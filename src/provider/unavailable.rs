use async_trait::async_trait;

use super::{InstallOptions, PackageProvider, ProviderKind};
use crate::types::UpdateError;

/// Selected when no package manager could be initialized.
#[derive(Debug, Default, Clone)]
pub struct UnavailableProvider;

#[async_trait]
impl PackageProvider for UnavailableProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Unavailable
    }

    async fn refresh_packages(&self, _notify: bool) -> Result<(), UpdateError> {
        Err(UpdateError::NoProvider(
            "Cannot refresh packages, no provider set".to_string(),
        ))
    }

    async fn get_packages(&self) -> Result<Vec<String>, UpdateError> {
        Err(UpdateError::NoProvider(
            "Cannot retrieve packages, no provider set".to_string(),
        ))
    }

    async fn install_packages(
        &self,
        _packages: &[String],
        _options: InstallOptions,
    ) -> Result<(), UpdateError> {
        Err(UpdateError::NoProvider(
            "Cannot install packages, no provider set".to_string(),
        ))
    }

    async fn upgrade_system(&self) -> Result<(), UpdateError> {
        Err(UpdateError::NoProvider(
            "Cannot upgrade packages, no provider set".to_string(),
        ))
    }
}
