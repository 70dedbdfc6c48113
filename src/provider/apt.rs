use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{InstallOptions, PackageProvider, ProviderKind};
use crate::coordinator::{CmdOptions, Coordinator};
use crate::types::UpdateError;

const APT_CMD: &str = "sudo DEBIAN_FRONTEND=noninteractive apt-get";

pub struct AptCliProvider {
    coordinator: Arc<Coordinator>,
}

impl AptCliProvider {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Look for the apt command.
    pub async fn detect(coordinator: Arc<Coordinator>) -> Option<Self> {
        match coordinator
            .run_cmd_with_response("sh -c 'command -v apt'", Duration::from_secs(10))
            .await
        {
            Ok(path) => {
                debug!(path = %path.trim(), "APT package manager detected");
                Some(Self::new(coordinator))
            }
            Err(_) => None,
        }
    }

    async fn resolve_packages(&self, packages: &[String]) -> Result<Vec<String>, UpdateError> {
        self.coordinator
            .notify_update_response("Resolving packages...", false);
        let pattern = packages
            .iter()
            .map(|pkg| format!("^{pkg}$"))
            .collect::<Vec<_>>()
            .join("|");
        let output = self
            .coordinator
            .run_cmd_with_response(
                &format!("apt-cache search --names-only \"{pattern}\""),
                Duration::from_secs(600),
            )
            .await?;
        let resolved: Vec<&str> = output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .collect();
        Ok(packages
            .iter()
            .filter(|pkg| resolved.contains(&pkg.as_str()))
            .cloned()
            .collect())
    }
}

/// Package names from `apt list --upgradable`, skipping its two header lines.
pub fn parse_upgradable(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .skip(2)
        .map(|line| line.split('/').next().unwrap_or(line).to_string())
        .collect()
}

#[async_trait]
impl PackageProvider for AptCliProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AptCli
    }

    async fn refresh_packages(&self, notify: bool) -> Result<(), UpdateError> {
        self.coordinator
            .run_cmd(
                &format!("{APT_CMD} update"),
                CmdOptions::with_timeout(Duration::from_secs(600)).notify(notify),
            )
            .await
    }

    async fn get_packages(&self) -> Result<Vec<String>, UpdateError> {
        let output = self
            .coordinator
            .run_cmd_with_response("apt list --upgradable", Duration::from_secs(60))
            .await?;
        Ok(parse_upgradable(&output))
    }

    async fn install_packages(
        &self,
        packages: &[String],
        options: InstallOptions,
    ) -> Result<(), UpdateError> {
        self.refresh_packages(options.notify).await?;
        let resolved = self.resolve_packages(packages).await?;
        if resolved.is_empty() {
            self.coordinator
                .notify_update_response("No packages detected", false);
            return Ok(());
        }
        debug!(?resolved, "Resolved packages");
        self.coordinator
            .run_cmd(
                &format!("{APT_CMD} install --yes {}", resolved.join(" ")),
                CmdOptions::with_timeout(options.timeout)
                    .retries(options.retries)
                    .notify(options.notify),
            )
            .await
    }

    async fn upgrade_system(&self) -> Result<(), UpdateError> {
        self.coordinator
            .run_cmd(
                &format!("{APT_CMD} upgrade --yes"),
                CmdOptions::with_timeout(Duration::from_secs(3600)).notify(true),
            )
            .await
    }
}
