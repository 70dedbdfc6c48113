use serde::Serialize;
use tracing::debug;

use super::enums::{Error, Exit, Info, Role, Status};
use super::{PropertyValue, TransactionCall, TransactionEvent, TransactionLink};
use crate::coordinator::Coordinator;
use crate::types::UpdateError;

const UNKNOWN_PERCENTAGE: u32 = 101;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransactionItem {
    Package {
        package_id: String,
        info: String,
        summary: String,
    },
    Repo {
        repo_id: String,
        description: String,
        enabled: bool,
    },
}

impl TransactionItem {
    pub fn package_id(&self) -> Option<&str> {
        match self {
            TransactionItem::Package { package_id, .. } => Some(package_id),
            TransactionItem::Repo { .. } => None,
        }
    }
}

pub type Outcome = Result<Vec<TransactionItem>, String>;

/// Side effect requested by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Notify(String),
    Log(String),
    Settle(Outcome),
}

/// One package management call, from creation to its finished signal.
#[derive(Debug)]
pub struct Transaction {
    notify: bool,
    role: Role,
    status: Status,
    transaction_flags: u64,
    percentage: u32,
    download_remaining: u64,
    speed: u64,
    result: Vec<TransactionItem>,
    error_message: Option<String>,
    settled: bool,
}

impl Transaction {
    pub fn new(notify: bool) -> Self {
        Self {
            notify,
            role: Role::Unknown,
            status: Status::Unknown,
            transaction_flags: 0,
            percentage: UNKNOWN_PERCENTAGE,
            download_remaining: 0,
            speed: 0,
            result: Vec::new(),
            error_message: None,
            settled: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn transaction_flags(&self) -> u64 {
        self.transaction_flags
    }

    pub fn percentage(&self) -> u32 {
        self.percentage
    }

    /// Issue `call` over `link` and drive the transaction to its outcome.
    pub async fn run(
        mut self,
        link: TransactionLink,
        call: TransactionCall,
        coordinator: &Coordinator,
    ) -> Result<Vec<TransactionItem>, UpdateError> {
        let TransactionLink { handle, mut events } = link;
        debug!(method = call.method(), "Running transaction");

        if let Err(err) = handle.call(call).await {
            let effect = self.fail(err.to_string());
            return finish(apply(effect, coordinator));
        }

        while let Some(event) = events.recv().await {
            let mut outcome = None;
            for effect in self.handle(event) {
                if let Some(settled) = apply(effect, coordinator) {
                    outcome = Some(settled);
                }
            }
            if outcome.is_some() {
                return finish(outcome);
            }
        }

        let effect = self.fail(format!(
            "Transaction {} ended without a finished signal",
            self.role.desc()
        ));
        finish(apply(effect, coordinator))
    }

    /// Apply one signal and return the effects it produces.
    pub fn handle(&mut self, event: TransactionEvent) -> Vec<Effect> {
        match event {
            TransactionEvent::Package {
                info,
                package_id,
                summary,
            } => self.on_package(Info::from_index(info), package_id, summary),
            TransactionEvent::RepoDetail {
                repo_id,
                description,
                enabled,
            } => self.on_repo_detail(repo_id, description, enabled),
            TransactionEvent::ItemProgress { .. } => Vec::new(),
            TransactionEvent::ErrorCode { code, details } => {
                self.error_message = Some(format!("{}: {}", Error::from_index(code).desc(), details));
                Vec::new()
            }
            TransactionEvent::Finished {
                exit_code,
                run_time_ms,
            } => self.on_finished(Exit::from_index(exit_code), run_time_ms),
            TransactionEvent::PropertiesChanged(changed) => changed
                .into_iter()
                .flat_map(|(name, value)| self.set_property(&name, &value))
                .collect(),
        }
    }

    /// Settle as a failure without a finished signal.
    pub fn fail(&mut self, reason: String) -> Effect {
        self.settle(Err(reason))
    }

    fn settle(&mut self, outcome: Outcome) -> Effect {
        assert!(!self.settled, "transaction settled twice");
        self.settled = true;
        Effect::Settle(outcome)
    }

    fn on_package(&mut self, info: Info, package_id: String, summary: String) -> Vec<Effect> {
        if self.role.collects_packages() {
            self.result.push(TransactionItem::Package {
                package_id,
                info: info.desc().to_string(),
                summary,
            });
            return Vec::new();
        }
        if !self.notify || info == Info::Finished {
            return Vec::new();
        }
        let mut parts = package_id.split(';');
        let name = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        vec![Effect::Notify(format!("{}: {} ({})", info.desc(), name, version))]
    }

    fn on_repo_detail(&mut self, repo_id: String, description: String, enabled: bool) -> Vec<Effect> {
        if self.role == Role::GetRepoList {
            self.result.push(TransactionItem::Repo {
                repo_id,
                description,
                enabled,
            });
            return Vec::new();
        }
        if !self.notify {
            return Vec::new();
        }
        let repo = if repo_id.trim().is_empty() {
            description
        } else {
            repo_id
        };
        vec![Effect::Notify(format!("GET: {repo}"))]
    }

    fn on_finished(&mut self, exit: Exit, run_time_ms: u64) -> Vec<Effect> {
        let outcome = if exit == Exit::Success {
            Ok(std::mem::take(&mut self.result))
        } else {
            Err(self
                .error_message
                .take()
                .unwrap_or_else(|| exit.desc().to_string()))
        };
        let mut effects = vec![self.settle(outcome)];
        let message = format!(
            "Transaction {}: Exit {}, Run time: {:.2} seconds",
            self.role.desc(),
            exit.desc(),
            run_time_ms as f64 / 1000.0
        );
        if self.notify {
            effects.push(Effect::Notify(message.clone()));
        }
        effects.push(Effect::Log(message));
        effects
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Vec<Effect> {
        let Some(number) = value.as_u64() else {
            return Vec::new();
        };
        match name {
            "Role" => {
                self.role = Role::from_index(saturating_u32(number));
                if self.role.is_query() {
                    self.notify = false;
                }
                let mut effects = Vec::new();
                if self.notify {
                    effects.push(Effect::Notify(format!(
                        "Transaction {} started...",
                        self.role.desc()
                    )));
                }
                effects.push(Effect::Log(format!("Current Role: {}", self.role.desc())));
                effects
            }
            "Status" => {
                self.status = Status::from_index(saturating_u32(number));
                self.percentage = UNKNOWN_PERCENTAGE;
                self.speed = 0;
                vec![Effect::Log(format!("Current Status: {}", self.status.desc()))]
            }
            "Percentage" => {
                self.percentage = saturating_u32(number);
                if self.status.reports_progress() {
                    self.progress().into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            "TransactionFlags" => {
                self.transaction_flags = number;
                Vec::new()
            }
            "DownloadSizeRemaining" => {
                self.download_remaining = number;
                self.progress().into_iter().collect()
            }
            "Speed" => {
                self.speed = number;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn progress(&self) -> Option<Effect> {
        if !self.notify || self.percentage > 100 {
            return None;
        }
        let mut message = format!("{}...{}%", self.status.desc(), self.percentage);
        if self.status == Status::Download && self.download_remaining > 0 {
            message.push_str(&format!(", Remaining: {}", format_bytes(self.download_remaining, "")));
            if self.speed > 0 {
                message.push_str(&format!(", Speed: {}", format_bytes(self.speed / 8, "/s")));
            }
        }
        Some(Effect::Notify(message))
    }
}

/// Out-of-range values stay out of range instead of wrapping.
fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn format_bytes(bytes: u64, suffix: &str) -> String {
    if bytes < 1024 {
        format!("{bytes} B{suffix}")
    } else if bytes < 1024 * 1024 {
        format!("{} KiB{suffix}", bytes / 1024)
    } else {
        format!("{} MiB{suffix}", bytes / (1024 * 1024))
    }
}

fn apply(effect: Effect, coordinator: &Coordinator) -> Option<Outcome> {
    match effect {
        Effect::Notify(message) => {
            coordinator.notify_update_response(message, false);
            None
        }
        Effect::Log(message) => {
            debug!("{message}");
            None
        }
        Effect::Settle(outcome) => Some(outcome),
    }
}

fn finish(outcome: Option<Outcome>) -> Result<Vec<TransactionItem>, UpdateError> {
    match outcome {
        Some(Ok(items)) => Ok(items),
        Some(Err(reason)) => Err(UpdateError::Transaction(reason)),
        None => Err(UpdateError::Transaction(
            "Transaction did not settle".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::enums::Role;

    fn props(values: &[(&str, u64)]) -> TransactionEvent {
        TransactionEvent::PropertiesChanged(
            values
                .iter()
                .map(|(name, value)| (name.to_string(), PropertyValue::U64(*value)))
                .collect(),
        )
    }

    fn notifications(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Notify(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn package(info: Info, package_id: &str) -> TransactionEvent {
        TransactionEvent::Package {
            info: info.index(),
            package_id: package_id.to_string(),
            summary: String::new(),
        }
    }

    #[test]
    fn update_packages_narrates_and_succeeds() {
        let mut tx = Transaction::new(true);
        let mut seen = Vec::new();
        seen.extend(notifications(&tx.handle(props(&[("Role", Role::UpdatePackages.index() as u64)]))));
        seen.extend(notifications(&tx.handle(props(&[("Status", Status::Download.index() as u64)]))));
        seen.extend(notifications(&tx.handle(props(&[
            ("Percentage", 40),
            ("Speed", 8 * 2048 * 1024),
            ("DownloadSizeRemaining", 5 * 1024 * 1024),
        ]))));
        seen.extend(notifications(&tx.handle(package(Info::Downloading, "curl;7.88.1;arm64;main"))));
        seen.extend(notifications(&tx.handle(package(Info::Finished, "curl;7.88.1;arm64;main"))));
        seen.extend(notifications(&tx.handle(props(&[("Status", Status::Update.index() as u64)]))));
        seen.extend(notifications(&tx.handle(props(&[("Percentage", 75)]))));

        let effects = tx.handle(TransactionEvent::Finished {
            exit_code: Exit::Success.index(),
            run_time_ms: 2500,
        });
        assert_eq!(effects[0], Effect::Settle(Ok(Vec::new())));
        seen.extend(notifications(&effects));

        assert_eq!(
            seen,
            vec![
                "Transaction Update Packages started...",
                "Downloading...40%, Remaining: 5 MiB, Speed: 2 MiB/s",
                "Downloading: curl (7.88.1)",
                "Updating...75%",
                "Transaction Update Packages: Exit Success, Run time: 2.50 seconds",
            ]
        );
    }

    #[test]
    fn install_reports_each_percentage_before_completion() {
        let mut tx = Transaction::new(true);
        let mut seen = Vec::new();
        seen.extend(notifications(&tx.handle(props(&[("Role", Role::InstallPackages.index() as u64)]))));
        seen.extend(notifications(&tx.handle(props(&[("Status", Status::Install.index() as u64)]))));
        seen.extend(notifications(&tx.handle(props(&[("Percentage", 10)]))));
        seen.extend(notifications(&tx.handle(props(&[("Percentage", 55)]))));
        let effects = tx.handle(TransactionEvent::Finished {
            exit_code: Exit::Success.index(),
            run_time_ms: 4000,
        });
        assert_eq!(effects[0], Effect::Settle(Ok(Vec::new())));
        seen.extend(notifications(&effects));

        assert_eq!(
            seen,
            vec![
                "Transaction Install Packages started...",
                "Installing...10%",
                "Installing...55%",
                "Transaction Install Packages: Exit Success, Run time: 4.00 seconds",
            ]
        );
    }

    #[test]
    fn percentage_outside_progress_statuses_is_silent() {
        let mut tx = Transaction::new(true);
        tx.handle(props(&[("Role", Role::InstallPackages.index() as u64)]));
        tx.handle(props(&[("Status", Status::Setup.index() as u64)]));
        assert!(tx.handle(props(&[("Percentage", 20)])).is_empty());
        assert_eq!(tx.percentage(), 20);
    }

    #[test]
    fn oversized_property_values_do_not_wrap() {
        let mut tx = Transaction::new(true);
        tx.handle(props(&[("Role", Role::InstallPackages.index() as u64)]));
        tx.handle(props(&[("Status", Status::Install.index() as u64)]));
        let effects = tx.handle(props(&[("Percentage", (1u64 << 32) + 40)]));
        assert!(notifications(&effects).is_empty());
        assert_eq!(tx.percentage(), u32::MAX);

        let mut tx = Transaction::new(true);
        let effects = tx.handle(props(&[("Role", (1u64 << 32) + Role::GetUpdates.index() as u64)]));
        assert_eq!(notifications(&effects), vec!["Transaction Unknown started..."]);
    }

    #[test]
    fn query_roles_collect_and_stay_silent() {
        let mut tx = Transaction::new(true);
        let effects = tx.handle(props(&[("Role", Role::GetUpdates.index() as u64)]));
        assert!(notifications(&effects).is_empty());
        assert!(tx.handle(package(Info::Normal, "git;2.39;arm64;main")).is_empty());
        assert!(tx.handle(package(Info::Security, "openssl;3.0;arm64;main")).is_empty());

        let effects = tx.handle(TransactionEvent::Finished {
            exit_code: Exit::Success.index(),
            run_time_ms: 10,
        });
        let Effect::Settle(Ok(items)) = &effects[0] else {
            panic!("expected success, got {effects:?}");
        };
        let ids: Vec<_> = items.iter().filter_map(TransactionItem::package_id).collect();
        assert_eq!(ids, vec!["git;2.39;arm64;main", "openssl;3.0;arm64;main"]);
        assert!(notifications(&effects).is_empty());
    }

    #[test]
    fn stored_error_wins_over_exit_description() {
        let mut tx = Transaction::new(false);
        tx.handle(props(&[("Role", Role::InstallPackages.index() as u64)]));
        tx.handle(TransactionEvent::ErrorCode {
            code: Error::PackageNotFound.index(),
            details: "klipper-deps".to_string(),
        });
        let effects = tx.handle(TransactionEvent::Finished {
            exit_code: Exit::Failed.index(),
            run_time_ms: 0,
        });
        assert_eq!(
            effects[0],
            Effect::Settle(Err("PACKAGE_NOT_FOUND: klipper-deps".to_string()))
        );
        assert!(matches!(effects.last(), Some(Effect::Log(_))));
    }

    #[test]
    fn exit_description_used_without_error() {
        let mut tx = Transaction::new(false);
        let effects = tx.handle(TransactionEvent::Finished {
            exit_code: Exit::Cancelled.index(),
            run_time_ms: 0,
        });
        assert_eq!(effects[0], Effect::Settle(Err("Cancelled".to_string())));
    }

    #[test]
    fn repo_details_narrate_with_description_fallback() {
        let mut tx = Transaction::new(true);
        tx.handle(props(&[("Role", Role::RefreshCache.index() as u64)]));
        let effects = tx.handle(TransactionEvent::RepoDetail {
            repo_id: "  ".to_string(),
            description: "http://deb.debian.org bookworm InRelease".to_string(),
            enabled: true,
        });
        assert_eq!(
            notifications(&effects),
            vec!["GET: http://deb.debian.org bookworm InRelease"]
        );
    }

    #[test]
    fn status_change_resets_progress() {
        let mut tx = Transaction::new(true);
        tx.handle(props(&[("Status", Status::Running.index() as u64), ("Percentage", 30)]));
        assert_eq!(tx.percentage(), 30);
        tx.handle(props(&[("Status", Status::Finished.index() as u64)]));
        assert_eq!(tx.percentage(), 101);
        assert!(tx.handle(props(&[("Percentage", 101)])).is_empty());
        assert!(tx.handle(props(&[("UnknownProperty", 1)])).is_empty());
    }

    #[test]
    #[should_panic(expected = "transaction settled twice")]
    fn double_settlement_panics() {
        let mut tx = Transaction::new(false);
        let finished = TransactionEvent::Finished {
            exit_code: Exit::Success.index(),
            run_time_ms: 0,
        };
        tx.handle(finished.clone());
        tx.handle(finished);
    }
}
