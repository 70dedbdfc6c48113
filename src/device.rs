//! Operational state of the managed device.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait DeviceState: Send + Sync {
    /// The device is running a job that updates must not interrupt.
    fn is_device_busy(&self) -> bool;

    /// An external install validation has not finished yet.
    fn validation_pending(&self) -> bool {
        false
    }

    fn distribution_id(&self) -> String {
        "unknown".to_string()
    }
}

/// Device state toggled by the embedding application.
#[derive(Debug)]
pub struct LocalDevice {
    busy: AtomicBool,
    validation_pending: AtomicBool,
    distribution: String,
}

impl LocalDevice {
    pub fn new(distribution: impl Into<String>) -> Self {
        Self {
            busy: AtomicBool::new(false),
            validation_pending: AtomicBool::new(false),
            distribution: distribution.into(),
        }
    }

    /// Read the distribution id from os-release.
    pub fn detect() -> Self {
        let distribution = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|contents| parse_os_release_id(&contents))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(distribution)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_validation_pending(&self, pending: bool) {
        self.validation_pending.store(pending, Ordering::SeqCst);
    }
}

impl DeviceState for LocalDevice {
    fn is_device_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn validation_pending(&self) -> bool {
        self.validation_pending.load(Ordering::SeqCst)
    }

    fn distribution_id(&self) -> String {
        self.distribution.clone()
    }
}

fn parse_os_release_id(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        line.strip_prefix("ID=")
            .map(|id| id.trim().trim_matches('"').to_lowercase())
    })
}
