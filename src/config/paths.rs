use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::UpdateError;

use super::Config;

pub const CONFIG_ENV_VAR: &str = "UPDATE_MANAGER_CONFIG";
const CONFIG_FILE_NAME: &str = "config.json";
const STORAGE_FILE: [&str; 2] = ["data", "update_manager.json"];

impl Config {
    /// Directory holding `config.json`; relative paths in the config resolve against it.
    pub fn app_root_dir() -> Result<PathBuf, UpdateError> {
        root_of(&get_config_path()?)
    }

    /// JSON file backing persisted update state.
    pub fn resolved_storage_path(&self) -> Result<PathBuf, UpdateError> {
        let root = Self::app_root_dir()?;
        Ok(storage_path_under(&root, self.storage_path.as_deref()))
    }
}

fn root_of(config_path: &Path) -> Result<PathBuf, UpdateError> {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.to_path_buf()),
        _ => std::env::current_dir()
            .map_err(|err| UpdateError::Config(format!("Failed to determine app root: {err}"))),
    }
}

fn storage_path_under(root: &Path, configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => root.join(path),
        None => STORAGE_FILE.iter().fold(root.to_path_buf(), |dir, part| dir.join(part)),
    }
}

/// `$UPDATE_MANAGER_CONFIG`, else `config.json` one level above the
/// directory holding the binary (`<root>/bin/update-manager`).
pub(super) fn get_config_path() -> Result<PathBuf, UpdateError> {
    if let Some(custom) = std::env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(custom));
    }

    let install_root = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf));
    match install_root {
        Some(root) => {
            let config_path = root.join(CONFIG_FILE_NAME);
            debug!(path = %config_path.display(), "Looking for config");
            Ok(config_path)
        }
        None => {
            warn!("Install root unknown, looking for config.json in the working directory");
            Ok(PathBuf::from(CONFIG_FILE_NAME))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_defaults_to_data_dir() {
        let root = Path::new("/home/pi/update-manager");
        assert_eq!(
            storage_path_under(root, None),
            root.join("data").join("update_manager.json")
        );
    }

    #[test]
    fn relative_storage_resolves_against_root() {
        let root = Path::new("/home/pi/update-manager");
        assert_eq!(
            storage_path_under(root, Some(Path::new("state/db.json"))),
            root.join("state/db.json")
        );
        assert_eq!(
            storage_path_under(root, Some(Path::new("/var/lib/um.json"))),
            PathBuf::from("/var/lib/um.json")
        );
    }

    #[test]
    fn bare_config_name_roots_at_working_dir() {
        let root = root_of(Path::new("config.json")).expect("root");
        assert_eq!(root, std::env::current_dir().expect("cwd"));
    }
}
