//! Centralized path configuration for pcitrack.
//!
//! The CLI and tests resolve every on-disk location through this module.

use std::path::PathBuf;

const DATA_DIR_ENV: &str = "PCITRACK_DATA_DIR";
const CONFIG_DIR_ENV: &str = "PCITRACK_CONFIG_DIR";
const SYSTEM_DATA_DIR: &str = "/var/lib/pcitrack";

/// Get the pcitrack data directory.
///
/// Resolution order:
/// 1. `PCITRACK_DATA_DIR` environment variable
/// 2. `/var/lib/pcitrack` if it exists (system install)
/// 3. `~/.pcitrack` for user-only installs
pub fn data_dir() -> PathBuf {
    resolve_data_dir(std::env::var(DATA_DIR_ENV).ok())
}

/// Get the configuration directory.
///
/// Resolution order:
/// 1. `PCITRACK_CONFIG_DIR` environment variable
/// 2. `$XDG_CONFIG_HOME/pcitrack` (or the platform equivalent)
/// 3. the data directory
pub fn config_dir() -> PathBuf {
    resolve_config_dir(std::env::var(CONFIG_DIR_ENV).ok())
}

fn resolve_data_dir(env_dir: Option<String>) -> PathBuf {
    if let Some(dir) = env_dir {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from(SYSTEM_DATA_DIR);
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".pcitrack")).unwrap_or(system_dir)
}

fn resolve_config_dir(env_dir: Option<String>) -> PathBuf {
    if let Some(dir) = env_dir {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("pcitrack")).unwrap_or_else(data_dir)
}
