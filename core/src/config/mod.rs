//! Configuration management
//!
//! One `HostConfig` is loaded at boot and passed down explicitly; nothing
//! reads configuration from global state.

pub mod store;

pub use store::{
    BreakerSection, HostConfig, OrchestratorConfig, ProfileConfig, RuntimeConfig, MAX_WORKERS_ENV,
    PROFILE_ENV,
};

use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "nodehost.toml";

/// Find the configuration file in standard locations
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        let path = cwd.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(dir) = get_config_dir() {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Get the configuration directory path
pub fn get_config_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::config_dir() {
        return Some(dir.join("nodehost"));
    }

    dirs::home_dir().map(|home| home.join(".config").join("nodehost"))
}
