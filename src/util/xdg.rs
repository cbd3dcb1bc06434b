use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Get the home directory
pub fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .context("Failed to get home directory")
        .map(|bd| bd.home_dir().to_path_buf())
}

/// Get the XDG config directory for g4up
///
/// Returns `$XDG_CONFIG_HOME/g4up` or `~/.config/g4up` if not set
pub fn config_dir() -> Result<PathBuf> {
    let base = match env::var_os("XDG_CONFIG_HOME").filter(|value| !value.is_empty()) {
        Some(value) => PathBuf::from(value),
        None => home_dir()?.join(".config"),
    };

    Ok(base.join("g4up"))
}

/// Default location of the provisioning config file
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the XDG cache directory for g4up
///
/// Returns `$XDG_CACHE_HOME/g4up` or `~/.cache/g4up` if not set.
/// Image build contexts are staged here.
pub fn cache_dir() -> Result<PathBuf> {
    let base = match env::var_os("XDG_CACHE_HOME").filter(|value| !value.is_empty()) {
        Some(value) => PathBuf::from(value),
        None => home_dir()?.join(".cache"),
    };

    Ok(base.join("g4up"))
}
