use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

const APP_DIR: &str = "tfws";

fn base_dir(var: &str, fallback: &str) -> Result<PathBuf> {
    if let Some(value) = env::var_os(var).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }

    Ok(home_dir()?.join(fallback))
}

/// Get the XDG config directory for tfws
///
/// Returns `$XDG_CONFIG_HOME/tfws` or `~/.config/tfws` if not set
pub fn config_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_CONFIG_HOME", ".config")?.join(APP_DIR))
}

/// Get the XDG state directory for tfws
///
/// Returns `$XDG_STATE_HOME/tfws` or `~/.local/state/tfws` if not set
pub fn state_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_STATE_HOME", ".local/state")?.join(APP_DIR))
}

/// Get the XDG cache directory for tfws
///
/// Returns `$XDG_CACHE_HOME/tfws` or `~/.cache/tfws` if not set
pub fn cache_dir() -> Result<PathBuf> {
    Ok(base_dir("XDG_CACHE_HOME", ".cache")?.join(APP_DIR))
}

/// Get the home directory
pub fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| Error::configuration("Failed to get home directory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn xdg_overrides_are_respected() {
        let temp = TempDir::new().unwrap();
        env::set_var("XDG_CONFIG_HOME", temp.path().join("config"));
        env::set_var("XDG_STATE_HOME", temp.path().join("state"));
        env::set_var("XDG_CACHE_HOME", temp.path().join("cache"));

        assert_eq!(config_dir().unwrap(), temp.path().join("config/tfws"));
        assert_eq!(state_dir().unwrap(), temp.path().join("state/tfws"));
        assert_eq!(cache_dir().unwrap(), temp.path().join("cache/tfws"));
    }

    #[test]
    #[serial]
    fn empty_override_falls_back_to_home() {
        env::set_var("XDG_CACHE_HOME", "");
        let dir = cache_dir().unwrap();
        assert!(dir.ends_with(".cache/tfws"));
    }
}
