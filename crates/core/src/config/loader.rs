//! Config path resolution
//!
//! Handles resolving paths for configuration files based on the plugin's location.

use std::path::{Path, PathBuf};

use super::{ConfigError, ConfigResult};

const CONFIG_FILE: &str = "SimpleDualSheath.toml";
const LAYOUT_FILE: &str = "SimpleDualSheath.layout.json";

/// Returns the game directory by navigating up from the host executable.
///
/// The host runs from the game root, so the executable's parent is the base.
pub fn plugin_base_dir() -> ConfigResult<PathBuf> {
    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;

    exe.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the plugin directory.
///
/// Path: `<game>/Data/SKSE/Plugins/`
pub fn plugins_dir() -> ConfigResult<PathBuf> {
    Ok(plugins_dir_in(&plugin_base_dir()?))
}

/// Returns the engine config path.
///
/// Path: `<game>/Data/SKSE/Plugins/SimpleDualSheath.toml`
pub fn engine_config_path() -> ConfigResult<PathBuf> {
    Ok(plugins_dir()?.join(CONFIG_FILE))
}

/// Returns the host layout path.
///
/// Path: `<game>/Data/SKSE/Plugins/SimpleDualSheath.layout.json`
pub fn host_layout_path() -> ConfigResult<PathBuf> {
    Ok(plugins_dir()?.join(LAYOUT_FILE))
}

fn plugins_dir_in(base: &Path) -> PathBuf {
    base.join("Data").join("SKSE").join("Plugins")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugins_dir_format() {
        let base = PathBuf::from("/games/Skyrim Special Edition");
        let dir = plugins_dir_in(&base);

        assert!(dir.ends_with("Data/SKSE/Plugins"));
        assert!(dir.join(CONFIG_FILE).ends_with("Plugins/SimpleDualSheath.toml"));
    }

    #[test]
    fn test_paths_share_directory() {
        let config = engine_config_path().unwrap();
        let layout = host_layout_path().unwrap();
        assert_eq!(config.parent(), layout.parent());
    }
}
