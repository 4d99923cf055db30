//! Engine configuration
//!
//! The engine reads only the switches that decide which sites get patched.
//! Values come from a TOML file next to the plugin; a missing file is
//! replaced by a default one.
//!
//! # Example
//!
//! ```ignore
//! use sheath_core::EngineConfig;
//!
//! let config = EngineConfig::load().unwrap_or_default();
//! if config.shield.enabled {
//!     // shield attach patch is mandatory for this activation
//! }
//! ```

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use loader::{engine_config_path, host_layout_path, plugin_base_dir, plugins_dir};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine config directory from plugin location
    #[error("Config directory not available - could not resolve plugin base path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Shield related switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Redirect shield attachment through the controller
    pub enabled: bool,

    /// Patch the three hand-type call sites so a sheathed shield does not
    /// leave the left hand flagged as holding one
    pub hand_workaround: bool,

    /// Keep the shield visible while sitting
    pub hide_on_sit: bool,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hand_workaround: true,
            hide_on_sit: false,
        }
    }
}

/// Engine configuration.
///
/// Loaded from `Data/SKSE/Plugins/SimpleDualSheath.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Patch scabbard attach and detach
    pub scabbards: bool,

    pub shield: ShieldConfig,

    /// At least one two-handed weapon type is configured to be carried in
    /// the left hand; enables equip slot tracking
    pub two_handed_left: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            scabbards: true,
            shield: ShieldConfig::default(),
            two_handed_left: false,
        }
    }
}

impl EngineConfig {
    /// Load the config from the default path, creating it if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(engine_config_path()?)
    }

    /// Load the config from `path`, creating a default file if missing.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config = Self::load_from_str(&content)?;
            tracing::debug!("Loaded engine config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default engine config at {:?}", path);
            Ok(default)
        }
    }

    /// Parse a config from TOML text.
    pub fn load_from_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save the config to the default path.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(engine_config_path()?)
    }

    /// Save the config to `path`, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved engine config to {:?}", path);
        Ok(())
    }

    /// Reload the config from the default path.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = engine_config_path()?;
        let content = std::fs::read_to_string(&path)?;
        *self = Self::load_from_str(&content)?;
        tracing::debug!("Reloaded engine config from {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.version, 1);
        assert!(!config.debug);
        assert!(config.scabbards);
        assert!(config.shield.enabled);
        assert!(!config.two_handed_left);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = EngineConfig::load_from_str(
            r#"
            debug = true

            [shield]
            hide_on_sit = true
            "#,
        )
        .unwrap();

        assert!(config.debug);
        assert!(config.scabbards);
        assert!(config.shield.enabled);
        assert!(config.shield.hand_workaround);
        assert!(config.shield.hide_on_sit);
    }

    #[test]
    fn test_engine_config_serialize() {
        let config = EngineConfig {
            version: 2,
            two_handed_left: true,
            ..Default::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("version = 2"));
        assert!(toml_str.contains("two_handed_left = true"));
        assert!(toml_str.contains("[shield]"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = EngineConfig::load_from_str("scabbards = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("sheath-config-{}", std::process::id()));
        let path = dir.join("nested").join("SimpleDualSheath.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let created = EngineConfig::load_from(&path).unwrap();
        assert_eq!(created, EngineConfig::default());
        assert!(path.exists());

        std::fs::write(&path, "scabbards = false\n").unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert!(!loaded.scabbards);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
