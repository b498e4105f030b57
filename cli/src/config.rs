// Host configuration for the backcam CLI
//
// Agent settings live in the agent's own store; this file only holds what
// the desktop host itself needs. Stored in:
// - macOS: ~/Library/Application Support/backcam/config.json
// - Linux: ~/.config/backcam/config.json
// - Windows: %APPDATA%\backcam\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JPEG served by the file-backed camera
    pub still_image: Option<PathBuf>,

    /// `tracing` filter used when RUST_LOG is not set
    pub log_filter: String,

    /// Override for the photo directories; defaults under the data dir
    pub photo_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            still_image: None,
            log_filter: "info".to_string(),
            photo_dir: None,
        }
    }
}

impl Config {
    /// Keys handled by the host config rather than the agent settings
    pub const KEYS: [&'static str; 3] = ["still_image", "log_filter", "photo_dir"];

    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("backcam");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("backcam");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn is_host_key(key: &str) -> bool {
        Self::KEYS.contains(&key)
    }

    /// Set a host value; an empty value clears optional paths
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional_path = || (!value.is_empty()).then(|| PathBuf::from(value));
        match key {
            "still_image" => self.still_image = optional_path(),
            "photo_dir" => self.photo_dir = optional_path(),
            "log_filter" => {
                tracing_subscriber::EnvFilter::try_new(value)
                    .with_context(|| format!("Invalid log filter '{}'", value))?;
                self.log_filter = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let show = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unset)".to_string())
        };
        match key {
            "still_image" => Some(show(&self.still_image)),
            "photo_dir" => Some(show(&self.photo_dir)),
            "log_filter" => Some(self.log_filter.clone()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        Self::KEYS
            .iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }

    /// Private and public photo directories
    pub fn photo_dirs(&self, data_dir: &Path) -> (PathBuf, PathBuf) {
        let base = self
            .photo_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("photos"));
        (base.join("private"), base.join("public"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_filter, "info");
        assert!(config.still_image.is_none());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("still_image", "/tmp/cat.jpg").unwrap();
        config.set("log_filter", "backcam_core=debug").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.get("still_image").as_deref(), Some("/tmp/cat.jpg"));
        assert_eq!(reloaded.log_filter, "backcam_core=debug");

        config.set("still_image", "").unwrap();
        assert_eq!(config.get("still_image").as_deref(), Some("(unset)"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut config = Config::default();
        assert!(config.set("capture_interval", "10").is_err());
        assert!(!Config::is_host_key("capture_interval"));
        assert!(Config::is_host_key("log_filter"));
    }

    #[test]
    fn test_photo_dirs_default_under_data_dir() {
        let config = Config::default();
        let (private, public) = config.photo_dirs(Path::new("/data"));
        assert_eq!(private, PathBuf::from("/data/photos/private"));
        assert_eq!(public, PathBuf::from("/data/photos/public"));
    }
}
