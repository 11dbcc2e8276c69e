use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::DEFAULT_SESSION_TTL_HOURS;
use crate::executor::{
    EngineSettings, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_LOG_ENTRIES,
};
use crate::launcher::ShellLauncher;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub auth: AuthConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub history_capacity: usize,
    pub max_log_entries: usize,
    pub max_line_bytes: usize,
    // Interpreter and leading args, the command text is appended last
    pub shell: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            shell: ShellLauncher::default_shell(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: PathBuf, // JSON file with commands and users
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config.json"),
        }
    }
}

impl Config {
    /// Load `~/.wheelhouse/config.toml`, writing the defaults there on first run.
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            Self::from_path(&config_path)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent() {
            fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wheelhouse")
            .join("config.toml")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            history_capacity: self.engine.history_capacity,
            max_log_entries: self.engine.max_log_entries,
            max_line_bytes: self.engine.max_line_bytes,
        }
    }

    pub fn session_ttl(&self) -> Result<chrono::Duration> {
        let hours = self.auth.session_ttl_hours;
        ensure!(hours > 0, "auth.session_ttl_hours must be positive, got {hours}");
        chrono::Duration::try_hours(hours)
            .with_context(|| format!("auth.session_ttl_hours {hours} is out of range"))
    }

    fn validate(&self) -> Result<()> {
        self.session_ttl()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nhistory_capacity = 5\n").unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.engine.history_capacity, 5);
        assert_eq!(config.engine.max_log_entries, DEFAULT_MAX_LOG_ENTRIES);
        assert_eq!(config.auth, AuthConfig::default());
        assert_eq!(config.catalog.path, PathBuf::from("config.json"));
        assert_eq!(config.session_ttl().unwrap(), chrono::Duration::hours(24));
        assert_eq!(config.engine.max_line_bytes, DEFAULT_MAX_LINE_BYTES);
    }

    #[test]
    fn save_then_load_gives_same_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.engine.shell = vec!["bash".into(), "-c".into()];
        config.auth.session_ttl_hours = 1;

        config.save(&path).unwrap();
        assert_eq!(Config::from_path(&path).unwrap(), config);
    }

    #[test]
    fn invalid_toml_is_an_error_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "engine = [").unwrap();
        let err = Config::from_path(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn session_ttl_must_be_positive_and_in_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        for hours in ["0", "-3", "9223372036854775807"] {
            fs::write(&path, format!("[auth]\nsession_ttl_hours = {hours}\n")).unwrap();
            let err = Config::from_path(&path).unwrap_err();
            assert!(format!("{err:#}").contains("session_ttl_hours"), "{err:#}");
        }
    }
}
