use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clamshell::ClamshellMode;
use crate::profile_store::TieBreak;
use crate::validate_enum;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub matching: MatchingSettings,

    #[serde(default)]
    pub workspaces: WorkspaceSettings,

    #[serde(default)]
    pub clamshell: ClamshellSettings,
}

/// General daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Overrides `$XDG_CONFIG_HOME/monique/profiles`
    #[serde(default)]
    pub profiles_dir: Option<String>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            profiles_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Timing of the hotplug pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,

    #[serde(default = "default_detect_retry_secs")]
    pub detect_retry_secs: u64,

    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Niri fallback polling when DRM hotplug notifications are unavailable
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Apply the best matching profile automatically after a hotplug
    #[serde(default = "default_true")]
    pub auto_apply: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            detect_retry_secs: default_detect_retry_secs(),
            backend_timeout_ms: default_backend_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_apply: true,
        }
    }
}

impl DaemonSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn detect_retry(&self) -> Duration {
        Duration::from_secs(self.detect_retry_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_debounce_ms() -> u64 {
    500
}
fn default_confirm_timeout_secs() -> u64 {
    10
}
fn default_detect_retry_secs() -> u64 {
    5
}
fn default_backend_timeout_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

/// Profile selection policy
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatchingSettings {
    #[serde(default)]
    pub tie_break: TieBreak,
}

/// Workspace migration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceSettings {
    #[serde(default = "default_true")]
    pub migrate: bool,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self { migrate: true }
    }
}

/// Lid-driven internal panel control
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClamshellSettings {
    #[serde(default)]
    pub mode: ClamshellMode,
}

impl Config {
    /// Load configuration from `$MONIQUE_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Resolve the config file path, honouring `MONIQUE_CONFIG`
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var_os("MONIQUE_CONFIG") {
            Some(path) => Ok(PathBuf::from(path)),
            None => Self::default_config_path(),
        }
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("monique");

        Ok(config_dir.join("config.toml"))
    }

    /// Directory holding one JSON document per profile
    pub fn profiles_dir(&self) -> Result<PathBuf> {
        match self.general.profiles_dir {
            Some(ref dir) => Ok(PathBuf::from(dir)),
            None => Ok(dirs::config_dir()
                .context("Failed to get config directory")?
                .join("monique")
                .join("profiles")),
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.validate_log_level(&self.general.log_level)?;

        if self.daemon.debounce_ms == 0 {
            anyhow::bail!("daemon.debounce_ms must be greater than 0");
        }
        if self.daemon.confirm_timeout_secs == 0 {
            anyhow::bail!("daemon.confirm_timeout_secs must be greater than 0");
        }
        if self.daemon.detect_retry_secs == 0 {
            anyhow::bail!("daemon.detect_retry_secs must be greater than 0");
        }
        if self.daemon.backend_timeout_ms == 0 {
            anyhow::bail!("daemon.backend_timeout_ms must be greater than 0");
        }
        if self.daemon.poll_interval_ms < 100 {
            anyhow::bail!(
                "daemon.poll_interval_ms must be at least 100 (got {})",
                self.daemon.poll_interval_ms
            );
        }

        Ok(())
    }

    fn validate_log_level(&self, level: &str) -> Result<()> {
        validate_enum!(level, "trace", "debug", "info", "warn", "error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.daemon.debounce(), Duration::from_millis(500));
        assert_eq!(config.daemon.confirm_timeout(), Duration::from_secs(10));
        assert_eq!(config.daemon.detect_retry(), Duration::from_secs(5));
        assert_eq!(config.daemon.backend_timeout(), Duration::from_secs(2));
        assert!(config.daemon.auto_apply);
        assert!(config.workspaces.migrate);
        assert_eq!(config.clamshell.mode, ClamshellMode::Off);
        assert_eq!(config.matching.tie_break, TieBreak::MostRecent);
    }

    #[test]
    fn test_validate_log_level() {
        let config = Config::default();
        assert!(config.validate_log_level("debug").is_ok());
        assert!(config.validate_log_level("warn").is_ok());
        assert!(config.validate_log_level("verbose").is_err());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[general]
log_level = "debug"
profiles_dir = "/tmp/monique-profiles"

[daemon]
debounce_ms = 750
confirm_timeout_secs = 15
auto_apply = false

[matching]
tie_break = "lexical"

[workspaces]
migrate = false

[clamshell]
mode = "automatic"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.daemon.debounce_ms, 750);
        assert_eq!(config.daemon.confirm_timeout_secs, 15);
        assert_eq!(config.daemon.backend_timeout_ms, 2000);
        assert!(!config.daemon.auto_apply);
        assert_eq!(config.matching.tie_break, TieBreak::Lexical);
        assert!(!config.workspaces.migrate);
        assert_eq!(config.clamshell.mode, ClamshellMode::Automatic);
        assert_eq!(
            config.profiles_dir().unwrap(),
            PathBuf::from("/tmp/monique-profiles")
        );
    }

    #[test]
    fn test_unknown_tie_break_rejected() {
        let toml = r#"
[matching]
tie_break = "random"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_zero_debounce_rejected() {
        let toml = r#"
[daemon]
debounce_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.debounce_ms, 500);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general]\nlog_level = \"loud\"\n").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
