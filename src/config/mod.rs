use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file to load
pub const CONFIG_PATH_ENV: &str = "PROCTRACK_CONFIG";
/// Environment variable overriding `cgroup_root`
pub const CGROUP_ROOT_ENV: &str = "PROCTRACK_CGROUP_ROOT";
/// Environment variable overriding `kill_signal`
pub const KILL_SIGNAL_ENV: &str = "PROCTRACK_KILL_SIGNAL";

/// Longest time cleanup may spend waiting for a group to become releasable
const MAX_RELEASE_BUDGET_MS: u64 = 5000;

const VALID_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Ambient settings shared by every tracker the factory builds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Signal sent to every member on cleanup (Unix backends)
    pub kill_signal: String,

    /// cgroup v2 directory under which per-tracker groups are created (Linux).
    /// When unset, Linux falls back to process groups.
    pub cgroup_root: Option<PathBuf>,

    /// How many times to retry releasing a group that still reports members
    pub release_retries: u32,

    /// Delay between release retries (in milliseconds)
    pub release_retry_interval_ms: u64,

    /// Tag spawned children with a per-tracker marker so escaped descendants are swept too
    pub env_marker: bool,

    /// Exit code assigned to processes terminated through a job object (Windows)
    pub exit_code: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kill_signal: "SIGKILL".to_string(),
            cgroup_root: None,
            release_retries: 20,
            release_retry_interval_ms: 5,
            env_marker: true,
            exit_code: 1,
        }
    }
}

impl TrackerConfig {
    /// Load tracker configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<TrackerConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(TrackerError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        let vars: Vec<(String, String)> = std::env::vars().collect();
        config.expand_env_vars(&vars);
        config.validate()?;

        Ok(config)
    }

    /// Build the configuration from the process environment.
    ///
    /// `PROCTRACK_CONFIG` names an optional file; the remaining variables
    /// override individual fields on top of it.
    pub fn from_env() -> Result<TrackerConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<TrackerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => TrackerConfig::default(),
        };

        if let Some(root) = lookup(CGROUP_ROOT_ENV) {
            config.cgroup_root = if root.is_empty() {
                None
            } else {
                Some(PathBuf::from(root))
            };
        }

        if let Some(signal) = lookup(KILL_SIGNAL_ENV) {
            config.kill_signal = signal;
        }

        config.validate()?;
        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<TrackerConfig> {
        toml::from_str(contents)
            .map_err(|e| TrackerError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<TrackerConfig> {
        serde_json::from_str(contents)
            .map_err(|e| TrackerError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !VALID_SIGNALS.contains(&self.kill_signal.as_str()) {
            return Err(TrackerError::ConfigValidationError(format!(
                "Invalid kill_signal: {}. Must be one of: {}",
                self.kill_signal,
                VALID_SIGNALS.join(", ")
            )));
        }

        if self.release_retries > 1000 {
            return Err(TrackerError::ConfigValidationError(
                "release_retries cannot exceed 1000".to_string(),
            ));
        }

        if self.release_retry_interval_ms > 1000 {
            return Err(TrackerError::ConfigValidationError(
                "release_retry_interval_ms cannot exceed 1000".to_string(),
            ));
        }

        let release_budget_ms = u64::from(self.release_retries) * self.release_retry_interval_ms;
        if release_budget_ms > MAX_RELEASE_BUDGET_MS {
            return Err(TrackerError::ConfigValidationError(format!(
                "release_retries * release_retry_interval_ms cannot exceed {} ms (got {} ms)",
                MAX_RELEASE_BUDGET_MS, release_budget_ms
            )));
        }

        if let Some(ref root) = self.cgroup_root {
            if !root.is_absolute() {
                return Err(TrackerError::ConfigValidationError(format!(
                    "cgroup_root must be an absolute path: {}",
                    root.display()
                )));
            }
        }

        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` in path fields
    fn expand_env_vars(&mut self, vars: &[(String, String)]) {
        if let Some(ref root) = self.cgroup_root {
            self.cgroup_root = Some(Self::expand_env_in_path(root, vars));
        }
    }

    fn expand_env_in_string(s: &str, vars: &[(String, String)]) -> String {
        let mut result = s.to_string();

        for (key, value) in vars {
            result = result.replace(&format!("${{{}}}", key), value);
            result = result.replace(&format!("${}", key), value);
        }

        result
    }

    fn expand_env_in_path(path: &Path, vars: &[(String, String)]) -> PathBuf {
        let path_str = path.to_string_lossy();
        PathBuf::from(Self::expand_env_in_string(&path_str, vars))
    }

    /// Get the release retry interval as Duration
    pub fn release_retry_interval(&self) -> Duration {
        Duration::from_millis(self.release_retry_interval_ms)
    }
}
