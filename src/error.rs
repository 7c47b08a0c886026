use thiserror::Error;

/// Main error type for process tracking
#[derive(Debug, Error)]
pub enum TrackerError {
    // Tracker lifecycle errors
    #[error("Invalid tracker name: {0}")]
    InvalidName(String),

    #[error("Failed to create grouping resource for {0}: {1}")]
    ResourceCreation(String, String),

    #[error("Tracker {0} has already been cleaned up")]
    AlreadyCleaned(String),

    #[error("Failed to add process {pid} to group {group}: {reason}")]
    Assignment {
        group: String,
        pid: u32,
        reason: String,
        /// The process had already exited before it could be assigned
        gone: bool,
    },

    #[error("Failed to tear down group {group}: {}", .failures.join("; "))]
    Teardown { group: String, failures: Vec<String> },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Spawning helper errors
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to initialize logging: {0}")]
    LoggingError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// True when an `add` failed only because the process exited first.
    ///
    /// Callers usually treat this as tolerable: there is nothing left to clean up.
    pub fn is_process_gone(&self) -> bool {
        matches!(self, TrackerError::Assignment { gone: true, .. })
    }

    pub(crate) fn assignment(group: &str, pid: u32, reason: impl Into<String>) -> Self {
        TrackerError::Assignment {
            group: group.to_string(),
            pid,
            reason: reason.into(),
            gone: false,
        }
    }

    pub(crate) fn process_gone(group: &str, pid: u32) -> Self {
        TrackerError::Assignment {
            group: group.to_string(),
            pid,
            reason: "process has already exited".to_string(),
            gone: true,
        }
    }
}

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;
