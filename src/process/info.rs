use serde::{Deserialize, Serialize};

/// Snapshot of one OS process handed to a tracker.
///
/// Produced by the spawning layer; trackers only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID assigned by the OS
    pub pid: u32,

    /// Exit code, if the spawning layer has already observed the exit
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ProcessInfo {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit_code: None,
        }
    }

    /// Snapshot of a process whose exit has already been observed
    pub fn exited(pid: u32, exit_code: i32) -> Self {
        Self {
            pid,
            exit_code: Some(exit_code),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.exit_code.is_some()
    }
}

impl std::fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "pid {} (exited {})", self.pid, code),
            None => write!(f, "pid {}", self.pid),
        }
    }
}
