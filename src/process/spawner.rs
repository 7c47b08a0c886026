use crate::error::{Result, TrackerError};
use crate::process::ProcessInfo;
use crate::tracker::ProcessTracker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// What to run and how
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Label used in error messages
    pub name: String,

    /// Program to execute
    pub program: PathBuf,

    /// Command-line arguments
    pub args: Vec<String>,

    /// Working directory for the process
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Pipe stdout/stderr instead of discarding them
    pub capture_output: bool,
}

impl SpawnOptions {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    /// Label from the spawn options
    pub name: String,
}

impl SpawnedProcess {
    /// Snapshot to hand to a tracker
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo::new(self.pid)
    }
}

/// Spawn a process, optionally starting it inside `tracker`'s group.
///
/// The child is not added to the tracker; callers still pass `info()` to
/// `add` so every backend sees the same registration step.
pub async fn spawn_process(
    options: &SpawnOptions,
    tracker: Option<&dyn ProcessTracker>,
) -> Result<SpawnedProcess> {
    let mut command = Command::new(&options.program);

    if !options.args.is_empty() {
        command.args(&options.args);
    }

    if let Some(ref cwd) = options.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in &options.env {
        command.env(key, value);
    }

    command.stdin(Stdio::null());
    if options.capture_output {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
    }

    if let Some(tracker) = tracker {
        tracker.prepare_command(&mut command);
    }

    let child = command.spawn().map_err(|e| {
        TrackerError::SpawnError(format!("Failed to spawn process '{}': {}", options.name, e))
    })?;

    let pid = child.id().ok_or_else(|| {
        TrackerError::SpawnError(format!("Failed to get PID for process '{}'", options.name))
    })?;

    Ok(SpawnedProcess {
        child,
        pid,
        name: options.name.clone(),
    })
}
