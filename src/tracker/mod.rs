// Tracker module - groups spawned processes so they can be torn down together

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(windows)]
pub mod job_object;
#[cfg(unix)]
pub mod process_group;

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::process::ProcessInfo;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[cfg(target_os = "linux")]
pub use cgroup::CgroupTracker;
#[cfg(windows)]
pub use job_object::JobObjectTracker;
#[cfg(unix)]
pub use process_group::ProcessGroupTracker;

/// Environment variable stamped on children so escaped descendants can be found
pub const GROUP_MARKER_ENV: &str = "PROCTRACK_GROUP";

const MAX_NAME_LEN: usize = 128;

/// A named group of processes that can be terminated as a unit.
///
/// Every backend honours the same contract: `add` registers a live process,
/// `cleanup` signals all members and releases the OS resource exactly once,
/// and a cleaned tracker rejects further `add` calls.
pub trait ProcessTracker: Send + Sync + std::fmt::Debug {
    /// Name the group was created with
    fn name(&self) -> &str;

    /// Register a running process with the group
    fn add(&self, info: &ProcessInfo) -> Result<()>;

    /// Signal every member and release the grouping resource.
    ///
    /// Calling this on an already cleaned tracker is a no-op.
    fn cleanup(&self) -> Result<()>;

    /// Diagnostic snapshot of the processes the group believes are live
    fn members(&self) -> Result<Membership>;

    /// Whether `cleanup` has already run
    fn is_cleaned(&self) -> bool;

    /// Adjust a command before it is spawned so the child starts inside the group.
    fn prepare_command(&self, _command: &mut Command) {}
}

/// Result of the diagnostic membership query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Number of live members reported by the OS
    pub count: usize,
    /// Member PIDs, sorted ascending
    pub pids: Vec<u32>,
}

impl Membership {
    pub fn from_pids(mut pids: Vec<u32>) -> Self {
        pids.sort_unstable();
        pids.dedup();
        Self {
            count: pids.len(),
            pids,
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.binary_search(&pid).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Lifecycle of a tracker's grouping resource.
///
/// The resource lives inside `Active`, so a cleaned tracker cannot hold one.
#[derive(Debug)]
pub(crate) enum GroupState<R> {
    Active(R),
    Cleaned,
}

impl<R> GroupState<R> {
    pub(crate) fn active(&self, name: &str) -> Result<&R> {
        match self {
            GroupState::Active(resource) => Ok(resource),
            GroupState::Cleaned => Err(TrackerError::AlreadyCleaned(name.to_string())),
        }
    }

    pub(crate) fn active_mut(&mut self, name: &str) -> Result<&mut R> {
        match self {
            GroupState::Active(resource) => Ok(resource),
            GroupState::Cleaned => Err(TrackerError::AlreadyCleaned(name.to_string())),
        }
    }

    /// Move to `Cleaned`, handing back the resource if this call did the transition
    pub(crate) fn take(&mut self) -> Option<R> {
        match std::mem::replace(self, GroupState::Cleaned) {
            GroupState::Active(resource) => Some(resource),
            GroupState::Cleaned => None,
        }
    }

    pub(crate) fn is_cleaned(&self) -> bool {
        matches!(self, GroupState::Cleaned)
    }
}

/// Check that a group name is usable as an OS object name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TrackerError::InvalidName(
            "name must not be empty".to_string(),
        ));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(TrackerError::InvalidName(format!(
            "name exceeds {} bytes: {}",
            MAX_NAME_LEN, name
        )));
    }

    if name == "." || name == ".." {
        return Err(TrackerError::InvalidName(format!("reserved name: {}", name)));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(TrackerError::InvalidName(format!(
            "invalid character {:?} in {}",
            c, name
        )));
    }

    Ok(())
}

/// Create a tracker for the host platform using configuration from the environment
pub fn new_process_tracker(name: &str) -> Result<Box<dyn ProcessTracker>> {
    let config = TrackerConfig::from_env()?;
    new_process_tracker_with_config(name, &config)
}

/// Create a tracker for the host platform.
///
/// Windows gets a job object. Linux gets a cgroup when `cgroup_root` is
/// configured and usable, otherwise a process group, as do other Unix hosts.
pub fn new_process_tracker_with_config(
    name: &str,
    config: &TrackerConfig,
) -> Result<Box<dyn ProcessTracker>> {
    validate_name(name)?;
    config.validate()?;

    #[cfg(windows)]
    {
        Ok(Box::new(JobObjectTracker::new(name, config)?))
    }

    #[cfg(unix)]
    {
        #[cfg(target_os = "linux")]
        {
            if let Some(ref root) = config.cgroup_root {
                match CgroupTracker::new(name, root, config) {
                    Ok(tracker) => return Ok(Box::new(tracker)),
                    Err(e) => tracing::warn!(
                        "cgroup tracking unavailable for {}, falling back to a process group: {}",
                        name,
                        e
                    ),
                }
            }
        }

        Ok(Box::new(ProcessGroupTracker::new(name, config)?))
    }
}

#[cfg(unix)]
pub(crate) fn parse_signal(signal_name: &str) -> Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;

    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(TrackerError::ConfigValidationError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("job-7").is_ok());
        assert!(validate_name("foo_1.2-abc").is_ok());

        assert!(matches!(validate_name(""), Err(TrackerError::InvalidName(_))));
        assert!(matches!(validate_name(".."), Err(TrackerError::InvalidName(_))));
        assert!(matches!(
            validate_name("a/b"),
            Err(TrackerError::InvalidName(_))
        ));
        assert!(matches!(
            validate_name("with space"),
            Err(TrackerError::InvalidName(_))
        ));
        assert!(matches!(
            validate_name(&"x".repeat(129)),
            Err(TrackerError::InvalidName(_))
        ));
    }

    #[test]
    fn test_membership_from_pids() {
        let membership = Membership::from_pids(vec![30, 10, 20, 10]);
        assert_eq!(membership.count, 3);
        assert_eq!(membership.pids, vec![10, 20, 30]);
        assert!(membership.contains(20));
        assert!(!membership.contains(40));
        assert!(Membership::default().is_empty());
    }

    #[test]
    fn test_group_state_transitions() {
        let mut state = GroupState::Active(5u32);
        assert_eq!(*state.active("g").unwrap(), 5);
        *state.active_mut("g").unwrap() += 1;

        assert_eq!(state.take(), Some(6));
        assert!(state.is_cleaned());
        assert_eq!(state.take(), None);
        assert!(matches!(
            state.active("g"),
            Err(TrackerError::AlreadyCleaned(_))
        ));
    }

    #[test]
    fn test_factory_rejects_invalid_name() {
        let result = new_process_tracker_with_config("", &TrackerConfig::default());
        assert!(matches!(result, Err(TrackerError::InvalidName(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_signal() {
        use nix::sys::signal::Signal;

        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert!(parse_signal("SIGBOGUS").is_err());
    }
}
