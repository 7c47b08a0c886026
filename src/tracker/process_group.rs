use super::{parse_signal, validate_name, GroupState, Membership, ProcessTracker, GROUP_MARKER_ENV};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::process::liveness::ProcessTable;
use crate::process::ProcessInfo;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, setpgid, Pid};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Tracks processes through a POSIX process group.
///
/// The group is anchored by a child that exits immediately and is left
/// unreaped until cleanup, which keeps the group ID valid for the whole
/// lifetime of the tracker. Processes spawned through `prepare_command`
/// start inside the group; anything else is moved in with `setpgid` when
/// the kernel allows it and signaled individually otherwise.
#[derive(Debug)]
pub struct ProcessGroupTracker {
    name: String,
    signal: Signal,
    env_marker: bool,
    /// Marker value unique to this instance: `<name>:<pgid>`
    marker: String,
    state: Mutex<GroupState<ProcessGroup>>,
}

struct ProcessGroup {
    pgid: Pid,
    anchor: Child,
    members: BTreeSet<u32>,
    /// Members the kernel refused to move into the group
    outside: BTreeSet<u32>,
    table: ProcessTable,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("pgid", &self.pgid)
            .field("members", &self.members)
            .field("outside", &self.outside)
            .finish()
    }
}

impl ProcessGroupTracker {
    /// Create a new process group for `name`
    pub fn new(name: &str, config: &TrackerConfig) -> Result<Self> {
        validate_name(name)?;
        let signal = parse_signal(&config.kill_signal)?;

        let anchor = std::process::Command::new("true")
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TrackerError::ResourceCreation(
                    name.to_string(),
                    format!("Failed to spawn process group anchor: {}", e),
                )
            })?;

        let pgid = Pid::from_raw(anchor.id() as i32);
        info!("Created process group {} for tracker {}", pgid, name);

        // Names are not unique across trackers; the pgid is, while the anchor lives.
        let marker = format!("{}:{}", name, pgid);

        Ok(Self {
            name: name.to_string(),
            signal,
            env_marker: config.env_marker,
            marker,
            state: Mutex::new(GroupState::Active(ProcessGroup {
                pgid,
                anchor,
                members: BTreeSet::new(),
                outside: BTreeSet::new(),
                table: ProcessTable::new(),
            })),
        })
    }

    /// Process group ID, or `None` once cleaned up
    pub fn pgid(&self) -> Option<i32> {
        self.state
            .lock()
            .active(&self.name)
            .ok()
            .map(|group| group.pgid.as_raw())
    }

    /// Value of `PROCTRACK_GROUP` stamped on children spawned through this tracker
    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn teardown(&self, mut group: ProcessGroup) -> Result<()> {
        let mut failures = Vec::new();

        info!(
            "Cleaning up process group {} for tracker {} ({} members)",
            group.pgid,
            self.name,
            group.members.len()
        );

        match killpg(group.pgid, self.signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => failures.push(format!("killpg {}: {}", group.pgid, e)),
        }

        let mut stragglers = group.outside.clone();
        if self.env_marker {
            stragglers.extend(group.table.marked_with(GROUP_MARKER_ENV, &self.marker));
        }

        for pid in stragglers {
            match kill(Pid::from_raw(pid as i32), self.signal) {
                Ok(()) | Err(Errno::ESRCH) => {
                    debug!("Signaled process {} outside group {}", pid, group.pgid)
                }
                Err(e) => {
                    warn!("Failed to signal process {} in {}: {}", pid, self.name, e);
                    failures.push(format!("pid {}: {}", pid, e));
                }
            }
        }

        // The anchor is already a zombie; reaping it releases the group ID.
        if let Err(e) = group.anchor.kill() {
            failures.push(format!("anchor {}: {}", group.pgid, e));
        }
        if let Err(e) = group.anchor.wait() {
            failures.push(format!("reap anchor {}: {}", group.pgid, e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TrackerError::Teardown {
                group: self.name.clone(),
                failures,
            })
        }
    }
}

impl ProcessTracker for ProcessGroupTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, info: &ProcessInfo) -> Result<()> {
        let mut state = self.state.lock();
        let group = state.active_mut(&self.name)?;

        if info.is_complete() || !group.table.is_alive(info.pid) {
            return Err(TrackerError::process_gone(&self.name, info.pid));
        }

        if group.members.contains(&info.pid) {
            return Ok(());
        }

        let pid = Pid::from_raw(info.pid as i32);
        match getpgid(Some(pid)) {
            Ok(current) if current == group.pgid => {}
            Ok(_) => {
                if let Err(e) = setpgid(pid, group.pgid) {
                    debug!(
                        "Process {} cannot join group {} ({}), tracking it individually",
                        pid, group.pgid, e
                    );
                    group.outside.insert(info.pid);
                }
            }
            Err(Errno::ESRCH) => return Err(TrackerError::process_gone(&self.name, info.pid)),
            Err(e) => return Err(TrackerError::assignment(&self.name, info.pid, e.to_string())),
        }

        group.members.insert(info.pid);
        debug!("Added process {} to tracker {}", pid, self.name);

        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.take() {
            Some(group) => self.teardown(group),
            None => {
                debug!("Tracker {} already cleaned up", self.name);
                Ok(())
            }
        }
    }

    fn members(&self) -> Result<Membership> {
        let mut state = self.state.lock();
        let group = state.active_mut(&self.name)?;
        let pids: Vec<u32> = group.members.iter().copied().collect();
        Ok(Membership::from_pids(group.table.filter_alive(pids)))
    }

    fn is_cleaned(&self) -> bool {
        self.state.lock().is_cleaned()
    }

    fn prepare_command(&self, command: &mut Command) {
        if let Ok(group) = self.state.lock().active(&self.name) {
            command.process_group(group.pgid.as_raw());
            if self.env_marker {
                command.env(GROUP_MARKER_ENV, &self.marker);
            }
        }
    }
}

impl Drop for ProcessGroupTracker {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to clean up tracker {} on drop: {}", self.name, e);
        }
    }
}
