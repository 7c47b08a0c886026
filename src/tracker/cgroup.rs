use super::{parse_signal, validate_name, GroupState, Membership, ProcessTracker};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::process::liveness::ProcessTable;
use crate::process::ProcessInfo;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tracks processes in a dedicated cgroup v2 directory (Linux only).
///
/// Descendants of a member are placed in the same cgroup by the kernel, so
/// nothing can slip out of the group without privileges.
#[derive(Debug)]
pub struct CgroupTracker {
    name: String,
    signal: Signal,
    release_retries: u32,
    release_retry_interval: Duration,
    state: Mutex<GroupState<CgroupDir>>,
}

#[derive(Debug)]
struct CgroupDir {
    path: PathBuf,
}

impl CgroupDir {
    fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    fn read_procs(&self) -> std::io::Result<Vec<u32>> {
        let contents = fs::read_to_string(self.procs_file())?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }
}

impl CgroupTracker {
    /// Check if `root` is a cgroup v2 hierarchy
    pub fn is_cgroups_v2_available(root: &Path) -> bool {
        root.join("cgroup.controllers").exists()
    }

    /// Create the cgroup `root/name`
    pub fn new(name: &str, root: &Path, config: &TrackerConfig) -> Result<Self> {
        validate_name(name)?;
        let signal = parse_signal(&config.kill_signal)?;

        if !Self::is_cgroups_v2_available(root) {
            return Err(TrackerError::ResourceCreation(
                name.to_string(),
                format!("cgroups v2 not available at {}", root.display()),
            ));
        }

        let path = root.join(name);
        fs::create_dir(&path).map_err(|e| {
            let reason = if e.kind() == ErrorKind::AlreadyExists {
                format!("cgroup {} already exists", path.display())
            } else {
                format!(
                    "Failed to create cgroup {}: {}. You may need root privileges.",
                    path.display(),
                    e
                )
            };
            TrackerError::ResourceCreation(name.to_string(), reason)
        })?;

        info!("Created cgroup {} for tracker {}", path.display(), name);

        Ok(Self {
            name: name.to_string(),
            signal,
            release_retries: config.release_retries,
            release_retry_interval: config.release_retry_interval(),
            state: Mutex::new(GroupState::Active(CgroupDir { path })),
        })
    }

    /// Directory backing this tracker, or `None` once cleaned up
    pub fn path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .active(&self.name)
            .ok()
            .map(|dir| dir.path.clone())
    }

    fn teardown(&self, dir: CgroupDir) -> Result<()> {
        let mut failures = Vec::new();

        info!("Cleaning up cgroup {} for tracker {}", dir.path.display(), self.name);

        let kill_file = dir.path.join("cgroup.kill");
        let killed_by_kernel = self.signal == Signal::SIGKILL
            && kill_file.exists()
            && match fs::write(&kill_file, "1") {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to write {}: {}", kill_file.display(), e);
                    false
                }
            };

        if !killed_by_kernel {
            match dir.read_procs() {
                Ok(pids) => {
                    for pid in pids {
                        match kill(Pid::from_raw(pid as i32), self.signal) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => {
                                warn!("Failed to signal process {} in {}: {}", pid, self.name, e);
                                failures.push(format!("pid {}: {}", pid, e));
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("read {}: {}", dir.procs_file().display(), e)),
            }
        }

        // Killed tasks leave the cgroup asynchronously; rmdir reports EBUSY until they do.
        let mut attempt = 0;
        loop {
            match fs::remove_dir(&dir.path) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) if attempt < self.release_retries => {
                    debug!("cgroup {} not yet empty: {}", dir.path.display(), e);
                    attempt += 1;
                    std::thread::sleep(self.release_retry_interval);
                }
                Err(e) => {
                    failures.push(format!("rmdir {}: {}", dir.path.display(), e));
                    break;
                }
            }
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

impl ProcessTracker for CgroupTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, info: &ProcessInfo) -> Result<()> {
        let state = self.state.lock();
        let dir = state.active(&self.name)?;

        if info.is_complete() || !ProcessTable::new().is_alive(info.pid) {
            return Err(TrackerError::process_gone(&self.name, info.pid));
        }

        fs::write(dir.procs_file(), info.pid.to_string()).map_err(|e| {
            if e.raw_os_error() == Some(Errno::ESRCH as i32) {
                TrackerError::process_gone(&self.name, info.pid)
            } else {
                TrackerError::assignment(&self.name, info.pid, e.to_string())
            }
        })?;

        debug!(
            "Added process {} to cgroup {}",
            info.pid,
            dir.path.display()
        );

        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.take() {
            Some(dir) => self.teardown(dir),
            None => {
                debug!("Tracker {} already cleaned up", self.name);
                Ok(())
            }
        }
    }

    fn members(&self) -> Result<Membership> {
        let state = self.state.lock();
        let dir = state.active(&self.name)?;
        Ok(Membership::from_pids(dir.read_procs()?))
    }

    fn is_cleaned(&self) -> bool {
        self.state.lock().is_cleaned()
    }
}

impl Drop for CgroupTracker {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to clean up tracker {} on drop: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Child, Command, Stdio};
    use tempfile::TempDir;

    fn spawn_sleeper() -> Child {
        Command::new("/bin/sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn teardown_failures(err: TrackerError) -> Vec<String> {
        match err {
            TrackerError::Teardown { failures, .. } => failures,
            other => panic!("Expected Teardown, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_root_without_cgroup_v2() {
        let temp_dir = TempDir::new().unwrap();
        let result = CgroupTracker::new("cg-missing", temp_dir.path(), &TrackerConfig::default());

        assert!(matches!(
            result,
            Err(TrackerError::ResourceCreation(_, _))
        ));
    }

    // A plain directory that looks like a cgroup v2 root, so the
    // bookkeeping can be exercised without privileges.
    fn fake_root() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        temp_dir
    }

    #[test]
    fn test_creates_and_releases_directory() {
        let root = fake_root();
        let tracker = CgroupTracker::new("cg-dir", root.path(), &TrackerConfig::default()).unwrap();

        let path = tracker.path().unwrap();
        assert!(path.is_dir());

        tracker.cleanup().unwrap();
        assert!(!path.exists());
        assert!(tracker.is_cleaned());
        assert!(tracker.path().is_none());

        // Second cleanup does not touch the filesystem
        tracker.cleanup().unwrap();
    }

    #[test]
    fn test_name_collision_is_creation_error() {
        let root = fake_root();
        fs::create_dir(root.path().join("cg-taken")).unwrap();

        let result = CgroupTracker::new("cg-taken", root.path(), &TrackerConfig::default());
        match result {
            Err(TrackerError::ResourceCreation(name, reason)) => {
                assert_eq!(name, "cg-taken");
                assert!(reason.contains("already exists"));
            }
            other => panic!("Expected ResourceCreation, got {:?}", other),
        }
    }

    #[test]
    fn test_members_reads_procs_file() {
        let root = fake_root();
        let tracker = CgroupTracker::new("cg-procs", root.path(), &TrackerConfig::default()).unwrap();
        let path = tracker.path().unwrap();

        assert!(matches!(tracker.members(), Err(TrackerError::Io(_))));

        fs::write(path.join("cgroup.procs"), "12\n7\n\n").unwrap();
        let membership = tracker.members().unwrap();
        assert_eq!(membership.count, 2);
        assert_eq!(membership.pids, vec![7, 12]);

        // The fake procs file keeps rmdir from succeeding
        fs::remove_file(path.join("cgroup.procs")).unwrap();
        tracker.cleanup().unwrap();
    }

    #[test]
    fn test_add_after_cleanup_fails() {
        let root = fake_root();
        let tracker = CgroupTracker::new("cg-late", root.path(), &TrackerConfig::default()).unwrap();
        tracker.cleanup().unwrap();

        let result = tracker.add(&ProcessInfo::new(std::process::id()));
        assert!(matches!(result, Err(TrackerError::AlreadyCleaned(_))));
    }

    #[test]
    fn test_add_exited_process_is_gone() {
        let root = fake_root();
        let tracker = CgroupTracker::new("cg-exited", root.path(), &TrackerConfig::default()).unwrap();

        let err = tracker.add(&ProcessInfo::exited(4242, 0)).unwrap_err();
        assert!(err.is_process_gone());

        tracker.cleanup().unwrap();
    }

    #[test]
    fn test_release_failure_is_reported_and_tracker_unusable() {
        let root = fake_root();
        let config = TrackerConfig {
            release_retries: 2,
            release_retry_interval_ms: 1,
            ..TrackerConfig::default()
        };
        let tracker = CgroupTracker::new("cg-busy", root.path(), &config).unwrap();
        let path = tracker.path().unwrap();
        fs::write(path.join("leftover"), "x").unwrap();

        let err = tracker.cleanup().unwrap_err();
        assert!(matches!(err, TrackerError::Teardown { .. }));
        assert!(tracker.is_cleaned());
        assert!(tracker.cleanup().is_ok());

        fs::remove_file(path.join("leftover")).unwrap();
        fs::remove_dir(&path).unwrap();
    }

    #[test]
    fn test_cleanup_signals_each_member_then_retries_release() {
        let root = fake_root();
        let config = TrackerConfig {
            kill_signal: "SIGTERM".to_string(),
            release_retries: 200,
            release_retry_interval_ms: 5,
            ..TrackerConfig::default()
        };
        let tracker = CgroupTracker::new("cg-sigterm", root.path(), &config).unwrap();
        let path = tracker.path().unwrap();

        let mut child = spawn_sleeper();
        let procs = path.join("cgroup.procs");
        fs::write(&procs, format!("{}\n", child.id())).unwrap();

        // The directory only becomes removable once the procs file goes away
        let emptier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            fs::remove_file(procs).unwrap();
        });

        tracker.cleanup().unwrap();
        emptier.join().unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_tolerates_vanished_member() {
        let root = fake_root();
        let config = TrackerConfig {
            kill_signal: "SIGTERM".to_string(),
            release_retries: 0,
            ..TrackerConfig::default()
        };
        let tracker = CgroupTracker::new("cg-vanished", root.path(), &config).unwrap();
        let path = tracker.path().unwrap();
        fs::write(path.join("cgroup.procs"), "999999999\n").unwrap();

        // Only the release fails; the missing process is not a failure
        let failures = teardown_failures(tracker.cleanup().unwrap_err());
        assert_eq!(failures.len(), 1, "{:?}", failures);
        assert!(failures[0].starts_with("rmdir"), "{:?}", failures);

        fs::remove_file(path.join("cgroup.procs")).unwrap();
        fs::remove_dir(&path).unwrap();
    }

    #[test]
    fn test_sigkill_uses_cgroup_kill_file() {
        let root = fake_root();
        let config = TrackerConfig {
            release_retries: 0,
            ..TrackerConfig::default()
        };
        let tracker = CgroupTracker::new("cg-kill", root.path(), &config).unwrap();
        let path = tracker.path().unwrap();

        let mut child = spawn_sleeper();
        fs::write(path.join("cgroup.kill"), "").unwrap();
        fs::write(path.join("cgroup.procs"), format!("{}\n", child.id())).unwrap();

        let failures = teardown_failures(tracker.cleanup().unwrap_err());
        assert_eq!(failures.len(), 1, "{:?}", failures);
        assert!(failures[0].starts_with("rmdir"), "{:?}", failures);

        assert_eq!(fs::read_to_string(path.join("cgroup.kill")).unwrap(), "1");
        // The kernel does the killing, so the member is not signaled directly
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
        fs::remove_file(path.join("cgroup.kill")).unwrap();
        fs::remove_file(path.join("cgroup.procs")).unwrap();
        fs::remove_dir(&path).unwrap();
    }
}
