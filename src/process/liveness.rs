use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Read-only view of the host process table
pub struct ProcessTable {
    system: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Check if a process is still running.
    ///
    /// Zombies count as exited: they can still be signaled but will never run again.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        match self.system.process(sys_pid) {
            Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            None => false,
        }
    }

    /// Retain only the PIDs that are still running
    pub fn filter_alive(&mut self, pids: impl IntoIterator<Item = u32>) -> Vec<u32> {
        pids.into_iter().filter(|pid| self.is_alive(*pid)).collect()
    }

    /// List running processes whose environment contains `key=value`.
    ///
    /// The calling process is never included.
    pub fn marked_with(&mut self, key: &str, value: &str) -> Vec<u32> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let needle = format!("{}={}", key, value);
        let own_pid = std::process::id();

        let mut marked: Vec<u32> = self
            .system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter(|(_, process)| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .filter(|(_, process)| process.environ().iter().any(|entry| entry == needle.as_str()))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        marked.sort_unstable();
        marked
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
