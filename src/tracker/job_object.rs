use super::{validate_name, GroupState, Membership, ProcessTracker};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::process::liveness::ProcessTable;
use crate::process::ProcessInfo;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::io;
use tracing::{debug, info, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_INVALID_PARAMETER, HANDLE,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectBasicProcessIdList,
    JobObjectExtendedLimitInformation, QueryInformationJobObject, SetInformationJobObject,
    TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

/// Upper bound on PIDs returned by a single membership query
const MAX_LISTED_PROCESSES: usize = 1024;

/// Tracks processes in a named Windows job object.
///
/// Assignment is one-way: a process stays in the job until it exits or the
/// job is terminated.
#[derive(Debug)]
pub struct JobObjectTracker {
    name: String,
    exit_code: u32,
    state: Mutex<GroupState<JobHandle>>,
}

#[derive(Debug)]
struct JobHandle(HANDLE);

// The handle is only used under the tracker lock.
unsafe impl Send for JobHandle {}
unsafe impl Sync for JobHandle {}

impl JobHandle {
    fn close(self) -> io::Result<()> {
        let handle = self.0;
        std::mem::forget(self);
        if unsafe { CloseHandle(handle) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Layout-compatible with JOBOBJECT_BASIC_PROCESS_ID_LIST plus room for the list
#[repr(C)]
struct ProcessIdList {
    number_of_assigned_processes: u32,
    number_of_process_ids_in_list: u32,
    process_id_list: [usize; MAX_LISTED_PROCESSES],
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

impl JobObjectTracker {
    /// Create the job object `name`
    pub fn new(name: &str, config: &TrackerConfig) -> Result<Self> {
        validate_name(name)?;

        let wide_name = to_wide(name);
        let handle = unsafe { CreateJobObjectW(std::ptr::null(), wide_name.as_ptr()) };
        if handle.is_null() {
            return Err(TrackerError::ResourceCreation(
                name.to_string(),
                format!("CreateJobObjectW failed: {}", io::Error::last_os_error()),
            ));
        }
        let job = JobHandle(handle);

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            return Err(TrackerError::ResourceCreation(
                name.to_string(),
                format!("job object {} already exists", name),
            ));
        }

        // Closing the last handle must never leave members running.
        let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let ok = unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                (&limits as *const JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast::<c_void>(),
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if ok == 0 {
            return Err(TrackerError::ResourceCreation(
                name.to_string(),
                format!("SetInformationJobObject failed: {}", io::Error::last_os_error()),
            ));
        }

        info!("Created job object for tracker {}", name);

        Ok(Self {
            name: name.to_string(),
            exit_code: config.exit_code,
            state: Mutex::new(GroupState::Active(job)),
        })
    }

    fn teardown(&self, job: JobHandle) -> Result<()> {
        let mut failures = Vec::new();

        info!("Terminating job object for tracker {}", self.name);

        if unsafe { TerminateJobObject(job.0, self.exit_code) } == 0 {
            let e = io::Error::last_os_error();
            warn!("Failed to terminate job {}: {}", self.name, e);
            failures.push(format!("TerminateJobObject: {}", e));
        }

        if let Err(e) = job.close() {
            failures.push(format!("CloseHandle: {}", e));
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

impl ProcessTracker for JobObjectTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, info: &ProcessInfo) -> Result<()> {
        let state = self.state.lock();
        let job = state.active(&self.name)?;

        if info.is_complete() || !ProcessTable::new().is_alive(info.pid) {
            return Err(TrackerError::process_gone(&self.name, info.pid));
        }

        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, info.pid) };
        if process.is_null() {
            if unsafe { GetLastError() } == ERROR_INVALID_PARAMETER {
                return Err(TrackerError::process_gone(&self.name, info.pid));
            }
            return Err(TrackerError::assignment(
                &self.name,
                info.pid,
                format!("OpenProcess failed: {}", io::Error::last_os_error()),
            ));
        }

        let assigned = unsafe { AssignProcessToJobObject(job.0, process) };
        let assign_error = io::Error::last_os_error();
        unsafe {
            CloseHandle(process);
        }

        if assigned == 0 {
            return Err(TrackerError::assignment(
                &self.name,
                info.pid,
                format!("AssignProcessToJobObject failed: {}", assign_error),
            ));
        }

        debug!("Assigned process {} to job {}", info.pid, self.name);
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.take() {
            Some(job) => self.teardown(job),
            None => {
                debug!("Tracker {} already cleaned up", self.name);
                Ok(())
            }
        }
    }

    fn members(&self) -> Result<Membership> {
        let state = self.state.lock();
        let job = state.active(&self.name)?;

        let mut list: Box<ProcessIdList> = Box::new(ProcessIdList {
            number_of_assigned_processes: 0,
            number_of_process_ids_in_list: 0,
            process_id_list: [0; MAX_LISTED_PROCESSES],
        });

        let ok = unsafe {
            QueryInformationJobObject(
                job.0,
                JobObjectBasicProcessIdList,
                (&mut *list as *mut ProcessIdList).cast::<c_void>(),
                std::mem::size_of::<ProcessIdList>() as u32,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(TrackerError::Io(io::Error::last_os_error()));
        }

        let listed = (list.number_of_process_ids_in_list as usize).min(MAX_LISTED_PROCESSES);
        let pids: Vec<u32> = list.process_id_list[..listed]
            .iter()
            .map(|pid| *pid as u32)
            .collect();

        let mut membership = Membership::from_pids(pids);
        membership.count = list.number_of_assigned_processes as usize;
        Ok(membership)
    }

    fn is_cleaned(&self) -> bool {
        self.state.lock().is_cleaned()
    }
}

impl Drop for JobObjectTracker {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to clean up tracker {} on drop: {}", self.name, e);
        }
    }
}
