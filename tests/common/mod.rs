// Shared helpers for tracker integration tests

#![allow(dead_code)]

use proctrack::process::{spawn_process, SpawnOptions, SpawnedProcess};
use proctrack::ProcessTracker;
use std::time::Duration;

/// Comma-separated environment variable names whose presence skips the
/// platform tests, for hosts that already run everything inside their own group.
pub const SKIP_ENV: &str = "PROCTRACK_SKIP_ENV";

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn should_skip() -> bool {
    skip_requested(std::env::var(SKIP_ENV).ok().as_deref(), |key| {
        std::env::var_os(key).is_some()
    })
}

pub fn skip_requested<F>(names: Option<&str>, is_set: F) -> bool
where
    F: Fn(&str) -> bool,
{
    names
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .any(|name| is_set(name))
}

pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

pub async fn spawn_sleeper(tracker: Option<&dyn ProcessTracker>) -> SpawnedProcess {
    let options = SpawnOptions::new("sleeper", "/bin/sleep").arg("30");
    spawn_process(&options, tracker).await.unwrap()
}

/// Wait for a child that should already have been signaled
pub async fn wait_terminated(spawned: &mut SpawnedProcess) -> std::process::ExitStatus {
    tokio::time::timeout(WAIT_TIMEOUT, spawned.child.wait())
        .await
        .expect("process was not terminated")
        .unwrap()
}
