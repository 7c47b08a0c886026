// Process module - snapshots, liveness, and the spawning helper

mod info;
pub mod liveness;
pub mod spawner;

pub use info::ProcessInfo;
pub use liveness::ProcessTable;
pub use spawner::{spawn_process, SpawnOptions, SpawnedProcess};
