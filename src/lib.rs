// Library exports for the proctrack process tracker

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod tracker;

pub use config::TrackerConfig;
pub use error::{Result, TrackerError};
pub use process::ProcessInfo;
pub use tracker::{new_process_tracker, new_process_tracker_with_config, Membership, ProcessTracker};
