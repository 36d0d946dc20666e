//! Gradegrid commander library.
//!
//! Dispatches student submissions to a pool of workers, tracks worker
//! liveness through heartbeats, and persists returned transcripts.

pub mod commander;
pub mod liveness;
pub mod registry;

pub use commander::{Commander, Hook, Hooks};
pub use liveness::{current_time, LivenessTracker};
pub use registry::{AssignmentRegistry, RegistryCounts, RETRY_CAP};

#[derive(clap::Parser, Debug)]
#[command(
    name = "gradegrid-commander",
    about = "Dispatch grading assignments to gradegrid workers"
)]
pub struct CommanderArgs {
    /// Path to the commander configuration file.
    #[arg(long, default_value = "commander.conf")]
    pub config: std::path::PathBuf,
}
