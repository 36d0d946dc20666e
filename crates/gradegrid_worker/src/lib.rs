//! Gradegrid worker library.
//!
//! Subscribes to commander heartbeats, pulls one assignment at a time,
//! runs its command sequence under a wall-clock budget, and reports a
//! base64 transcript back.

pub mod executor;
pub mod netip;
pub mod worker;

pub use executor::{run_commands, Verdict};
pub use worker::Worker;

#[derive(clap::Parser, Debug)]
#[command(
    name = "gradegrid-worker",
    about = "Pull and execute gradegrid assignments"
)]
pub struct WorkerArgs {
    /// Path to the worker configuration file.
    #[arg(long, default_value = "worker.conf")]
    pub config: std::path::PathBuf,
}
