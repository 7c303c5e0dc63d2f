//! Fleet renewal loop
//!
//! Each cycle walks the configured hosts in order and runs the pipeline
//! issue → distribute → post commands for each of them, stopping a host's
//! pipeline at the first stage that does not succeed. Hosts are isolated
//! from each other: nothing that happens to one host stops the others.

pub mod orchestrator;
pub mod report;

pub use orchestrator::Orchestrator;
pub use report::{CycleReport, HostReport};

use certfleet_remote::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a remote stage as seen from the async side
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Stage did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Stage worker failed: {0}")]
    Worker(String),
}
