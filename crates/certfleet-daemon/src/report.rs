//! Per-host and per-cycle results

use certfleet_remote::CommandFailure;
use std::fmt;
use tracing::{info, warn};

/// Where a host's pipeline ended in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostReport {
    /// Certificate still fresh, nothing else ran
    NotDue,
    /// certbot failed, timed out or could not be started
    IssueFailed { error: String },
    /// Certificate issued but the upload failed
    TransferFailed { error: String },
    /// Upload succeeded but no command session could be opened
    CommandsFailed { error: String },
    /// All stages ran; individual commands may still have failed
    Completed { failed_commands: Vec<CommandFailure> },
    /// The pipeline panicked or was cancelled
    Aborted { error: String },
}

impl HostReport {
    /// Whether this host needs attention
    pub fn is_problem(&self) -> bool {
        match self {
            HostReport::NotDue => false,
            HostReport::Completed { failed_commands } => !failed_commands.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostReport::NotDue => write!(f, "not due for renewal"),
            HostReport::IssueFailed { error } => write!(f, "issuance failed: {}", error),
            HostReport::TransferFailed { error } => write!(f, "transfer failed: {}", error),
            HostReport::CommandsFailed { error } => write!(f, "commands not run: {}", error),
            HostReport::Completed { failed_commands } if failed_commands.is_empty() => {
                write!(f, "renewed and deployed")
            }
            HostReport::Completed { failed_commands } => write!(
                f,
                "deployed, {} command(s) failed",
                failed_commands.len()
            ),
            HostReport::Aborted { error } => write!(f, "aborted: {}", error),
        }
    }
}

/// Results of one pass over the fleet, in configuration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub hosts: Vec<(String, HostReport)>,
}

impl CycleReport {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            hosts: Vec::new(),
        }
    }

    pub fn report_for(&self, hostname: &str) -> Option<&HostReport> {
        self.hosts
            .iter()
            .find(|(name, _)| name == hostname)
            .map(|(_, report)| report)
    }

    pub fn deployed(&self) -> usize {
        self.hosts
            .iter()
            .filter(|(_, r)| matches!(r, HostReport::Completed { .. }))
            .count()
    }

    pub fn not_due(&self) -> usize {
        self.hosts
            .iter()
            .filter(|(_, r)| matches!(r, HostReport::NotDue))
            .count()
    }

    pub fn problems(&self) -> usize {
        self.hosts.iter().filter(|(_, r)| r.is_problem()).count()
    }

    pub fn has_problems(&self) -> bool {
        self.problems() > 0
    }

    /// One line per host plus a totals line
    pub fn log_summary(&self) {
        for (hostname, report) in &self.hosts {
            if report.is_problem() {
                warn!("[{}] {}", hostname, report);
            } else {
                info!("[{}] {}", hostname, report);
            }
        }

        info!(
            "Cycle {} finished: {} deployed, {} not due, {} with problems",
            self.cycle,
            self.deployed(),
            self.not_due(),
            self.problems()
        );
    }
}
