//! Classification of a finished certbot run

/// What certbot prints first when the existing certificate is still fresh
pub const NOT_DUE_PREFIX: &str = "Certificate not yet due for renewal";

/// Result of one issuance attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceOutcome {
    /// A new or renewed certificate is in the live directory
    Issued,
    /// The current certificate is not due for renewal yet
    NotDue,
    /// certbot exited unsuccessfully (`exit_code` is `None` when killed by a signal)
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl IssuanceOutcome {
    /// Whether the downstream transfer should run
    pub fn is_issued(&self) -> bool {
        matches!(self, Self::Issued)
    }
}

/// Turn an exit code and captured output into an outcome
///
/// A non-zero (or missing) exit code always wins. The not-due phrase only
/// counts when stdout starts with it.
pub fn classify(exit_code: Option<i32>, stdout: &str, stderr: &str) -> IssuanceOutcome {
    match exit_code {
        Some(0) if stdout.starts_with(NOT_DUE_PREFIX) => IssuanceOutcome::NotDue,
        Some(0) => IssuanceOutcome::Issued,
        _ => IssuanceOutcome::Failed {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        },
    }
}
