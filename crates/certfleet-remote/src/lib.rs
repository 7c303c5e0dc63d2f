//! Remote shell access to fleet hosts
//!
//! Sessions are short-lived: every stage opens its own session through a
//! [`Connector`] and the session is closed when the stage's scope ends,
//! whether the stage succeeded or not. All calls here are blocking; async
//! callers run them on a blocking thread.

pub mod distribute;
pub mod execute;
pub mod ssh;

pub use distribute::{distribute, CertificateFiles};
pub use execute::{execute_commands, CommandFailure};
pub use ssh::SshConnector;

use certfleet_config::{HostConfig, SystemConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Remote shell errors
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("Authentication as '{user}' failed: {reason}")]
    Auth { user: String, reason: String },

    #[error("Failed to upload {path:?}: {reason}")]
    Transfer { path: PathBuf, reason: String },

    #[error("Failed to run '{command}': {reason}")]
    Exec { command: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ssh2::Error> for RemoteError {
    fn from(e: ssh2::Error) -> Self {
        RemoteError::Ssh(e.to_string())
    }
}

/// Where and how to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub keyfile: PathBuf,
    /// Bounds TCP connect and every blocking SSH call outside commands
    pub timeout: Duration,
    /// Bounds a single remote command, which may stay silent for a long time
    pub command_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: &HostConfig, system: &SystemConfig) -> Self {
        Self {
            hostname: host.hostname.clone(),
            port: host.ssh_port,
            user: host.ssh_user.clone(),
            keyfile: system.ssh_keyfile.clone(),
            timeout: system.ssh_timeout(),
            command_timeout: system.command_timeout(),
        }
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An open, authenticated session to one host
#[cfg_attr(test, mockall::automock)]
pub trait RemoteSession: Send {
    /// Copy a local file to `remote` (relative paths land in the login directory)
    fn upload(&mut self, local: &Path, remote: &str, mode: i32) -> Result<(), RemoteError>;

    /// Run `command` to completion and capture its output
    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Tear down the session
    fn close(&mut self) -> Result<(), RemoteError>;
}

/// Opens sessions
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Bounded retry for session establishment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay before attempt number `attempt` (1-based); the first attempt has none
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Connect, retrying with exponential backoff
pub fn connect_with_retry(
    connector: &dyn Connector,
    target: &SshTarget,
    retry: &RetryPolicy,
) -> Result<Box<dyn RemoteSession>, RemoteError> {
    let mut attempt = 1;
    loop {
        let delay = retry.delay_before(attempt);
        if !delay.is_zero() {
            debug!(
                "[{}] Waiting {:?} before connection attempt {}",
                target.hostname, delay, attempt
            );
            std::thread::sleep(delay);
        }

        match connector.connect(target) {
            Ok(session) => return Ok(session),
            Err(e) if attempt < retry.attempts => {
                warn!(
                    "[{}] Connection attempt {}/{} failed: {}",
                    target.hostname, attempt, retry.attempts, e
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `stage` against a fresh session that is always closed afterwards
pub(crate) fn with_session<T>(
    connector: &dyn Connector,
    target: &SshTarget,
    retry: &RetryPolicy,
    stage: impl FnOnce(&mut dyn RemoteSession) -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let session = connect_with_retry(connector, target, retry)?;

    let hostname = target.hostname.clone();
    let mut session = scopeguard::guard(session, move |mut session| {
        if let Err(e) = session.close() {
            warn!("[{}] Failed to close SSH session: {}", hostname, e);
        }
    });

    stage(&mut **session)
}
