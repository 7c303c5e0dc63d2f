//! Certificate upload

use std::path::{Path, PathBuf};
use tracing::info;

use crate::{with_session, Connector, RemoteError, RetryPolicy, SshTarget};

const CHAIN_MODE: i32 = 0o644;
const KEY_MODE: i32 = 0o600;

/// The two artifacts certbot leaves in a domain's live directory
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateFiles {
    pub hostname: String,
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

impl CertificateFiles {
    /// Files under `cert_dir`, usually `/etc/letsencrypt/live/<hostname>`
    pub fn new(hostname: &str, cert_dir: &Path) -> Self {
        Self {
            hostname: hostname.to_string(),
            fullchain: cert_dir.join("fullchain.pem"),
            privkey: cert_dir.join("privkey.pem"),
        }
    }

    /// (local path, remote name, mode) for each upload, chain first
    pub fn uploads(&self) -> [(&Path, String, i32); 2] {
        [
            (
                self.fullchain.as_path(),
                format!("{}-fullchain.pem", self.hostname),
                CHAIN_MODE,
            ),
            (
                self.privkey.as_path(),
                format!("{}-privkey.pem", self.hostname),
                KEY_MODE,
            ),
        ]
    }
}

/// Upload both certificate files into the remote login directory
///
/// The session is closed before returning on every path. The first failed
/// upload stops the transfer and is returned.
pub fn distribute(
    connector: &dyn Connector,
    target: &SshTarget,
    retry: &RetryPolicy,
    files: &CertificateFiles,
) -> Result<(), RemoteError> {
    info!("Copying ssl certs to {} via scp", target.hostname);

    with_session(connector, target, retry, |session| {
        for (local, remote, mode) in files.uploads() {
            session.upload(local, &remote, mode)?;
        }
        Ok(())
    })?;

    info!("Ssl certs successfully transferred to {}", target.hostname);
    Ok(())
}
