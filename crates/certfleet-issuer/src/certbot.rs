//! certbot subprocess invocation

use async_trait::async_trait;
use certfleet_config::CertbotConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::{classify, validate_domain, CertificateIssuer, IssuanceOutcome, IssuerError};

/// Issues certificates by running `certbot certonly` with a DNS-01 plugin
#[derive(Debug, Clone)]
pub struct CertbotIssuer {
    config: CertbotConfig,
    email: String,
    timeout: Duration,
}

impl CertbotIssuer {
    pub fn new(config: CertbotConfig, email: impl Into<String>, timeout: Duration) -> Self {
        Self {
            config,
            email: email.into(),
            timeout,
        }
    }

    /// Arguments passed after the configured program and its leading arguments
    pub fn certonly_args(&self, domain: &str) -> Vec<String> {
        let plugin = &self.config.dns_plugin;
        vec![
            "certonly".to_string(),
            format!("--dns-{}", plugin),
            format!("--dns-{}-credentials", plugin),
            self.config.credentials_file.display().to_string(),
            "-m".to_string(),
            self.email.clone(),
            "--agree-tos".to_string(),
            "--no-eff-email".to_string(),
            "-n".to_string(),
            "-d".to_string(),
            domain.to_string(),
        ]
    }

    fn command(&self, domain: &str) -> (String, Command) {
        // Validated non-empty at config load
        let (program, leading) = match self.config.command.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => ("certbot".to_string(), Vec::new()),
        };

        let mut command = Command::new(&program);
        command
            .args(leading)
            .args(self.certonly_args(domain))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        (program, command)
    }
}

#[async_trait]
impl CertificateIssuer for CertbotIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuanceOutcome, IssuerError> {
        validate_domain(domain)?;

        info!("Issuing certificate for {}", domain);

        let (program, mut command) = self.command(domain);
        debug!("Running {:?}", command.as_std());

        // The child is killed when the timed out future is dropped
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| IssuerError::Timeout(self.timeout))?
            .map_err(|source| IssuerError::Spawn { program, source })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let outcome = classify(output.status.code(), &stdout, &stderr);
        match &outcome {
            IssuanceOutcome::Issued => {
                info!("Certificate for {} issued", domain);
            }
            IssuanceOutcome::NotDue => {
                info!("Certificate for {} is not yet due for renewal", domain);
            }
            IssuanceOutcome::Failed {
                exit_code,
                stdout,
                stderr,
            } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none (terminated by signal)".to_string());
                error!(
                    "Failed to issue certificate for {} with code: {}\nstdout:\n{}\nstderr:\n{}",
                    domain, code, stdout, stderr
                );
            }
        }

        Ok(outcome)
    }
}
