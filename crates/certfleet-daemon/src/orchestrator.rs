//! Orchestrator: the renewal loop and the per-host pipeline

use certfleet_config::{Config, HostConfig};
use certfleet_issuer::{CertbotIssuer, CertificateIssuer, IssuanceOutcome};
use certfleet_remote::{
    distribute, execute_commands, CertificateFiles, Connector, RemoteError, RetryPolicy,
    SshConnector, SshTarget,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{CycleReport, HostReport, StageError};

/// Shared state of the pipeline, cloned into each host's task
struct Pipeline {
    config: Arc<Config>,
    issuer: Arc<dyn CertificateIssuer>,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
}

/// Drives issuance and deployment for the whole fleet
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
}

impl Orchestrator {
    /// Create an orchestrator with explicit collaborators
    pub fn new(
        config: Arc<Config>,
        issuer: Arc<dyn CertificateIssuer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let retry = RetryPolicy::new(config.system.connect_attempts);
        Self {
            pipeline: Arc::new(Pipeline {
                config,
                issuer,
                connector,
                retry,
            }),
        }
    }

    /// Wire certbot and libssh2 from the configuration
    pub fn from_config(config: Config) -> Self {
        let issuer = CertbotIssuer::new(
            config.certbot.clone(),
            config.system.email.clone(),
            config.system.issue_timeout(),
        );
        Self::new(Arc::new(config), Arc::new(issuer), Arc::new(SshConnector::new()))
    }

    /// Override the connection retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        if let Some(pipeline) = Arc::get_mut(&mut self.pipeline) {
            pipeline.retry = retry;
        }
        self
    }

    pub fn config(&self) -> &Config {
        &self.pipeline.config
    }

    /// Run cycles until `shutdown` resolves, or until `max_cycles` passes are done
    ///
    /// Sleeps the configured renewal delay between passes. Returns the number
    /// of completed passes.
    pub async fn run<F>(&self, max_cycles: Option<u64>, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let delay = self.pipeline.config.system.renew_delay();
        let mut completed = 0u64;

        info!(
            "🚀 Renewal loop starting for {} host(s), delay {}s",
            self.pipeline.config.hosts.len(),
            delay.as_secs()
        );

        loop {
            let cycle = completed + 1;

            tokio::select! {
                report = self.run_cycle(cycle) => {
                    completed += 1;
                    report.log_summary();
                }
                _ = &mut shutdown => {
                    warn!("Shutdown requested during cycle {}", cycle);
                    break;
                }
            }

            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }

            info!("Sleeping for {} seconds..", delay.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        info!("✅ Renewal loop stopped after {} cycle(s)", completed);
        completed
    }

    /// One pass over every configured host, strictly in order
    pub async fn run_cycle(&self, cycle: u64) -> CycleReport {
        let mut report = CycleReport::new(cycle);

        for host in &self.pipeline.config.hosts {
            let hostname = host.hostname.clone();

            // Each host runs in its own task so a panic stays contained
            let task = tokio::spawn(process_host(self.pipeline.clone(), host.clone()));

            let host_report = match task.await {
                Ok(host_report) => host_report,
                Err(e) if e.is_panic() => {
                    error!("[{}] Host pipeline panicked: {}", hostname, e);
                    HostReport::Aborted {
                        error: panic_message(e.into_panic()),
                    }
                }
                Err(e) => {
                    error!("[{}] Host pipeline cancelled: {}", hostname, e);
                    HostReport::Aborted {
                        error: e.to_string(),
                    }
                }
            };

            report.hosts.push((hostname, host_report));
        }

        report
    }
}

async fn process_host(pipeline: Arc<Pipeline>, host: HostConfig) -> HostReport {
    let hostname = host.hostname.clone();

    match pipeline.issuer.issue(&hostname).await {
        Ok(IssuanceOutcome::Issued) => {}
        Ok(IssuanceOutcome::NotDue) => return HostReport::NotDue,
        Ok(IssuanceOutcome::Failed { exit_code, .. }) => {
            return HostReport::IssueFailed {
                error: match exit_code {
                    Some(code) => format!("certbot exited with code {}", code),
                    None => "certbot was terminated by a signal".to_string(),
                },
            };
        }
        Err(e) => {
            error!("Failed to issue certificate for {}: {}", hostname, e);
            return HostReport::IssueFailed {
                error: e.to_string(),
            };
        }
    }

    let config = &pipeline.config;
    let stage_timeout = config.system.command_timeout();
    let target = SshTarget::new(&host, &config.system);

    let files = CertificateFiles::new(&hostname, &config.certbot.cert_dir(&hostname));
    let transfer = {
        let connector = pipeline.connector.clone();
        let target = target.clone();
        let retry = pipeline.retry;
        run_remote(stage_timeout, move || {
            distribute(connector.as_ref(), &target, &retry, &files)
        })
    };

    if let Err(e) = transfer.await {
        error!("Failed to copy certificates to {}: {}", hostname, e);
        return HostReport::TransferFailed {
            error: e.to_string(),
        };
    }

    let commands = host.post_commands;
    let execution = {
        let connector = pipeline.connector.clone();
        let retry = pipeline.retry;
        run_remote(stage_timeout, move || {
            execute_commands(connector.as_ref(), &target, &retry, &commands)
        })
    };

    match execution.await {
        Ok(failed_commands) => HostReport::Completed { failed_commands },
        Err(e) => {
            error!("Failed to run post upload commands on {}: {}", hostname, e);
            HostReport::CommandsFailed {
                error: e.to_string(),
            }
        }
    }
}

/// Run blocking remote work off the async threads, bounded by `timeout`
///
/// On timeout the worker thread is left to finish on its own; the SSH call
/// timeouts bound how long that takes and the session is still closed.
async fn run_remote<T, F>(timeout: Duration, work: F) -> Result<T, StageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result.map_err(StageError::from),
        Ok(Err(e)) => Err(StageError::Worker(e.to_string())),
        Err(_) => Err(StageError::Timeout(timeout)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
