//! Orchestrator tests with scripted issuer and in-memory remote sessions

use async_trait::async_trait;
use certfleet_config::{CertbotConfig, Config, HostConfig, SystemConfig};
use certfleet_daemon::{HostReport, Orchestrator};
use certfleet_issuer::{CertificateIssuer, IssuanceOutcome, IssuerError};
use certfleet_remote::{
    CommandOutput, Connector, RemoteError, RemoteSession, RetryPolicy, SshTarget,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the fakes observed, in order
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Issue(String),
    Connect(String),
    Upload { host: String, remote: String },
    Exec { host: String, command: String },
    Close(String),
}

type Log = Arc<Mutex<Vec<Event>>>;

/// Per-host behavior of the fake issuer
#[derive(Clone)]
enum Script {
    Outcome(IssuanceOutcome),
    Timeout,
    Panic,
}

struct ScriptedIssuer {
    scripts: HashMap<String, Script>,
    log: Log,
}

#[async_trait]
impl CertificateIssuer for ScriptedIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuanceOutcome, IssuerError> {
        self.log.lock().unwrap().push(Event::Issue(domain.to_string()));

        match self.scripts.get(domain).cloned() {
            Some(Script::Outcome(outcome)) => Ok(outcome),
            Some(Script::Timeout) => Err(IssuerError::Timeout(Duration::from_secs(600))),
            Some(Script::Panic) => panic!("issuer blew up for {}", domain),
            None => Ok(IssuanceOutcome::Issued),
        }
    }
}

#[derive(Default)]
struct FakeConnector {
    log: Log,
    /// Hosts that refuse connections
    unreachable: Vec<String>,
    /// Remote file names whose upload fails
    failing_uploads: Vec<String>,
    /// Commands that exit with status 1
    failing_commands: Vec<String>,
}

impl Connector for FakeConnector {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.log
            .lock()
            .unwrap()
            .push(Event::Connect(target.hostname.clone()));

        if self.unreachable.contains(&target.hostname) {
            return Err(RemoteError::Connect {
                host: target.hostname.clone(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        Ok(Box::new(FakeSession {
            host: target.hostname.clone(),
            log: self.log.clone(),
            failing_uploads: self.failing_uploads.clone(),
            failing_commands: self.failing_commands.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    log: Log,
    failing_uploads: Vec<String>,
    failing_commands: Vec<String>,
}

impl RemoteSession for FakeSession {
    fn upload(&mut self, local: &Path, remote: &str, _mode: i32) -> Result<(), RemoteError> {
        self.log.lock().unwrap().push(Event::Upload {
            host: self.host.clone(),
            remote: remote.to_string(),
        });

        if self.failing_uploads.iter().any(|r| r == remote) {
            return Err(RemoteError::Transfer {
                path: local.to_path_buf(),
                reason: "disk full".to_string(),
            });
        }
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.log.lock().unwrap().push(Event::Exec {
            host: self.host.clone(),
            command: command.to_string(),
        });

        let failed = self.failing_commands.iter().any(|c| c == command);
        Ok(CommandOutput {
            exit_status: if failed { 1 } else { 0 },
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.log
            .lock()
            .unwrap()
            .push(Event::Close(self.host.clone()));
        Ok(())
    }
}

fn host(hostname: &str, commands: &[&str]) -> HostConfig {
    HostConfig {
        hostname: hostname.to_string(),
        ssh_port: 22,
        ssh_user: "deploy".to_string(),
        post_commands: commands.iter().map(|c| c.to_string()).collect(),
    }
}

fn config(renew_delay_seconds: u64, hosts: Vec<HostConfig>) -> Arc<Config> {
    Arc::new(Config {
        system: SystemConfig {
            email: "ops@example.com".to_string(),
            ssh_keyfile: PathBuf::from("/root/.ssh/id_ed25519"),
            renew_delay_seconds,
            issue_timeout_seconds: 600,
            ssh_timeout_seconds: 30,
            command_timeout_seconds: 60,
            connect_attempts: 1,
        },
        certbot: CertbotConfig::default(),
        gelf: None,
        hosts,
    })
}

fn orchestrator(
    config: Arc<Config>,
    scripts: Vec<(&str, Script)>,
    connector: FakeConnector,
) -> (Orchestrator, Log) {
    let log = connector.log.clone();
    let issuer = ScriptedIssuer {
        scripts: scripts
            .into_iter()
            .map(|(h, s)| (h.to_string(), s))
            .collect(),
        log: log.clone(),
    };

    let orchestrator = Orchestrator::new(config, Arc::new(issuer), Arc::new(connector)).with_retry(
        RetryPolicy {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    );

    (orchestrator, log)
}

fn events(log: &Log) -> Vec<Event> {
    log.lock().unwrap().clone()
}

fn touched_remotely(log: &Log, hostname: &str) -> bool {
    events(log).iter().any(|e| match e {
        Event::Connect(h) | Event::Close(h) => h == hostname,
        Event::Upload { host, .. } | Event::Exec { host, .. } => host == hostname,
        Event::Issue(_) => false,
    })
}

fn failed(code: i32) -> Script {
    Script::Outcome(IssuanceOutcome::Failed {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: "An unexpected error occurred".to_string(),
    })
}

#[tokio::test]
async fn test_issued_host_is_deployed_in_order() {
    let config = config(60, vec![host("web1", &["sudo systemctl reload nginx"])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![("web1", Script::Outcome(IssuanceOutcome::Issued))],
        FakeConnector::default(),
    );

    let report = orchestrator.run_cycle(1).await;

    assert_eq!(
        report.report_for("web1"),
        Some(&HostReport::Completed {
            failed_commands: vec![]
        })
    );
    assert_eq!(
        events(&log),
        vec![
            Event::Issue("web1".to_string()),
            Event::Connect("web1".to_string()),
            Event::Upload {
                host: "web1".to_string(),
                remote: "web1-fullchain.pem".to_string()
            },
            Event::Upload {
                host: "web1".to_string(),
                remote: "web1-privkey.pem".to_string()
            },
            Event::Close("web1".to_string()),
            Event::Connect("web1".to_string()),
            Event::Exec {
                host: "web1".to_string(),
                command: "sudo systemctl reload nginx".to_string()
            },
            Event::Close("web1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_ready_and_skipped_hosts() {
    let config = config(60, vec![host("host1", &["reload"]), host("host2", &["reload"])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![
            ("host1", Script::Outcome(IssuanceOutcome::Issued)),
            ("host2", Script::Outcome(IssuanceOutcome::NotDue)),
        ],
        FakeConnector::default(),
    );

    let report = orchestrator.run_cycle(1).await;

    assert!(matches!(
        report.report_for("host1"),
        Some(HostReport::Completed { .. })
    ));
    assert_eq!(report.report_for("host2"), Some(&HostReport::NotDue));
    assert!(touched_remotely(&log, "host1"));
    assert!(!touched_remotely(&log, "host2"));
    assert!(events(&log).contains(&Event::Issue("host2".to_string())));
}

#[tokio::test]
async fn test_only_issued_proceeds_to_transfer() {
    let config = config(
        60,
        vec![
            host("issued", &[]),
            host("not-due", &[]),
            host("failed", &[]),
            host("timed-out", &[]),
        ],
    );
    let (orchestrator, log) = orchestrator(
        config,
        vec![
            ("issued", Script::Outcome(IssuanceOutcome::Issued)),
            ("not-due", Script::Outcome(IssuanceOutcome::NotDue)),
            ("failed", failed(1)),
            ("timed-out", Script::Timeout),
        ],
        FakeConnector::default(),
    );

    let report = orchestrator.run_cycle(1).await;

    assert!(touched_remotely(&log, "issued"));
    for hostname in ["not-due", "failed", "timed-out"] {
        assert!(
            !touched_remotely(&log, hostname),
            "{} must not be contacted",
            hostname
        );
    }
    assert!(matches!(
        report.report_for("failed"),
        Some(HostReport::IssueFailed { .. })
    ));
    assert!(matches!(
        report.report_for("timed-out"),
        Some(HostReport::IssueFailed { .. })
    ));
}

#[tokio::test]
async fn test_issuance_failure_does_not_block_next_host() {
    let config = config(60, vec![host("a", &["reload"]), host("b", &["reload"])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![("a", failed(1)), ("b", Script::Outcome(IssuanceOutcome::Issued))],
        FakeConnector::default(),
    );

    let report = orchestrator.run_cycle(1).await;

    assert!(matches!(
        report.report_for("a"),
        Some(HostReport::IssueFailed { .. })
    ));
    assert!(matches!(
        report.report_for("b"),
        Some(HostReport::Completed { .. })
    ));
    assert!(events(&log).contains(&Event::Exec {
        host: "b".to_string(),
        command: "reload".to_string()
    }));
}

#[tokio::test]
async fn test_transfer_failure_skips_commands_and_closes() {
    let config = config(60, vec![host("web1", &["reload"]), host("web2", &["reload"])]);
    let connector = FakeConnector {
        failing_uploads: vec!["web1-privkey.pem".to_string()],
        ..FakeConnector::default()
    };
    let (orchestrator, log) = orchestrator(config, vec![], connector);

    let report = orchestrator.run_cycle(1).await;

    assert!(matches!(
        report.report_for("web1"),
        Some(HostReport::TransferFailed { .. })
    ));
    assert!(matches!(
        report.report_for("web2"),
        Some(HostReport::Completed { .. })
    ));

    let events = events(&log);
    assert!(events.contains(&Event::Close("web1".to_string())));
    assert!(!events.iter().any(|e| matches!(
        e,
        Event::Exec { host, .. } if host == "web1"
    )));
}

#[tokio::test]
async fn test_unreachable_host_reported() {
    let config = config(60, vec![host("down", &["reload"]), host("up", &[])]);
    let connector = FakeConnector {
        unreachable: vec!["down".to_string()],
        ..FakeConnector::default()
    };
    let (orchestrator, _log) = orchestrator(config, vec![], connector);

    let report = orchestrator.run_cycle(1).await;

    match report.report_for("down") {
        Some(HostReport::TransferFailed { error }) => assert!(error.contains("refused")),
        other => panic!("expected transfer failure, got {:?}", other),
    }
    assert!(matches!(
        report.report_for("up"),
        Some(HostReport::Completed { .. })
    ));
}

#[tokio::test]
async fn test_failed_commands_collected() {
    let config = config(60, vec![host("web1", &["first", "second", "third"])]);
    let connector = FakeConnector {
        failing_commands: vec!["first".to_string(), "second".to_string()],
        ..FakeConnector::default()
    };
    let (orchestrator, log) = orchestrator(config, vec![], connector);

    let report = orchestrator.run_cycle(1).await;

    match report.report_for("web1") {
        Some(HostReport::Completed { failed_commands }) => {
            let failed: Vec<_> = failed_commands
                .iter()
                .map(|f| (f.command.as_str(), f.exit_code))
                .collect();
            assert_eq!(failed, vec![("first", Some(1)), ("second", Some(1))]);
        }
        other => panic!("expected completion, got {:?}", other),
    }

    let executed: Vec<_> = events(&log)
        .into_iter()
        .filter_map(|e| match e {
            Event::Exec { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(executed, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_panicking_host_is_isolated() {
    let config = config(60, vec![host("bad", &[]), host("good", &["reload"])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![
            ("bad", Script::Panic),
            ("good", Script::Outcome(IssuanceOutcome::Issued)),
        ],
        FakeConnector::default(),
    );

    let report = orchestrator.run_cycle(1).await;

    match report.report_for("bad") {
        Some(HostReport::Aborted { error }) => assert!(error.contains("issuer blew up")),
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(matches!(
        report.report_for("good"),
        Some(HostReport::Completed { .. })
    ));
    assert!(touched_remotely(&log, "good"));
}

#[tokio::test(start_paused = true)]
async fn test_not_due_host_across_cycles() {
    let config = config(5, vec![host("only", &["reload"])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![("only", Script::Outcome(IssuanceOutcome::NotDue))],
        FakeConnector::default(),
    );

    let started = tokio::time::Instant::now();
    let cycles = orchestrator
        .run(Some(3), std::future::pending::<()>())
        .await;

    // Two sleeps between three passes, none after the last
    assert_eq!(cycles, 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    assert_eq!(
        events(&log),
        vec![
            Event::Issue("only".to_string()),
            Event::Issue("only".to_string()),
            Event::Issue("only".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_sleep() {
    let config = config(3600, vec![host("only", &[])]);
    let (orchestrator, log) = orchestrator(
        config,
        vec![("only", Script::Outcome(IssuanceOutcome::NotDue))],
        FakeConnector::default(),
    );

    let shutdown = tokio::time::sleep(Duration::from_secs(10));
    let started = tokio::time::Instant::now();
    let cycles = orchestrator.run(None, shutdown).await;

    assert_eq!(cycles, 1);
    assert!(started.elapsed() < Duration::from_secs(11));
    assert_eq!(events(&log).len(), 1);
}
