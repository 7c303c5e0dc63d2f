//! Configuration model
//!
//! The nested `system.*` shape is the only accepted schema. Unknown keys are
//! rejected so a typo surfaces at startup instead of silently using a default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigError;

/// Complete fleet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global settings
    pub system: SystemConfig,
    /// How certbot is invoked
    #[serde(default)]
    pub certbot: CertbotConfig,
    /// Remote log aggregation (local logging only when absent)
    #[serde(default)]
    pub gelf: Option<GelfConfig>,
    /// Target hosts, processed in order
    pub hosts: Vec<HostConfig>,
}

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Operator email registered with the ACME account
    pub email: String,
    /// Private key used for SSH public key authentication
    pub ssh_keyfile: PathBuf,
    /// Sleep between two passes over the fleet
    pub renew_delay_seconds: u64,
    /// Upper bound for a single certbot run
    #[serde(default = "default_issue_timeout")]
    pub issue_timeout_seconds: u64,
    /// TCP connect and per-call SSH timeout
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_seconds: u64,
    /// Upper bound for a whole remote stage (transfer or command list)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    /// Attempts at establishing an SSH session before giving up on a stage
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_issue_timeout() -> u64 {
    600
}

fn default_ssh_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    600
}

fn default_connect_attempts() -> u32 {
    3
}

impl SystemConfig {
    pub fn renew_delay(&self) -> Duration {
        Duration::from_secs(self.renew_delay_seconds)
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_secs(self.issue_timeout_seconds)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ConfigError::invalid(
                "system.email",
                format!("'{}' is not an email address", self.email),
            ));
        }

        if self.ssh_keyfile.as_os_str().is_empty() {
            return Err(ConfigError::invalid("system.ssh_keyfile", "path is empty"));
        }

        let durations = [
            ("system.renew_delay_seconds", self.renew_delay_seconds),
            ("system.issue_timeout_seconds", self.issue_timeout_seconds),
            ("system.ssh_timeout_seconds", self.ssh_timeout_seconds),
            ("system.command_timeout_seconds", self.command_timeout_seconds),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.connect_attempts == 0 {
            return Err(ConfigError::invalid(
                "system.connect_attempts",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

/// certbot invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CertbotConfig {
    /// Program and leading arguments, e.g. `["sudo", "certbot"]`
    pub command: Vec<String>,
    /// DNS provider plugin name, used as `--dns-<plugin>`
    pub dns_plugin: String,
    /// Credentials file handed to the DNS plugin
    pub credentials_file: PathBuf,
    /// certbot's live directory, one subdirectory per domain
    pub live_dir: PathBuf,
}

impl Default for CertbotConfig {
    fn default() -> Self {
        Self {
            command: vec!["certbot".to_string()],
            dns_plugin: "cloudflare".to_string(),
            credentials_file: PathBuf::from("cloudflare.ini"),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
        }
    }
}

impl CertbotConfig {
    /// Directory certbot writes the material for `hostname` into
    pub fn cert_dir(&self, hostname: &str) -> PathBuf {
        self.live_dir.join(hostname)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::invalid(
                    "certbot.command",
                    "program must not be empty",
                ))
            }
        }

        if self.dns_plugin.trim().is_empty() || self.dns_plugin.contains(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "certbot.dns_plugin",
                format!("'{}' is not a plugin name", self.dns_plugin),
            ));
        }

        Ok(())
    }
}

/// GELF over HTTPS log forwarding
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GelfConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Value of the `_app` field attached to every message
    #[serde(default = "default_gelf_app")]
    pub app: String,
}

fn default_gelf_app() -> String {
    "certfleet".to_string()
}

impl std::fmt::Debug for GelfConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GelfConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("app", &self.app)
            .finish()
    }
}

impl GelfConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("gelf.host", "host must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("gelf.port", "port must not be 0"));
        }
        Ok(())
    }
}

/// A target host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// SSH destination, also the certificate's domain name
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Shell commands run after the certificate files are uploaded
    #[serde(default)]
    pub post_commands: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostConfig {
    pub(crate) fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let field = |name: &str| format!("hosts[{}].{}", index, name);

        if self.hostname.is_empty()
            || self.hostname.contains(char::is_whitespace)
            || self.hostname.starts_with('.')
            || self.hostname.ends_with('.')
        {
            return Err(ConfigError::invalid(
                field("hostname"),
                format!("'{}' is not a hostname", self.hostname),
            ));
        }

        if self.ssh_user.trim().is_empty() {
            return Err(ConfigError::invalid(field("ssh_user"), "user must not be empty"));
        }

        if self.ssh_port == 0 {
            return Err(ConfigError::invalid(field("ssh_port"), "port must not be 0"));
        }

        if let Some(position) = self.post_commands.iter().position(|c| c.trim().is_empty()) {
            return Err(ConfigError::invalid(
                format!("hosts[{}].post_commands[{}]", index, position),
                "command must not be empty",
            ));
        }

        Ok(())
    }
}
