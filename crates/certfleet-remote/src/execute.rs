//! Post-upload remote commands

use tracing::{error, info};

use crate::{with_session, Connector, RemoteError, RetryPolicy, SshTarget};

/// A command that did not exit successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command: String,
    /// `None` when the command could not be started or its status was lost
    pub exit_code: Option<i32>,
}

/// Run `commands` one after another over a single session
///
/// A failing command is logged and the remaining commands still run. Only a
/// failure to open the session is returned as an error.
pub fn execute_commands(
    connector: &dyn Connector,
    target: &SshTarget,
    retry: &RetryPolicy,
    commands: &[String],
) -> Result<Vec<CommandFailure>, RemoteError> {
    let hostname = &target.hostname;
    info!("Executing post upload commands on {}", hostname);

    let failures = with_session(connector, target, retry, |session| {
        let mut failures = Vec::new();

        for command in commands {
            match session.exec(command) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    error!(
                        "Failed to execute command '{}' for {} with code: {}\nstdout:\n{}\nstderr:\n{}",
                        command, hostname, output.exit_status, output.stdout, output.stderr
                    );
                    failures.push(CommandFailure {
                        command: command.clone(),
                        exit_code: Some(output.exit_status),
                    });
                }
                Err(e) => {
                    error!(
                        "Failed to execute command '{}' for {}: {}",
                        command, hostname, e
                    );
                    failures.push(CommandFailure {
                        command: command.clone(),
                        exit_code: None,
                    });
                }
            }
        }

        Ok(failures)
    })?;

    if failures.is_empty() {
        info!(
            "Post upload commands are successfully executed on {}",
            hostname
        );
    } else {
        error!(
            "{} of {} post upload command(s) failed on {}",
            failures.len(),
            commands.len(),
            hostname
        );
    }

    Ok(failures)
}
