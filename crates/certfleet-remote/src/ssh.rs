//! libssh2-backed sessions
//!
//! Host keys are not verified: any key presented by the server is accepted.
//! The SHA-256 fingerprint is logged at debug level so it can be audited.

use ssh2::{Channel, HashType, Session};
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{CommandOutput, Connector, RemoteError, RemoteSession, SshTarget};

/// Opens real SSH sessions with public key authentication
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }

    fn connect_tcp(target: &SshTarget) -> Result<TcpStream, RemoteError> {
        let connect_error = |source| RemoteError::Connect {
            host: format!("{}:{}", target.hostname, target.port),
            source,
        };

        let addrs = (target.hostname.as_str(), target.port)
            .to_socket_addrs()
            .map_err(connect_error)?;

        let mut last_error = std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "hostname resolved to no addresses",
        );

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, target.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(target.timeout))?;
                    stream.set_write_timeout(Some(target.timeout))?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("[{}] Connect to {} failed: {}", target.hostname, addr, e);
                    last_error = e;
                }
            }
        }

        Err(connect_error(last_error))
    }
}

impl Connector for SshConnector {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let tcp = Self::connect_tcp(target)?;

        let mut session = Session::new()?;
        session.set_timeout(timeout_millis(target.timeout));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| RemoteError::Handshake {
            host: target.hostname.clone(),
            reason: e.to_string(),
        })?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            debug!(
                "[{}] Accepting host key SHA256:{}",
                target.hostname,
                hex(hash)
            );
        }

        session
            .userauth_pubkey_file(&target.user, None, &target.keyfile, None)
            .map_err(|e| RemoteError::Auth {
                user: target.user.clone(),
                reason: e.to_string(),
            })?;

        if !session.authenticated() {
            return Err(RemoteError::Auth {
                user: target.user.clone(),
                reason: "server did not accept the key".to_string(),
            });
        }

        debug!(
            "[{}] SSH session established as {}",
            target.hostname, target.user
        );

        Ok(Box::new(SshSession {
            session,
            hostname: target.hostname.clone(),
            io_timeout: target.timeout,
            command_timeout: target.command_timeout,
        }))
    }
}

/// An authenticated libssh2 session
pub struct SshSession {
    session: Session,
    hostname: String,
    io_timeout: Duration,
    command_timeout: Duration,
}

impl SshSession {
    fn run_command(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let exec_error = |reason: String| RemoteError::Exec {
            command: command.to_string(),
            reason,
        };

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| exec_error(e.to_string()))?;
        channel.exec(command).map_err(|e| exec_error(e.to_string()))?;

        let deadline = Instant::now() + self.command_timeout;
        self.session.set_blocking(false);
        let drained = drain(&mut channel, deadline);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| exec_error(e.to_string()))?;

        channel.wait_close().map_err(|e| exec_error(e.to_string()))?;
        let exit_status = channel
            .exit_status()
            .map_err(|e| exec_error(e.to_string()))?;

        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Both output streams of a running command
trait ExecStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// The remote side has sent EOF
    fn eof(&self) -> bool;
}

impl ExecStreams for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn eof(&self) -> bool {
        Channel::eof(self)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Read stdout and stderr side by side until EOF, without letting either
/// stream's window fill up while the other is being read
///
/// Expects non-blocking streams: `WouldBlock` means no data yet.
fn drain<S: ExecStreams>(streams: &mut S, deadline: Instant) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];
    let mut saw_eof = false;

    loop {
        let mut progressed = false;

        match streams.read_stdout(&mut buf) {
            Ok(n) if n > 0 => {
                stdout.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match streams.read_stderr(&mut buf) {
            Ok(n) if n > 0 => {
                stderr.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if progressed {
            saw_eof = false;
            continue;
        }
        // One more quiet pass after EOF picks up data that arrived with it
        if streams.eof() {
            if saw_eof {
                return Ok((stdout, stderr));
            }
            saw_eof = true;
            continue;
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "command did not finish in time",
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl RemoteSession for SshSession {
    fn upload(&mut self, local: &Path, remote: &str, mode: i32) -> Result<(), RemoteError> {
        let transfer_error = |reason: String| RemoteError::Transfer {
            path: local.to_path_buf(),
            reason,
        };

        let mut file = File::open(local).map_err(|e| transfer_error(e.to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| transfer_error(e.to_string()))?
            .len();

        let mut channel = self
            .session
            .scp_send(Path::new(remote), mode, size, None)
            .map_err(|e| transfer_error(e.to_string()))?;

        std::io::copy(&mut file, &mut channel).map_err(|e| transfer_error(e.to_string()))?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;

        debug!(
            "[{}] Uploaded {:?} to {} ({} bytes)",
            self.hostname, local, remote, size
        );

        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        // Commands may stay silent much longer than any protocol exchange
        self.session
            .set_timeout(timeout_millis(self.command_timeout));
        let result = self.run_command(command);
        self.session.set_timeout(timeout_millis(self.io_timeout));
        result
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.session
            .disconnect(None, "certfleet session finished", None)?;
        debug!("[{}] SSH session closed", self.hostname);
        Ok(())
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
