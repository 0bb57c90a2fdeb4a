//! Connection transport seam.
//!
//! [`DeviceSession`](super::DeviceSession) only sees [`Transport`] and
//! [`Connection`]. The shipped [`OpenSshTransport`] drives the system
//! `ssh` client, one exec channel per command; tests swap in scripted
//! transports.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::config::{ConnectionConfig, DeviceConfig};
use crate::security::mask_password;

/// Login credentials. `Debug` never shows the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &mask_password(&self.password))
            .finish()
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl Target {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            credentials: Credentials::new(username, password),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn from_device(device: &DeviceConfig) -> Self {
        Self::new(&device.host, &device.username, device.resolved_password())
            .with_port(device.port)
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Same host, port and user (password ignored).
    pub fn same_endpoint(&self, other: &Target) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.credentials.username == other.credentials.username
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.credentials.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication rejected")]
    Authentication,

    #[error("timed out")]
    Timeout,

    /// Output arrived but the command never completed.
    #[error("output arrived but the command never completed")]
    PatternMismatch,

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Other(String),
}

/// Opens connections to a device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live connection. Owned exclusively by the session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send {
    /// Run one command and return its output.
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Runs each command through the system `ssh` client
/// (`sshpass -e ssh ...` when a password is set).
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_command: String,
    accept_new_host_keys: bool,
}

impl OpenSshTransport {
    pub fn new(ssh_command: impl Into<String>) -> Self {
        Self {
            ssh_command: ssh_command.into(),
            accept_new_host_keys: false,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            ssh_command: config.ssh_command.clone(),
            accept_new_host_keys: config.accept_new_host_keys,
        }
    }

    fn command(
        &self,
        target: &Target,
        remote: &str,
        timeout: Duration,
    ) -> tokio::process::Command {
        let password = target.credentials.password();
        let mut cmd = if password.is_empty() {
            let mut cmd = tokio::process::Command::new(&self.ssh_command);
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sshpass");
            cmd.arg("-e").arg(&self.ssh_command).env("SSHPASS", password);
            cmd
        };

        cmd.arg("-T")
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        if self.accept_new_host_keys {
            cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        }
        cmd.arg(format!("{}@{}", target.username(), target.host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        target: &Target,
        remote: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        debug!("ssh {} -> {:?} (timeout: {:?})", target, remote, timeout);

        let mut child = self
            .command(target, remote, timeout)
            .spawn()
            .map_err(|e| TransportError::Other(format!("failed to start ssh client: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Other("ssh stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Other("ssh stderr unavailable".to_string()))?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let finished = tokio::time::timeout(timeout, async {
            let (o, e) = tokio::join!(drain(stdout, &mut out), drain(stderr, &mut err));
            o.and(e)?;
            child.wait().await
        })
        .await;

        let status = match finished {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(TransportError::Other(e.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                return Err(if out.is_empty() {
                    TransportError::Timeout
                } else {
                    TransportError::PatternMismatch
                });
            }
        };

        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err);
        exit_outcome(status.code(), stdout, &stderr)
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn open(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError> {
        // A trivial exec proves the host is reachable and the login works
        self.run(target, "exit", timeout).await?;
        Ok(Box::new(OpenSshConnection {
            transport: self.clone(),
            target: target.clone(),
            closed: false,
        }))
    }
}

struct OpenSshConnection {
    transport: OpenSshTransport,
    target: Target,
    closed: bool,
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed("connection already closed".to_string()));
        }
        self.transport.run(&self.target, command, timeout).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Turn a finished ssh process into output or an error.
///
/// A remote command that exits non-zero keeps its stderr: appended to the
/// output when there is some, otherwise reported as the error.
fn exit_outcome(
    code: Option<i32>,
    stdout: String,
    stderr: &str,
) -> Result<String, TransportError> {
    match code {
        // 255 is ssh's own failure code; sshpass uses 5 (bad password) and 6 (host key)
        Some(255) | Some(5) | Some(6) | None => Err(classify_stderr(stderr, code)),
        Some(0) => Ok(stdout),
        Some(_) if stderr.trim().is_empty() => Ok(stdout),
        Some(_) if stdout.trim().is_empty() => Err(TransportError::Other(first_line(stderr))),
        Some(_) => {
            let mut output = stdout;
            if !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(stderr.trim_end());
            Ok(output)
        }
    }
}

/// Map ssh/sshpass diagnostics onto the transport taxonomy.
fn classify_stderr(stderr: &str, code: Option<i32>) -> TransportError {
    let lower = stderr.to_lowercase();
    if code == Some(5)
        || lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("auth fail")
    {
        TransportError::Authentication
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("refused")
        || lower.contains("no route to host")
    {
        TransportError::Timeout
    } else if lower.contains("connection closed")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
    {
        TransportError::Closed(first_line(stderr))
    } else if code == Some(6) || lower.contains("host key verification failed") {
        TransportError::Other("host key verification failed".to_string())
    } else {
        TransportError::Other(first_line(stderr))
    }
}

fn first_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("ssh exited without a diagnostic")
        .to_string()
}
