//! Transports that run commands as local child processes: either directly
//! through `sh -c`, or through the system `ssh` client, one process per
//! command.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{AuthStrategy, ConnectError, Connector, Target, Transport, TransportError};
use crate::executor::{Capture, ExitStatus};
use crate::log::*;

/// ssh(1) exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Spawn `builder` and pump its stdout and stderr into `capture` until both
/// streams close, then reap the child. The child is killed if this future is
/// dropped, which is how command timeouts stop runaway processes.
async fn pump(mut builder: Command, capture: &mut Capture) -> Result<ExitStatus, TransportError> {
    let mut child = builder
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Protocol("child stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::Protocol("child stderr was not captured".into()))?;
    let mut stdout = FramedRead::new(stdout, BytesCodec::new());
    let mut stderr = FramedRead::new(stderr, BytesCodec::new());

    let (mut stdout_open, mut stderr_open) = (true, true);
    while stdout_open || stderr_open {
        tokio::select! {
            next = stdout.next(), if stdout_open => match next {
                Some(chunk) => capture.push_stdout(&chunk?).await,
                None => stdout_open = false,
            },
            next = stderr.next(), if stderr_open => match next {
                Some(chunk) => capture.push_stderr(&chunk?).await,
                None => stderr_open = false,
            },
        }
    }

    let status = child.wait().await?;
    Ok(status
        .code()
        .map(ExitStatus::Code)
        .unwrap_or(ExitStatus::Unknown))
}

/// Runs commands on this machine. Authentication is not meaningful locally,
/// so every strategy is accepted.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        _target: &Target,
        _user: &str,
        _strategy: &AuthStrategy,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let shell = which::which("sh")
            .map_err(|e| ConnectError::Transport(format!("no local shell found: {}", e)))?;
        Ok(Box::new(LocalTransport { shell }))
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    shell: PathBuf,
}

#[async_trait]
impl Transport for LocalTransport {
    #[tracing::instrument(skip(self, capture))]
    async fn exec(
        &mut self,
        command: &str,
        capture: &mut Capture,
    ) -> Result<ExitStatus, TransportError> {
        let mut builder = Command::new(&self.shell);
        builder.arg("-c").arg(command);
        pump(builder, capture).await
    }

    async fn close(&mut self) {}
}

/// Shells out to the system `ssh` client. Password authentication cannot be
/// driven non-interactively this way and is reported as rejected.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    connect_timeout: Duration,
}

impl OpenSshConnector {
    pub fn new() -> Self {
        Self::with_connect_timeout(super::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn base_args(&self, target: &Target, strategy: &AuthStrategy) -> Result<Vec<String>, ConnectError> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            target.port().to_string(),
        ];
        match strategy {
            AuthStrategy::KeyFile {
                passphrase: Some(_),
                ..
            } => {
                return Err(ConnectError::Auth(
                    "the ssh client cannot unlock encrypted keys non-interactively; load the key into an agent".into(),
                ))
            }
            AuthStrategy::KeyFile { path, .. } => {
                args.push("-i".into());
                args.push(path.display().to_string());
                args.push("-o".into());
                args.push("IdentitiesOnly=yes".into());
            }
            AuthStrategy::Agent => {}
            AuthStrategy::Password(_) => {
                return Err(ConnectError::Auth(
                    "password authentication is not supported by the ssh client transport".into(),
                ))
            }
        }
        Ok(args)
    }
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    #[tracing::instrument(skip(self, strategy), fields(method = %strategy.method()))]
    async fn connect(
        &self,
        target: &Target,
        user: &str,
        strategy: &AuthStrategy,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let binary = which::which("ssh")
            .map_err(|e| ConnectError::Transport(format!("no ssh client found: {}", e)))?;
        let mut args = self.base_args(target, strategy)?;
        args.push(format!("{}@{}", user, target.host()));
        let mut transport = OpenSshTransport { binary, args };

        // Prove the credentials work before handing the transport out.
        let mut capture = Capture::new();
        let status = transport
            .exec("true", &mut capture)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        match status {
            ExitStatus::Code(0) => Ok(Box::new(transport)),
            _ => {
                let stderr = capture.stderr_text();
                let stderr = stderr.trim();
                if stderr.contains("Permission denied")
                    || stderr.contains("Too many authentication failures")
                {
                    Err(ConnectError::Auth(stderr.to_string()))
                } else {
                    Err(ConnectError::Transport(format!(
                        "ssh exited with {}: {}",
                        status, stderr
                    )))
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct OpenSshTransport {
    binary: PathBuf,
    args: Vec<String>,
}

impl OpenSshTransport {
    fn is_connection_failure(status: ExitStatus, stderr: &str) -> bool {
        status == ExitStatus::Code(SSH_CONNECTION_FAILURE)
            && (stderr.starts_with("ssh:")
                || stderr.contains("Connection closed")
                || stderr.contains("Connection reset")
                || stderr.contains("Connection refused")
                || stderr.contains("Connection timed out")
                || stderr.contains("Broken pipe"))
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    #[tracing::instrument(skip(self, capture))]
    async fn exec(
        &mut self,
        command: &str,
        capture: &mut Capture,
    ) -> Result<ExitStatus, TransportError> {
        trace!(
            "openssh transport: {} {} {}",
            self.binary.display(),
            shell_words::join(&self.args),
            shell_words::quote(command)
        );
        let mut builder = Command::new(&self.binary);
        builder.args(&self.args).arg(command);
        let status = pump(builder, capture).await?;

        let stderr = capture.stderr_text();
        if Self::is_connection_failure(status, stderr.trim()) {
            return Err(TransportError::Disconnected(stderr.trim().to_string()));
        }
        Ok(status)
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;

    async fn local() -> Result<Box<dyn Transport>> {
        let transport = LocalConnector::new()
            .connect(&Target::new("localhost", 22), "root", &AuthStrategy::Agent)
            .await?;
        Ok(transport)
    }

    #[tokio::test]
    async fn test_local_transport_separates_streams() -> Result<()> {
        let mut transport = local().await?;
        let mut capture = Capture::new();
        let status = transport
            .exec("echo out; echo err 1>&2; exit 3", &mut capture)
            .await?;
        assert_eq!(ExitStatus::Code(3), status);
        assert_eq!("out\n", capture.stdout_text());
        assert_eq!("err\n", capture.stderr_text());
        Ok(())
    }

    #[tokio::test]
    async fn test_local_transport_runs_each_command_in_a_fresh_shell() -> Result<()> {
        let mut transport = local().await?;
        let mut capture = Capture::new();
        transport.exec("FOO=bar", &mut capture).await?;
        let mut capture = Capture::new();
        transport.exec("echo \"[$FOO]\"", &mut capture).await?;
        assert_eq!("[]\n", capture.stdout_text());
        Ok(())
    }

    #[test]
    fn test_openssh_rejects_password_strategy() {
        let connector = OpenSshConnector::new();
        let err = connector
            .base_args(
                &Target::new("192.168.1.1", 22),
                &AuthStrategy::Password("root".into()),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectError::Auth(_)));
    }

    #[test]
    fn test_openssh_key_file_arguments() -> Result<()> {
        let connector = OpenSshConnector::with_connect_timeout(Duration::from_secs(15));
        let args = connector.base_args(
            &Target::new("192.168.1.1", 2222),
            &AuthStrategy::KeyFile {
                path: "/home/me/.ssh/router".into(),
                passphrase: None,
            },
        )?;
        assert!(args.iter().any(|arg| arg == "ConnectTimeout=15"));
        assert!(args.windows(2).any(|pair| pair == ["-p", "2222"]));
        assert!(args
            .windows(4)
            .any(|four| four == ["-i", "/home/me/.ssh/router", "-o", "IdentitiesOnly=yes"]));
        Ok(())
    }

    #[test]
    fn test_openssh_connection_failure_detection() {
        assert!(OpenSshTransport::is_connection_failure(
            ExitStatus::Code(255),
            "ssh: connect to host 192.168.1.1 port 22: Connection refused"
        ));
        assert!(!OpenSshTransport::is_connection_failure(
            ExitStatus::Code(255),
            "opkg: unknown package"
        ));
        assert!(!OpenSshTransport::is_connection_failure(
            ExitStatus::Code(1),
            "ssh: connect to host 192.168.1.1 port 22: Connection refused"
        ));
    }
}
