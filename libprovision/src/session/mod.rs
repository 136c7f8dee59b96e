//! Sessions, credentials and the connection manager.
//!
//! A [`Session`] is one authenticated remote execution channel. It is created
//! by a [`ConnectionManager`], which walks a [`CredentialSet`] in order and
//! hands the first transport that authenticates to the session. Everything
//! transport-specific lives behind the [`Connector`] and [`Transport`] traits;
//! see [`ssh`] for the native implementation and [`process`] for the
//! subprocess-based ones.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProvisionError;
use crate::executor::{Capture, ExitStatus};
use crate::log::*;
use crate::plan::host::Port;

pub mod process;
pub mod ssh;

/// Default bound on a single authentication attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The remote endpoint a session talks to.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    host: String,
    port: Port,
}

impl Target {
    pub fn new<S: Into<String>>(host: S, port: Port) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for socket address resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One way of proving identity to the remote end.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// A private key read from disk, optionally encrypted.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Whatever identities the local ssh agent offers.
    Agent,
    /// A password. The empty string is a valid password.
    Password(String),
}

impl AuthStrategy {
    pub fn method(&self) -> AuthMethod {
        match self {
            AuthStrategy::KeyFile { .. } => AuthMethod::KeyFile,
            AuthStrategy::Agent => AuthMethod::Agent,
            AuthStrategy::Password(_) => AuthMethod::Password,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthStrategy::Agent => f.write_str("Agent"),
            AuthStrategy::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    KeyFile,
    Agent,
    Password,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile => f.write_str("key-file"),
            AuthMethod::Agent => f.write_str("agent"),
            AuthMethod::Password => f.write_str("password"),
        }
    }
}

/// The outcome of trying one [`AuthStrategy`].
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthAttempt {
    method: AuthMethod,
    error: Option<String>,
}

impl AuthAttempt {
    pub fn succeeded(method: AuthMethod) -> Self {
        Self {
            method,
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(method: AuthMethod, error: S) -> Self {
        Self {
            method,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// An ordered list of [`AuthStrategy`]s for one user. Strategies are tried in
/// insertion order.
#[derive(Getters, Debug, Clone)]
pub struct CredentialSet {
    user: String,
    strategies: Vec<AuthStrategy>,
    force_password: bool,
}

impl CredentialSet {
    pub fn new<S: Into<String>>(user: S) -> Self {
        Self {
            user: user.into(),
            strategies: vec![],
            force_password: false,
        }
    }

    pub fn with_key_file<P: Into<PathBuf>>(mut self, path: P, passphrase: Option<String>) -> Self {
        self.strategies.push(AuthStrategy::KeyFile {
            path: path.into(),
            passphrase,
        });
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(AuthStrategy::Agent);
        self
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.strategies.push(AuthStrategy::Password(password.into()));
        self
    }

    /// Skip key and agent strategies entirely and only send passwords.
    pub fn with_force_password(mut self, force_password: bool) -> Self {
        self.force_password = force_password;
        self
    }

    /// The strategies a connection manager will actually try, in order.
    pub fn effective_strategies(&self) -> Vec<&AuthStrategy> {
        self.strategies
            .iter()
            .filter(|strategy| {
                !self.force_password || matches!(strategy, AuthStrategy::Password(_))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// Failure modes of a [`Connector`] attempting a single strategy.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The remote end is there but refused this credential.
    #[error("{0}")]
    Auth(String),
    /// The remote end could not be reached, or the connection broke.
    #[error("{0}")]
    Transport(String),
}

/// Failure modes of a [`Transport`] running a command.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Establishes authenticated transports. One call tries exactly one strategy.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        target: &Target,
        user: &str,
        strategy: &AuthStrategy,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// An authenticated connection able to run commands. Every call to
/// [`Transport::exec`] uses a fresh command channel; no shell state survives
/// between calls.
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Run `command`, pushing output into `capture` as it arrives. Returns
    /// once the remote process has finished. Callers bound this with a
    /// timeout; implementations must stay cancel-safe with respect to
    /// `capture`.
    async fn exec(&mut self, command: &str, capture: &mut Capture)
        -> Result<ExitStatus, TransportError>;

    async fn close(&mut self);
}

/// One authenticated remote execution channel.
#[derive(Getters, Debug)]
pub struct Session {
    target: Target,
    credentials: CredentialSet,
    state: ConnectionState,
    /// Authentication history of the most recent successful connect.
    attempts: Vec<AuthAttempt>,
    #[getter(skip)]
    transport: Option<Box<dyn Transport>>,
    #[getter(skip)]
    manager: ConnectionManager,
}

impl Session {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_some()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub(crate) fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Forget the transport after it failed underneath us.
    pub(crate) fn mark_lost(&mut self) {
        if self.transport.take().is_some() {
            debug!("session: connection to {} lost", self.target);
        }
        self.state = ConnectionState::Lost;
    }

    /// Re-establish this session with the same credential order.
    pub async fn reconnect(&mut self) -> Result<(), ProvisionError> {
        let manager = self.manager.clone();
        manager.reconnect(self).await
    }

    /// Release the channel. Safe to call any number of times, including on a
    /// session that never connected.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("session: closing connection to {}", self.target);
            transport.close().await;
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[derive(Getters, Debug, Clone)]
pub struct ConnectionConfig {
    connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Creates and re-creates [`Session`]s through a [`Connector`].
#[derive(Getters, Debug, Clone)]
pub struct ConnectionManager {
    #[getter(skip)]
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, ConnectionConfig::default())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self { connector, config }
    }

    /// A session that has not connected yet. It connects on first use.
    pub fn detached(&self, target: Target, credentials: CredentialSet) -> Session {
        Session {
            target,
            credentials,
            state: ConnectionState::Disconnected,
            attempts: vec![],
            transport: None,
            manager: self.clone(),
        }
    }

    #[tracing::instrument(skip(self, credentials), fields(user = %credentials.user()))]
    pub async fn connect(
        &self,
        target: Target,
        credentials: CredentialSet,
    ) -> Result<Session, ProvisionError> {
        let mut session = self.detached(target, credentials);
        self.reconnect(&mut session).await?;
        Ok(session)
    }

    /// Drop whatever transport `session` holds and authenticate again.
    #[tracing::instrument(skip(self, session), fields(target = %session.target))]
    pub async fn reconnect(&self, session: &mut Session) -> Result<(), ProvisionError> {
        session.close().await;
        session.state = ConnectionState::Connecting;
        match self.authenticate(&session.target, &session.credentials).await {
            Ok((transport, attempts)) => {
                session.transport = Some(transport);
                session.attempts = attempts;
                session.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                session.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn authenticate(
        &self,
        target: &Target,
        credentials: &CredentialSet,
    ) -> Result<(Box<dyn Transport>, Vec<AuthAttempt>), ProvisionError> {
        let strategies = credentials.effective_strategies();
        if strategies.is_empty() {
            return Err(ProvisionError::NoCredentials {
                target: target.to_string(),
            });
        }

        let mut attempts = vec![];
        let mut timeouts = 0;
        for strategy in strategies {
            let method = strategy.method();
            debug!(
                "connection manager: trying {} auth for {}@{}",
                method,
                credentials.user(),
                target
            );
            let outcome = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(target, credentials.user(), strategy),
            )
            .await;
            match outcome {
                Ok(Ok(transport)) => {
                    info!(
                        "connected to {} as {} using {} auth",
                        target,
                        credentials.user(),
                        method
                    );
                    attempts.push(AuthAttempt::succeeded(method));
                    return Ok((transport, attempts));
                }
                Ok(Err(ConnectError::Auth(reason))) => {
                    warn!("{} auth to {} failed: {}", method, target, reason);
                    attempts.push(AuthAttempt::failed(method, reason));
                }
                Ok(Err(ConnectError::Transport(reason))) => {
                    return Err(ProvisionError::Connectivity {
                        target: target.to_string(),
                        reason,
                    });
                }
                Err(_) => {
                    let reason = format!(
                        "{} auth timed out after {:?}",
                        method, self.config.connect_timeout
                    );
                    warn!("{} to {}", reason, target);
                    attempts.push(AuthAttempt::failed(method, reason));
                    timeouts += 1;
                }
            }
        }

        // Nothing ever answered, so no credential was actually refused.
        if timeouts == attempts.len() {
            let reason = attempts
                .last()
                .and_then(|attempt| attempt.error().clone())
                .unwrap_or_default();
            return Err(ProvisionError::Connectivity {
                target: target.to_string(),
                reason,
            });
        }

        Err(ProvisionError::Authentication {
            target: target.to_string(),
            attempts,
        })
    }
}
