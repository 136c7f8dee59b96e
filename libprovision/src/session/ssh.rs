//! Native SSH transport built on thrussh.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thrussh::client::{self, Handle};
use thrussh::{ChannelMsg, Disconnect};

use super::{AuthStrategy, ConnectError, Connector, Target, Transport, TransportError};
use crate::executor::{Capture, ExitStatus};
use crate::log::*;

/// Connects with thrussh. Host keys are accepted without verification;
/// routers being provisioned are routinely reflashed and change keys.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[tracing::instrument(skip(self, strategy), fields(method = %strategy.method()))]
    async fn connect(
        &self,
        target: &Target,
        user: &str,
        strategy: &AuthStrategy,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let addr = target.address();
        debug!("ssh connector: connecting to {}", &addr);
        let mut handle = client::connect(self.config.clone(), addr.as_str(), SshClient)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let accepted = match strategy {
            AuthStrategy::Password(password) => handle
                .authenticate_password(user, password.as_str())
                .await
                .map_err(|e| ConnectError::Transport(e.to_string()))?,
            AuthStrategy::KeyFile { path, passphrase } => {
                let key = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ConnectError::Auth(format!("reading key {} failed: {}", path.display(), e))
                })?;
                let keypair = thrussh_keys::decode_secret_key(&key, passphrase.as_deref())
                    .map_err(|e| {
                        ConnectError::Auth(format!("decoding key {} failed: {}", path.display(), e))
                    })?;
                handle
                    .authenticate_publickey(user, Arc::new(keypair))
                    .await
                    .map_err(|e| ConnectError::Transport(e.to_string()))?
            }
            AuthStrategy::Agent => authenticate_with_agent(&mut handle, user).await?,
        };

        if accepted {
            debug!("ssh connector: authenticated to {} as {}", &addr, user);
            Ok(Box::new(SshTransport { handle }))
        } else {
            Err(ConnectError::Auth(format!(
                "{} rejected by server",
                strategy.method()
            )))
        }
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<SshClient>,
    user: &str,
) -> Result<bool, ConnectError> {
    let mut agent = thrussh_keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| ConnectError::Auth(format!("ssh agent unavailable: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectError::Auth(format!("listing agent identities failed: {}", e)))?;
    if identities.is_empty() {
        return Err(ConnectError::Auth("ssh agent holds no identities".into()));
    }

    for key in identities {
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => debug!("ssh connector: agent signing failed: {:?}", e),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<SshClient>,
    _user: &str,
) -> Result<bool, ConnectError> {
    Err(ConnectError::Auth(
        "ssh agent authentication is only supported on unix".into(),
    ))
}

pub struct SshTransport {
    handle: Handle<SshClient>,
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[tracing::instrument(skip(self, capture))]
    async fn exec(
        &mut self,
        command: &str,
        capture: &mut Capture,
    ) -> Result<ExitStatus, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut status = None;
        while let Some(frame) = channel.wait().await {
            match frame {
                ChannelMsg::Data { data } => capture.push_stdout(&data[..]).await,
                // Extended data type 1 is stderr; nothing else is in use.
                ChannelMsg::ExtendedData { data, ext: _ } => capture.push_stderr(&data[..]).await,
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(ExitStatus::Code(exit_status as i32));
                }
                ChannelMsg::ExitSignal { .. } => {
                    status.get_or_insert(ExitStatus::Unknown);
                }
                ChannelMsg::Close => return Ok(status.unwrap_or(ExitStatus::Unknown)),
                _ => {}
            }
        }

        // The connection went away underneath the channel.
        match status {
            Some(status) => Ok(status),
            None => Err(TransportError::Disconnected(
                "channel closed before the command reported an exit status".into(),
            )),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("ssh transport: disconnect failed: {}", e);
        }
    }
}

pub struct SshClient;

impl client::Handler for SshClient {
    type Error = color_eyre::eyre::Report;
    type FutureUnit = futures::future::Ready<Result<(Self, client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}
