//! Runs one [`CommandSpec`] on a [`Session`], retrying transport failures.

use std::time::Duration;

use tokio::time::Instant;

use super::command::{Capture, CommandResult, CommandSpec, ExitStatus};
use super::simple::SimpleLogSink;
use crate::error::ProvisionError;
use crate::log::*;
use crate::session::Session;

/// What one attempt at a command came to.
enum Attempt {
    /// The command completed or timed out. Either way it is final.
    Finished(ExitStatus, Capture),
    /// The transport failed; the attempt may be retried.
    TransportFailed(String),
    /// Something retrying cannot fix, like rejected credentials.
    Abandoned(String),
}

#[derive(Debug, Clone, Default)]
pub struct Runner {
    log_sink: Option<SimpleLogSink>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every command and its output to `sink` while it runs.
    pub fn with_log_sink(sink: SimpleLogSink) -> Self {
        Self {
            log_sink: Some(sink),
        }
    }

    /// Run `spec` once, plus up to `spec.retries()` more times if the
    /// transport fails. A non-zero exit is never retried. Always yields a
    /// result.
    #[tracing::instrument(skip(self, session, spec), fields(command = %spec.command()))]
    pub async fn run(&self, session: &mut Session, spec: &CommandSpec) -> CommandResult {
        let started = Instant::now();
        let mut retries = 0;
        loop {
            match self.attempt(session, spec).await {
                Attempt::Finished(status, capture) => {
                    let result =
                        CommandResult::observed(spec, status, &capture, started.elapsed(), retries);
                    if result.is_success() {
                        debug!(
                            "runner: '{}' succeeded in {:?}",
                            spec.command(),
                            result.elapsed()
                        );
                    } else {
                        warn!("runner: '{}' failed ({})", spec.command(), status);
                    }
                    return result;
                }
                Attempt::Abandoned(error) => {
                    error!("runner: giving up on '{}': {}", spec.command(), error);
                    return CommandResult::abandoned(spec, error, started.elapsed(), retries);
                }
                Attempt::TransportFailed(error) if retries >= *spec.retries() => {
                    error!(
                        "runner: '{}' failed after {} attempt(s): {}",
                        spec.command(),
                        retries + 1,
                        error
                    );
                    return CommandResult::abandoned(spec, error, started.elapsed(), retries);
                }
                Attempt::TransportFailed(error) => {
                    retries += 1;
                    let delay = spec.backoff().delay(retries);
                    warn!(
                        "runner: '{}' hit a transport failure ({}), retry {}/{} in {:?}",
                        spec.command(),
                        error,
                        retries,
                        spec.retries(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, session: &mut Session, spec: &CommandSpec) -> Attempt {
        if !session.is_connected() {
            debug!("runner: session to {} is not connected, reconnecting", session.target());
            if let Err(err) = session.reconnect().await {
                return match err {
                    ProvisionError::Connectivity { .. } => Attempt::TransportFailed(err.to_string()),
                    other => Attempt::Abandoned(other.to_string()),
                };
            }
        }

        let mut capture = Capture::with_sink(self.log_sink.clone());
        capture.announce(spec.command()).await;
        let Some(transport) = session.transport_mut() else {
            return Attempt::TransportFailed("session has no transport".into());
        };
        let outcome =
            tokio::time::timeout(*spec.timeout(), transport.exec(spec.command(), &mut capture))
                .await;
        capture.flush().await;
        match outcome {
            Ok(Ok(status)) => Attempt::Finished(status, capture),
            Ok(Err(err)) => {
                session.mark_lost();
                Attempt::TransportFailed(err.to_string())
            }
            Err(_) => {
                warn!(
                    "runner: '{}' timed out after {:?}",
                    spec.command(),
                    spec.timeout()
                );
                Attempt::Finished(ExitStatus::Timeout, capture)
            }
        }
    }

    /// Run `spec` until its success check passes, at most `attempts` times,
    /// sleeping `delay` in between. Returns the last result.
    #[tracing::instrument(skip(self, session, spec), fields(command = %spec.command()))]
    pub async fn poll_until(
        &self,
        session: &mut Session,
        spec: &CommandSpec,
        attempts: u32,
        delay: Duration,
    ) -> CommandResult {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.run(session, spec).await;
            if result.is_success() || attempt >= attempts {
                return result;
            }
            info!(
                "runner: waiting on '{}', attempt {}/{}",
                spec.command(),
                attempt,
                attempts
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}
