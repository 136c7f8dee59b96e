//! The error taxonomy surfaced to callers of the connection manager and the
//! recovery coordinator.
//!
//! Command failures are never errors: a non-zero exit or a timed-out command
//! is represented as data in a [`crate::executor::CommandResult`].

use std::time::Duration;

use thiserror::Error;

use crate::session::AuthAttempt;

#[derive(Error, Debug, Clone)]
pub enum ProvisionError {
    /// Every authentication strategy was tried and rejected.
    #[error("authentication to {target} failed: {}", describe_attempts(.attempts))]
    Authentication {
        target: String,
        attempts: Vec<AuthAttempt>,
    },
    /// The transport could not be established or was reset.
    #[error("cannot reach {target}: {reason}")]
    Connectivity { target: String, reason: String },
    /// The target did not come back after a disruptive action.
    #[error("{target} did not become reachable within {deadline:?}")]
    UnreachableTimeout { target: String, deadline: Duration },
    /// Nothing was left to try once the credential set was filtered.
    #[error("no usable credentials for {target}")]
    NoCredentials { target: String },
}

impl ProvisionError {
    /// Transport-level failures are the only class worth retrying.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProvisionError::Connectivity { .. } | ProvisionError::UnreachableTimeout { .. }
        )
    }
}

fn describe_attempts(attempts: &[AuthAttempt]) -> String {
    if attempts.is_empty() {
        return "no strategies attempted".into();
    }
    attempts
        .iter()
        .map(|attempt| match attempt.error() {
            Some(error) => format!("{}: {}", attempt.method(), error),
            None => format!("{}: ok", attempt.method()),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
