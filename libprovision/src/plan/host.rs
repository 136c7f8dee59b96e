//! Host inventory: named hosts, how to reach them, and named groups of
//! hosts.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{CredentialSet, Target};

pub type Port = u16;

pub fn default_ssh_port() -> Port {
    22
}

fn default_user() -> String {
    "root".into()
}

fn default_agent() -> bool {
    true
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("unknown host or group: {0}")]
    Unknown(String),
    #[error("group {0} contains unknown host {1}")]
    UnknownMember(String, String),
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    hosts: HashMap<String, Host>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host<S: Into<String>>(mut self, name: S, host: Host) -> Self {
        self.hosts.insert(name.into(), host);
        self
    }

    pub fn with_group<S: Into<String>>(mut self, name: S, members: Vec<String>) -> Self {
        self.groups.insert(name.into(), members);
        self
    }

    /// Expand host and group names into a sorted, deduplicated list of host
    /// names. An empty list selects every host.
    #[tracing::instrument(skip(self))]
    pub fn resolve(&self, names: &[String]) -> Result<Vec<String>, HostError> {
        if names.is_empty() {
            let all: BTreeSet<&String> = self.hosts.keys().collect();
            return Ok(all.into_iter().cloned().collect());
        }

        let mut resolved = BTreeSet::new();
        for name in names {
            if self.hosts.contains_key(name) {
                resolved.insert(name.clone());
            } else if let Some(members) = self.groups.get(name) {
                for member in members {
                    if !self.hosts.contains_key(member) {
                        return Err(HostError::UnknownMember(name.clone(), member.clone()));
                    }
                    resolved.insert(member.clone());
                }
            } else {
                return Err(HostError::Unknown(name.clone()));
            }
        }
        Ok(resolved.into_iter().collect())
    }
}

/// Which [`crate::session::Connector`] reaches a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Native SSH client.
    #[default]
    Ssh,
    /// The system `ssh` binary.
    Openssh,
    /// This machine's shell. Mostly useful for testing plans.
    Local,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Ssh => f.write_str("ssh"),
            ExecutorKind::Openssh => f.write_str("openssh"),
            ExecutorKind::Local => f.write_str("local"),
        }
    }
}

#[derive(Getters, Clone, Serialize, Deserialize)]
pub struct Host {
    host: String,
    #[serde(default = "self::default_ssh_port")]
    port: Port,
    #[serde(default = "self::default_user")]
    user: String,
    #[serde(default)]
    executor: ExecutorKind,
    /// Private key file tried first.
    #[serde(default)]
    key: Option<PathBuf>,
    /// Tried last. An empty string is a real password, not a missing one.
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    force_password: bool,
    /// Whether to offer the local ssh agent's identities.
    #[serde(default = "self::default_agent")]
    agent: bool,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("executor", &self.executor)
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("force_password", &self.force_password)
            .field("agent", &self.agent)
            .finish()
    }
}

impl Host {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: default_user(),
            executor: ExecutorKind::default(),
            key: None,
            password: None,
            force_password: false,
            agent: default_agent(),
        }
    }

    pub fn new_with_port<S: Into<String>>(host: S, port: Port) -> Self {
        Self {
            port,
            ..Self::new(host)
        }
    }

    pub fn new_with_executor<S: Into<String>>(host: S, executor: ExecutorKind) -> Self {
        Self {
            executor,
            ..Self::new(host)
        }
    }

    pub fn with_user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_key<P: Into<PathBuf>>(mut self, key: P) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_force_password(mut self, force_password: bool) -> Self {
        self.force_password = force_password;
        self
    }

    pub fn with_agent(mut self, agent: bool) -> Self {
        self.agent = agent;
        self
    }

    pub fn target(&self) -> Target {
        Target::new(self.host.clone(), self.port)
    }

    /// Build the credential order for this host: key file, then agent, then
    /// password. `passphrase` unlocks the key file if it is encrypted.
    pub fn credentials(&self, passphrase: Option<String>) -> CredentialSet {
        let mut credentials = CredentialSet::new(self.user.clone());
        if let Some(key) = &self.key {
            credentials = credentials.with_key_file(key.clone(), passphrase);
        }
        if self.agent {
            credentials = credentials.with_agent();
        }
        if let Some(password) = &self.password {
            credentials = credentials.with_password(password.clone());
        }
        credentials.with_force_password(self.force_password)
    }
}
