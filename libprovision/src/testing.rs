//! A scripted [`Connector`] for exercising auth order, retries and
//! reconnects without a network.
//!
//! Commands understood by [`ScriptedTransport`]:
//!
//! - `true`, `false`, `exit N`
//! - `echo TEXT`: prints `TEXT` and exits 0
//! - `sleep N`: waits `N` seconds and exits 0
//! - `hang [TEXT]`: prints `TEXT` if given, then never finishes
//! - `reboot`: drops the connection
//!
//! Commands with queued outputs print the next queued output and exit 0.
//! Anything else exits 0 silently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::executor::{Capture, ExitStatus};
use crate::session::{
    AuthMethod, AuthStrategy, ConnectError, Connector, Target, Transport, TransportError,
};

#[derive(Debug, Default)]
struct Script {
    methods: Vec<AuthMethod>,
    stalled: Vec<AuthMethod>,
    passwords: Vec<String>,
    failing_connects: usize,
    failing_execs: usize,
    outputs: Vec<(String, VecDeque<String>)>,
    connects: Vec<AuthStrategy>,
    execs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        f(&mut self.script.lock().unwrap());
        self
    }

    pub fn accept(self, method: AuthMethod) -> Self {
        self.edit(|script| script.methods.push(method))
    }

    /// Connects using `method` never answer.
    pub fn stall(self, method: AuthMethod) -> Self {
        self.edit(|script| script.stalled.push(method))
    }

    pub fn accept_password(self, password: &str) -> Self {
        self.edit(|script| script.passwords.push(password.to_string()))
    }

    /// The next `n` connects fail at the transport level.
    pub fn fail_connects(self, n: usize) -> Self {
        self.edit(|script| script.failing_connects = n)
    }

    /// The next `n` commands lose their connection.
    pub fn fail_execs(self, n: usize) -> Self {
        self.edit(|script| script.failing_execs = n)
    }

    /// Commands starting with `prefix` print these outputs in turn. The last
    /// one repeats.
    pub fn queue_outputs(&self, prefix: &str, outputs: &[&str]) {
        self.script.lock().unwrap().outputs.push((
            prefix.to_string(),
            outputs.iter().map(|output| output.to_string()).collect(),
        ));
    }

    /// Every strategy a connect was attempted with, in order.
    pub fn connects(&self) -> Vec<AuthStrategy> {
        self.script.lock().unwrap().connects.clone()
    }

    /// Every command an exec was attempted for, in order.
    pub fn execs(&self) -> Vec<String> {
        self.script.lock().unwrap().execs.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _target: &Target,
        _user: &str,
        strategy: &AuthStrategy,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let (stalled, accepted) = {
            let mut script = self.script.lock().unwrap();
            script.connects.push(strategy.clone());
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                return Err(ConnectError::Transport("connection refused".into()));
            }
            let accepted = match strategy {
                AuthStrategy::Password(password) => script.passwords.contains(password),
                other => script.methods.contains(&other.method()),
            };
            (script.stalled.contains(&strategy.method()), accepted)
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        if !accepted {
            return Err(ConnectError::Auth(format!("{} rejected", strategy.method())));
        }
        Ok(Box::new(ScriptedTransport {
            script: self.script.clone(),
            open: true,
        }))
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    open: bool,
}

enum Outcome {
    Exit(i32, Option<String>),
    Sleep(Duration),
    Hang(Option<String>),
    Drop,
}

impl ScriptedTransport {
    fn plan(&self, command: &str) -> Outcome {
        let mut script = self.script.lock().unwrap();
        script.execs.push(command.to_string());
        if script.failing_execs > 0 {
            script.failing_execs -= 1;
            return Outcome::Drop;
        }
        if let Some((_, queue)) = script
            .outputs
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            let output = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            return Outcome::Exit(0, output);
        }

        let (program, rest) = command.split_once(' ').unwrap_or((command, ""));
        match program {
            "true" => Outcome::Exit(0, None),
            "false" => Outcome::Exit(1, None),
            "exit" => Outcome::Exit(rest.trim().parse().unwrap_or(1), None),
            "echo" => Outcome::Exit(0, Some(rest.to_string())),
            "sleep" => Outcome::Sleep(Duration::from_secs(rest.trim().parse().unwrap_or(1))),
            "hang" if rest.is_empty() => Outcome::Hang(None),
            "hang" => Outcome::Hang(Some(rest.to_string())),
            "reboot" => Outcome::Drop,
            _ => Outcome::Exit(0, None),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exec(
        &mut self,
        command: &str,
        capture: &mut Capture,
    ) -> Result<ExitStatus, TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected("transport closed".into()));
        }
        match self.plan(command) {
            Outcome::Exit(code, output) => {
                if let Some(output) = output {
                    capture.push_stdout(format!("{}\n", output).as_bytes()).await;
                }
                Ok(ExitStatus::Code(code))
            }
            Outcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExitStatus::Code(0))
            }
            Outcome::Hang(output) => {
                if let Some(output) = output {
                    capture.push_stdout(format!("{}\n", output).as_bytes()).await;
                }
                std::future::pending().await
            }
            Outcome::Drop => {
                self.open = false;
                Err(TransportError::Disconnected("connection reset by peer".into()))
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
