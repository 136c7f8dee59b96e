//! Reboot and recovery: issue a command that takes the target down, wait for
//! it to accept TCP connections again, then re-authenticate.
//!
//! ```text
//! Stable -> Disrupting -> Unreachable -> Reconnecting -> Stable
//!                              |               |
//!                              +----> Failed <-+
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ProvisionError;
use crate::executor::{CommandSpec, Runner};
use crate::log::*;
use crate::plan::secs;
use crate::session::{Session, Target};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks whether a target accepts connections, without authenticating.
#[async_trait]
pub trait Probe: Send + Sync + std::fmt::Debug {
    async fn probe(&self, target: &Target) -> io::Result<()>;
}

/// Opens and immediately drops a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, target: &Target) -> io::Result<()> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(target.address())).await {
            Ok(stream) => stream.map(drop),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer from {} within {:?}", target, self.timeout),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Stable,
    Disrupting,
    Unreachable,
    Reconnecting,
    Failed,
}

fn default_disrupt_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_deadline() -> Duration {
    Duration::from_secs(180)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long to give the disruptive command before moving on regardless.
    #[serde(default = "default_disrupt_timeout", with = "secs")]
    disrupt_timeout: Duration,
    /// Pause before the first probe, so a target that is still shutting down
    /// is not mistaken for one that came back.
    #[serde(default = "default_settle", with = "secs")]
    settle: Duration,
    /// Measured from the first probe. A probe at exactly the deadline counts.
    #[serde(default = "default_deadline", with = "secs")]
    deadline: Duration,
    #[serde(default = "default_poll_interval", with = "secs")]
    poll_interval: Duration,
    #[serde(default = "default_reconnect_attempts")]
    reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay", with = "secs")]
    reconnect_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            disrupt_timeout: default_disrupt_timeout(),
            settle: default_settle(),
            deadline: default_deadline(),
            poll_interval: default_poll_interval(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl RecoveryConfig {
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }
}

#[derive(Debug)]
pub struct RecoveryCoordinator {
    runner: Runner,
    probe: Arc<dyn Probe>,
    config: RecoveryConfig,
    state: RecoveryState,
    history: Vec<RecoveryState>,
}

impl RecoveryCoordinator {
    pub fn new(probe: Arc<dyn Probe>, config: RecoveryConfig) -> Self {
        Self {
            runner: Runner::new(),
            probe,
            config,
            state: RecoveryState::Stable,
            history: vec![RecoveryState::Stable],
        }
    }

    /// Use `runner` for the disruptive command, e.g. to stream its output.
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Every state entered so far, starting with `Stable`.
    pub fn history(&self) -> &[RecoveryState] {
        &self.history
    }

    fn enter(&mut self, state: RecoveryState) {
        debug!("recovery: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    /// Run `command`, expecting it to take the target down, and bring
    /// `session` back once the target answers again.
    #[tracing::instrument(skip(self, session), fields(target = %session.target()))]
    pub async fn disrupt_and_recover(
        &mut self,
        session: &mut Session,
        command: &str,
    ) -> Result<(), ProvisionError> {
        self.enter(RecoveryState::Disrupting);
        let spec = CommandSpec::new(command)
            .with_retries(0)
            .with_timeout(self.config.disrupt_timeout);
        let result = self.runner.run(session, &spec).await;
        debug!(
            "recovery: disruptive command '{}' ended with {} (ignored)",
            command,
            result.exit_status()
        );
        session.close().await;

        self.enter(RecoveryState::Unreachable);
        if let Err(err) = self.wait_reachable(session.target()).await {
            self.enter(RecoveryState::Failed);
            return Err(err);
        }

        self.enter(RecoveryState::Reconnecting);
        match self.reconnect(session).await {
            Ok(()) => {
                self.enter(RecoveryState::Stable);
                info!("recovery: {} is back", session.target());
                Ok(())
            }
            Err(err) => {
                self.enter(RecoveryState::Failed);
                Err(err)
            }
        }
    }

    async fn wait_reachable(&self, target: &Target) -> Result<(), ProvisionError> {
        if !self.config.settle.is_zero() {
            tokio::time::sleep(self.config.settle).await;
        }
        let started = Instant::now();
        let deadline_at = started + self.config.deadline;
        // Ticks are laid out from `started`. A probe slower than the interval
        // pushes the next one back instead of bunching them up.
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval_at(started, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // The wait before the last probe is cut short so it lands on the
            // deadline itself. A probe still running at the deadline is
            // followed by one more.
            let _ = tokio::time::timeout_at(deadline_at, ticks.tick()).await;
            let probed_at = Instant::now();
            match self.probe.probe(target).await {
                Ok(()) => {
                    info!(
                        "recovery: {} reachable after {:?}",
                        target,
                        probed_at - started
                    );
                    return Ok(());
                }
                Err(err) => trace!("recovery: probe of {} failed: {}", target, err),
            }
            if probed_at >= deadline_at {
                return Err(self.unreachable(target));
            }
        }
    }

    fn unreachable(&self, target: &Target) -> ProvisionError {
        error!(
            "recovery: {} still unreachable after {:?}",
            target, self.config.deadline
        );
        ProvisionError::UnreachableTimeout {
            target: target.to_string(),
            deadline: self.config.deadline,
        }
    }

    async fn reconnect(&self, session: &mut Session) -> Result<(), ProvisionError> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match session.reconnect().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(
                        "recovery: reconnect {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        session.target(),
                        err
                    );
                }
            }
            attempt += 1;
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use color_eyre::eyre::Result;

    use super::*;
    use crate::session::{ConnectionManager, CredentialSet};
    use crate::testing::ScriptedConnector;

    /// Fails every probe until `up_at` has passed on the tokio clock. A
    /// failing probe takes `latency` to give up, like a TCP connect timing out.
    #[derive(Debug)]
    struct ScheduledProbe {
        up_at: Instant,
        latency: Duration,
        probes: Mutex<Vec<Instant>>,
    }

    impl ScheduledProbe {
        fn after(delay: Duration) -> Self {
            Self {
                up_at: Instant::now() + delay,
                latency: Duration::ZERO,
                probes: Mutex::new(vec![]),
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn count(&self) -> usize {
            self.probes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Probe for ScheduledProbe {
        async fn probe(&self, _target: &Target) -> io::Result<()> {
            let now = Instant::now();
            self.probes.lock().unwrap().push(now);
            if now >= self.up_at {
                return Ok(());
            }
            tokio::time::sleep(self.latency).await;
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    fn config() -> RecoveryConfig {
        RecoveryConfig::default()
            .with_settle(Duration::ZERO)
            .with_poll_interval(Duration::from_secs(1))
            .with_deadline(Duration::from_secs(180))
    }

    async fn rebooting_session(connector: Arc<ScriptedConnector>) -> Result<Session> {
        let session = ConnectionManager::new(connector)
            .connect(
                Target::new("192.168.1.1", 22),
                CredentialSet::new("root").with_password("root"),
            )
            .await?;
        Ok(session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_back_at_deadline_recovers() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new().accept_password("root"));
        let mut session = rebooting_session(connector.clone()).await?;
        let probe = Arc::new(ScheduledProbe::after(Duration::from_secs(180)));
        let mut coordinator = RecoveryCoordinator::new(probe, config());

        coordinator.disrupt_and_recover(&mut session, "reboot").await?;

        assert_eq!(RecoveryState::Stable, coordinator.state());
        assert_eq!(
            &[
                RecoveryState::Stable,
                RecoveryState::Disrupting,
                RecoveryState::Unreachable,
                RecoveryState::Reconnecting,
                RecoveryState::Stable,
            ],
            coordinator.history()
        );
        assert!(session.is_connected());
        assert_eq!(2, connector.connects().len());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_back_after_deadline_fails() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new().accept_password("root"));
        let mut session = rebooting_session(connector.clone()).await?;
        let probe = Arc::new(ScheduledProbe::after(Duration::from_secs(181)));
        let mut coordinator = RecoveryCoordinator::new(probe.clone(), config());

        let err = coordinator
            .disrupt_and_recover(&mut session, "reboot")
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::UnreachableTimeout { .. }));
        assert_eq!(RecoveryState::Failed, coordinator.state());
        assert!(!coordinator.history().contains(&RecoveryState::Reconnecting));
        // One probe per second from 0 through 180 inclusive.
        assert_eq!(181, probe.count());
        assert!(!session.is_connected());
        assert_eq!(1, connector.connects().len());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probes_still_probe_at_the_deadline() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new().accept_password("root"));
        let mut session = rebooting_session(connector.clone()).await?;
        let probe = Arc::new(
            ScheduledProbe::after(Duration::from_secs(177)).with_latency(Duration::from_secs(5)),
        );
        let config = RecoveryConfig::default().with_settle(Duration::ZERO);
        let mut coordinator = RecoveryCoordinator::new(probe.clone(), config);

        let started = Instant::now();
        coordinator.disrupt_and_recover(&mut session, "reboot").await?;

        assert_eq!(RecoveryState::Stable, coordinator.state());
        let last = *probe.probes.lock().unwrap().last().unwrap();
        assert!(last - started <= Duration::from_secs(180));
        assert!(session.is_connected());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_keep_a_fixed_period() -> Result<()> {
        let probe = Arc::new(
            ScheduledProbe::after(Duration::from_secs(60))
                .with_latency(Duration::from_millis(1500)),
        );
        let config = RecoveryConfig::default()
            .with_settle(Duration::ZERO)
            .with_deadline(Duration::from_secs(10));
        let coordinator = RecoveryCoordinator::new(probe.clone(), config);

        let err = coordinator
            .wait_reachable(&Target::new("192.168.1.1", 22))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::UnreachableTimeout { .. }));
        // Started at 0, 2, 4, 6, 8 and 10 regardless of how long each took.
        let probes = probe.probes.lock().unwrap().clone();
        assert_eq!(6, probes.len());
        for pair in probes.windows(2) {
            assert_eq!(Duration::from_secs(2), pair[1] - pair[0]);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_then_surfaces_last_error() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new().accept_password("root"));
        let mut session = rebooting_session(connector.clone()).await?;
        // Clones share one script, so this reaches the session's connector.
        let _ = connector.as_ref().clone().fail_connects(3);
        let probe = Arc::new(ScheduledProbe::after(Duration::ZERO));
        let mut coordinator = RecoveryCoordinator::new(probe, config());

        let err = coordinator
            .disrupt_and_recover(&mut session, "reboot")
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Connectivity { .. }));
        assert_eq!(RecoveryState::Failed, coordinator.state());
        assert!(coordinator.history().contains(&RecoveryState::Reconnecting));
        // The initial connect plus three failed reconnects.
        assert_eq!(4, connector.connects().len());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_disruptive_command_that_hangs_is_cut_short() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new().accept_password("root"));
        let mut session = rebooting_session(connector).await?;
        let probe = Arc::new(ScheduledProbe::after(Duration::ZERO));
        let mut coordinator = RecoveryCoordinator::new(probe, config());

        let started = Instant::now();
        coordinator.disrupt_and_recover(&mut session, "hang").await?;

        assert_eq!(RecoveryState::Stable, coordinator.state());
        assert!(started.elapsed() >= *RecoveryConfig::default().disrupt_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let probe = TcpProbe::new(Duration::from_secs(1));

        probe.probe(&Target::new("127.0.0.1", port)).await?;
        drop(listener);
        assert!(probe.probe(&Target::new("127.0.0.1", port)).await.is_err());
        Ok(())
    }

    #[test]
    fn test_recovery_config_from_yaml() -> Result<()> {
        let config: RecoveryConfig = serde_yaml::from_str("deadline: 240\npoll_interval: 0.5\n")?;
        assert_eq!(Duration::from_secs(240), *config.deadline());
        assert_eq!(Duration::from_millis(500), *config.poll_interval());
        assert_eq!(3, *config.reconnect_attempts());
        Ok(())
    }
}
