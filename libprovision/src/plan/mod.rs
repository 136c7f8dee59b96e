//! Provisioning plans: an ordered list of [`Step`]s to apply to a set of
//! hosts. Plans are plain data, usually read from YAML; [`crate::apply`] is
//! what runs them.

use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::executor::{Batch, CommandSpec, ExecutionMode};
use crate::log::*;
use crate::recovery::RecoveryConfig;

pub mod host;

use self::host::HostConfig;

/// Serde adapter for [`Duration`]s written as (possibly fractional) seconds.
pub mod secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration of {} seconds: {}", secs, e)))
    }
}

pub const DEFAULT_WAIT_ATTEMPTS: u32 = 10;
pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_secs(2);

fn default_wait_attempts() -> u32 {
    DEFAULT_WAIT_ATTEMPTS
}

fn default_wait_delay() -> Duration {
    DEFAULT_WAIT_DELAY
}

fn default_reboot_command() -> String {
    "reboot".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Commands run through the batch executor.
    Batch(Batch),
    /// Re-run a status query until its success check passes.
    WaitFor {
        name: String,
        command: CommandSpec,
        #[serde(default = "default_wait_attempts")]
        attempts: u32,
        #[serde(default = "default_wait_delay", with = "secs")]
        delay: Duration,
    },
    /// Issue a disruptive command and wait for the host to come back.
    Reboot {
        name: String,
        #[serde(default = "default_reboot_command")]
        command: String,
        #[serde(default)]
        recovery: RecoveryConfig,
    },
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Batch(batch) => batch.name(),
            Step::WaitFor { name, .. } => name,
            Step::Reboot { name, .. } => name,
        }
    }
}

#[derive(Getters, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    name: String,
    /// Host and group names. Empty means every known host.
    #[serde(default)]
    hosts: Vec<String>,
    steps: Vec<Step>,
}

impl Plan {
    pub fn new<S: Into<String>>(name: S, hosts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hosts,
            steps: vec![],
        }
    }

    #[tracing::instrument(skip(self, step), fields(step = %step.name()))]
    pub fn add_step(&mut self, step: Step) {
        debug!("plan {}: added step", self.name);
        self.steps.push(step);
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.add_step(step);
        self
    }

    /// Every problem found in this plan, checked against `hosts`. An empty
    /// list means the plan can be applied.
    pub fn validate(&self, hosts: &HostConfig) -> Vec<String> {
        let mut errors = vec![];
        if let Err(e) = hosts.resolve(&self.hosts) {
            errors.push(e.to_string());
        }
        if self.steps.is_empty() {
            errors.push(format!("plan '{}' has no steps", self.name));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let at = format!("step {} ('{}')", index + 1, step.name());
            match step {
                Step::Batch(batch) => {
                    if batch.commands().is_empty() {
                        errors.push(format!("{}: batch has no commands", at));
                    }
                    for (position, command) in batch.commands().iter().enumerate() {
                        let at = format!("{}, command {}", at, position + 1);
                        validate_command(&at, command, &mut errors);
                        if *command.fatal() && *batch.mode() == ExecutionMode::Parallel {
                            errors.push(format!(
                                "{}: fatal commands are only honoured in sequential batches",
                                at
                            ));
                        }
                    }
                }
                Step::WaitFor {
                    command, attempts, ..
                } => {
                    validate_command(&at, command, &mut errors);
                    if *attempts == 0 {
                        errors.push(format!("{}: attempts must be at least 1", at));
                    }
                }
                Step::Reboot {
                    command, recovery, ..
                } => {
                    validate_command_line(&at, command, &mut errors);
                    if recovery.deadline().is_zero() {
                        errors.push(format!("{}: recovery deadline must be positive", at));
                    }
                }
            }
        }
        errors
    }
}

fn validate_command(at: &str, spec: &CommandSpec, errors: &mut Vec<String>) {
    validate_command_line(at, spec.command(), errors);
    if spec.timeout().is_zero() {
        errors.push(format!("{}: timeout must be positive", at));
    }
}

fn validate_command_line(at: &str, command: &str, errors: &mut Vec<String>) {
    match shell_words::split(command) {
        Ok(words) if words.is_empty() => errors.push(format!("{}: command is empty", at)),
        Ok(_) => {}
        Err(e) => errors.push(format!("{}: cannot parse '{}': {}", at, command, e)),
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;
    use crate::executor::SuccessCheck;
    use crate::plan::host::Host;

    const PLAN: &str = r#"
name: zerotier-gateway
hosts:
  - routers
steps:
  - type: batch
    name: packages
    commands:
      - command: opkg update
        timeout: 120
      - command: opkg install zerotier
        fatal: true
  - type: wait_for
    name: zerotier device
    command:
      command: zerotier-cli get 56374ac9a4f632db portDeviceName
      success:
        stdout_lacks: unknown
    attempts: 5
  - type: reboot
    name: apply firewall
    recovery:
      deadline: 240
"#;

    fn hosts() -> HostConfig {
        HostConfig::new()
            .with_host("edge-1", Host::new("192.168.1.1"))
            .with_host("edge-2", Host::new("192.168.2.1"))
            .with_group("routers", vec!["edge-1".into(), "edge-2".into()])
    }

    #[test]
    fn test_plan_from_yaml() -> Result<()> {
        let plan: Plan = serde_yaml::from_str(PLAN)?;

        assert_eq!("zerotier-gateway", plan.name());
        assert_eq!(3, plan.steps().len());
        match &plan.steps()[0] {
            Step::Batch(batch) => {
                assert_eq!(Duration::from_secs(120), *batch.commands()[0].timeout());
                assert!(*batch.commands()[1].fatal());
            }
            other => panic!("expected batch, got {:?}", other),
        }
        match &plan.steps()[1] {
            Step::WaitFor {
                command,
                attempts,
                delay,
                ..
            } => {
                assert_eq!(5, *attempts);
                assert_eq!(DEFAULT_WAIT_DELAY, *delay);
                assert_eq!(SuccessCheck::StdoutLacks("unknown".into()), *command.success());
            }
            other => panic!("expected wait_for, got {:?}", other),
        }
        match &plan.steps()[2] {
            Step::Reboot {
                command, recovery, ..
            } => {
                assert_eq!("reboot", command);
                assert_eq!(Duration::from_secs(240), *recovery.deadline());
                assert_eq!(RecoveryConfig::default().poll_interval(), recovery.poll_interval());
            }
            other => panic!("expected reboot, got {:?}", other),
        }
        assert!(plan.validate(&hosts()).is_empty());
        Ok(())
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let plan = Plan::new("broken", vec!["edge-9".into()])
            .with_step(Step::Batch(
                Batch::parallel("packages")
                    .with_command(CommandSpec::new("   "))
                    .with_command(CommandSpec::new("echo 'unterminated"))
                    .with_command(CommandSpec::new("opkg update").into_fatal())
                    .with_command(CommandSpec::new("true").with_timeout(Duration::ZERO)),
            ))
            .with_step(Step::Batch(Batch::sequential("empty")))
            .with_step(Step::WaitFor {
                name: "never".into(),
                command: CommandSpec::new("true"),
                attempts: 0,
                delay: DEFAULT_WAIT_DELAY,
            });

        let errors = plan.validate(&hosts());

        assert_eq!(7, errors.len(), "{:#?}", errors);
        assert!(errors[0].contains("edge-9"));
        assert!(errors.iter().any(|e| e.contains("command is empty")));
        assert!(errors.iter().any(|e| e.contains("cannot parse")));
        assert!(errors.iter().any(|e| e.contains("sequential batches")));
        assert!(errors.iter().any(|e| e.contains("timeout must be positive")));
        assert!(errors.iter().any(|e| e.contains("batch has no commands")));
        assert!(errors.iter().any(|e| e.contains("attempts must be at least 1")));
    }

    #[test]
    fn test_negative_durations_are_rejected() {
        let parsed: Result<CommandSpec, _> =
            serde_yaml::from_str("command: \"true\"\ntimeout: -1\n");
        assert!(parsed.is_err());
    }
}
