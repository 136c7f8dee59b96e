//! A single remote command: what to run, how to judge it, and what came back.

use std::fmt;
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use super::{LogSink, PartialLogStream};
use crate::executor::simple::SimpleLogSink;
use crate::log::*;
use crate::plan::secs;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

fn default_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// How long to wait before retry number `n` (1-based) after a transport
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed(#[serde(with = "secs")] Duration),
    /// `base * n`.
    Linear(#[serde(with = "secs")] Duration),
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(base) => base.saturating_mul(retry.max(1)),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear(DEFAULT_RETRY_DELAY)
    }
}

/// Decides whether a finished command succeeded. Anything other than
/// [`SuccessCheck::ExitZero`] replaces the exit status test, for status
/// queries that always exit 0 and print a sentinel instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCheck {
    #[default]
    ExitZero,
    StdoutContains(String),
    StdoutLacks(String),
    StdoutNonEmpty,
}

impl SuccessCheck {
    /// Commands that timed out or lost their exit status never succeed: only
    /// observed completions count.
    pub fn evaluate(&self, status: ExitStatus, stdout: &str) -> bool {
        let ExitStatus::Code(code) = status else {
            return false;
        };
        match self {
            SuccessCheck::ExitZero => code == 0,
            SuccessCheck::StdoutContains(needle) => stdout.contains(needle.as_str()),
            SuccessCheck::StdoutLacks(needle) => !stdout.contains(needle.as_str()),
            SuccessCheck::StdoutNonEmpty => !stdout.trim().is_empty(),
        }
    }
}

/// A command plus its execution policy.
#[derive(Getters, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    command: String,
    #[serde(default = "default_timeout", with = "secs")]
    timeout: Duration,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    backoff: Backoff,
    /// A failure aborts the rest of a sequential batch.
    #[serde(default)]
    fatal: bool,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    success: SuccessCheck,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff: Backoff::default(),
            fatal: false,
            success: SuccessCheck::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_success(mut self, success: SuccessCheck) -> Self {
        self.success = success;
        self
    }

    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    /// The command outlived its timeout.
    Timeout,
    /// The command ended without reporting a status (signal, lost channel).
    Unknown,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit {}", code),
            ExitStatus::Timeout => f.write_str("timeout"),
            ExitStatus::Unknown => f.write_str("unknown"),
        }
    }
}

/// Output collected from one command, optionally mirrored to a log sink as
/// it arrives. Only whole lines reach the sink until [`Capture::flush`].
#[derive(Debug, Default)]
pub struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    sink: Option<SimpleLogSink>,
    partial_stdout: Vec<u8>,
    partial_stderr: Vec<u8>,
}

/// Move every complete line out of `partial`, leaving the unterminated tail.
fn take_lines(partial: &mut Vec<u8>) -> Vec<String> {
    let Some(end) = partial.iter().rposition(|&b| b == b'\n') else {
        return vec![];
    };
    let complete: Vec<u8> = partial.drain(..=end).collect();
    String::from_utf8_lossy(&complete[..end])
        .split('\n')
        .map(|line| line.to_string())
        .collect()
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Option<SimpleLogSink>) -> Self {
        Self {
            sink,
            ..Self::default()
        }
    }

    pub async fn push_stdout(&mut self, chunk: &[u8]) {
        self.stdout.extend_from_slice(chunk);
        if self.sink.is_some() {
            self.partial_stdout.extend_from_slice(chunk);
            let lines = take_lines(&mut self.partial_stdout);
            self.forward(lines).await;
        }
    }

    pub async fn push_stderr(&mut self, chunk: &[u8]) {
        self.stderr.extend_from_slice(chunk);
        if self.sink.is_some() {
            self.partial_stderr.extend_from_slice(chunk);
            let lines = take_lines(&mut self.partial_stderr);
            self.forward(lines).await;
        }
    }

    /// Send whatever unterminated output is still buffered.
    pub async fn flush(&mut self) {
        let mut lines = vec![];
        for partial in [&mut self.partial_stdout, &mut self.partial_stderr] {
            if !partial.is_empty() {
                lines.push(String::from_utf8_lossy(partial).into_owned());
                partial.clear();
            }
        }
        self.forward(lines).await;
    }

    /// Mirror a `$ command` line to the sink, if any.
    pub async fn announce(&mut self, command: &str) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink
                .sink(PartialLogStream::Next(vec![format!("$ {}", command)]))
                .await
            {
                error!("error sinking logs: {}", err);
            }
        }
    }

    async fn forward(&mut self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(err) = sink.sink(PartialLogStream::Next(lines)).await {
            error!("error sinking logs: {}", err);
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The outcome of running one [`CommandSpec`]. When retries happened, this
/// describes the last attempt only.
#[derive(Getters, Debug, Clone, Serialize)]
pub struct CommandResult {
    command: String,
    exit_status: ExitStatus,
    stdout: String,
    stderr: String,
    #[serde(with = "secs")]
    elapsed: Duration,
    retries: u32,
    success: bool,
    /// Set when the transport failed and the retry budget ran out.
    error: Option<String>,
}

impl CommandResult {
    /// A command that ran to completion or timed out.
    pub fn observed(
        spec: &CommandSpec,
        exit_status: ExitStatus,
        capture: &Capture,
        elapsed: Duration,
        retries: u32,
    ) -> Self {
        let stdout = capture.stdout_text();
        let success = spec.success().evaluate(exit_status, &stdout);
        Self {
            command: spec.command().clone(),
            exit_status,
            stdout,
            stderr: capture.stderr_text(),
            elapsed,
            retries,
            success,
            error: None,
        }
    }

    /// A command that could not be run at all.
    pub fn abandoned<S: Into<String>>(
        spec: &CommandSpec,
        error: S,
        elapsed: Duration,
        retries: u32,
    ) -> Self {
        Self {
            command: spec.command().clone(),
            exit_status: ExitStatus::Unknown,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
            retries,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn timed_out(&self) -> bool {
        self.exit_status == ExitStatus::Timeout
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use tokio::sync::mpsc;

    use super::*;
    use crate::executor::simple::SimpleLogSource;
    use crate::executor::LogSource;

    #[test]
    fn test_exit_zero_is_the_default_success_signal() {
        let check = SuccessCheck::default();
        assert!(check.evaluate(ExitStatus::Code(0), ""));
        assert!(!check.evaluate(ExitStatus::Code(1), ""));
        assert!(!check.evaluate(ExitStatus::Timeout, ""));
        assert!(!check.evaluate(ExitStatus::Unknown, ""));
    }

    #[test]
    fn test_stdout_checks_replace_exit_status() {
        let lacks = SuccessCheck::StdoutLacks("unknown".into());
        assert!(!lacks.evaluate(ExitStatus::Code(0), "unknown\n"));
        assert!(lacks.evaluate(ExitStatus::Code(0), "ztabcdef12\n"));
        assert!(lacks.evaluate(ExitStatus::Code(1), "ztabcdef12\n"));
        assert!(!lacks.evaluate(ExitStatus::Timeout, "ztabcdef12\n"));

        let contains = SuccessCheck::StdoutContains("mwan3".into());
        assert!(contains.evaluate(ExitStatus::Code(1), "mwan3 - 2.10\n"));

        assert!(!SuccessCheck::StdoutNonEmpty.evaluate(ExitStatus::Code(0), " \n"));
    }

    #[test]
    fn test_backoff_growth() {
        let linear = Backoff::Linear(Duration::from_secs(2));
        assert_eq!(Duration::from_secs(2), linear.delay(1));
        assert_eq!(Duration::from_secs(6), linear.delay(3));
        let fixed = Backoff::Fixed(Duration::from_millis(500));
        assert_eq!(Duration::from_millis(500), fixed.delay(4));
    }

    #[test]
    fn test_command_spec_defaults_from_yaml() {
        let spec: CommandSpec = serde_yaml::from_str("command: opkg update\n").unwrap();
        assert_eq!(CommandSpec::new("opkg update"), spec);

        let spec: CommandSpec = serde_yaml::from_str(
            "command: zerotier-cli info\ntimeout: 2.5\nretries: 0\nfatal: true\nbackoff:\n  fixed: 1\nsuccess:\n  stdout_lacks: unknown\n",
        )
        .unwrap();
        assert_eq!(Duration::from_millis(2500), *spec.timeout());
        assert_eq!(0, *spec.retries());
        assert!(*spec.fatal());
        assert_eq!(Backoff::Fixed(Duration::from_secs(1)), *spec.backoff());
        assert_eq!(SuccessCheck::StdoutLacks("unknown".into()), *spec.success());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks_are_joined() -> Result<()> {
        let (tx, rx) = mpsc::channel(16);
        let mut log_source = SimpleLogSource::new(rx);
        let mut capture = Capture::with_sink(Some(SimpleLogSink::new(tx)));

        capture.push_stdout(b"Collected err").await;
        capture.push_stdout(b"ors: 0\nconfigur").await;
        capture.push_stderr(b"warning\n").await;
        capture.push_stdout(b"ing zerotier\n\ndone").await;
        capture.flush().await;

        let mut lines = vec![];
        for _ in 0..4 {
            match log_source.source().await? {
                PartialLogStream::Next(next) => lines.extend(next),
                PartialLogStream::End => break,
            }
        }
        assert_eq!(
            vec!["Collected errors: 0", "warning", "configuring zerotier", "", "done"],
            lines
        );
        assert_eq!("Collected errors: 0\nconfiguring zerotier\n\ndone", capture.stdout_text());
        Ok(())
    }

    #[test]
    fn test_unit_success_check_is_a_plain_string() {
        let spec: CommandSpec =
            serde_yaml::from_str("command: uci get network.wan
success: stdout_non_empty
")
                .unwrap();
        assert_eq!(SuccessCheck::StdoutNonEmpty, *spec.success());

        let yaml = serde_yaml::to_string(&spec).unwrap();
        assert!(yaml.contains("success: stdout_non_empty"));
        assert!(yaml.contains("backoff:\n  linear: "));
        assert!(!yaml.contains('!'));
    }
}
