//! Ordered groups of commands, run sequentially or through a bounded pool.

use std::time::Duration;

use derive_getters::Getters;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::command::{CommandResult, CommandSpec};
use super::runner::Runner;
use crate::log::*;
use crate::plan::secs;
use crate::report::{ExecutionReport, Reporter};
use crate::session::Session;

pub const DEFAULT_POOL_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Pause between consecutive commands of a sequential batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    #[default]
    None,
    Fixed(#[serde(with = "secs")] Duration),
    /// Wait `success` after a command that succeeded, `failure` otherwise.
    Adaptive {
        #[serde(with = "secs")]
        success: Duration,
        #[serde(with = "secs")]
        failure: Duration,
    },
}

impl DelayPolicy {
    pub fn after(&self, succeeded: bool) -> Duration {
        match self {
            DelayPolicy::None => Duration::ZERO,
            DelayPolicy::Fixed(delay) => *delay,
            DelayPolicy::Adaptive { success, failure } => {
                if succeeded {
                    *success
                } else {
                    *failure
                }
            }
        }
    }
}

#[derive(Getters, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    name: String,
    #[serde(default)]
    mode: ExecutionMode,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    delay: DelayPolicy,
    commands: Vec<CommandSpec>,
}

impl Batch {
    pub fn new<S: Into<String>>(name: S, mode: ExecutionMode) -> Self {
        Self {
            name: name.into(),
            mode,
            delay: DelayPolicy::default(),
            commands: vec![],
        }
    }

    pub fn sequential<S: Into<String>>(name: S) -> Self {
        Self::new(name, ExecutionMode::Sequential)
    }

    pub fn parallel<S: Into<String>>(name: S) -> Self {
        Self::new(name, ExecutionMode::Parallel)
    }

    pub fn with_delay(mut self, delay: DelayPolicy) -> Self {
        self.delay = delay;
        self
    }

    pub fn add_command(&mut self, command: CommandSpec) -> &mut Self {
        debug!("batch {}: adding command '{}'", self.name, command.command());
        self.commands.push(command);
        self
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.add_command(command);
        self
    }
}

#[derive(Getters, Debug, Clone)]
pub struct BatchExecutor {
    runner: Runner,
    pool_size: usize,
}

impl BatchExecutor {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    #[tracing::instrument(skip(self, session, batch), fields(batch = %batch.name()))]
    pub async fn run_batch(&self, session: &mut Session, batch: &Batch) -> ExecutionReport {
        info!(
            "running batch '{}' ({} commands, {:?})",
            batch.name(),
            batch.commands().len(),
            batch.mode()
        );
        let mut reporter = Reporter::new();
        match batch.mode() {
            ExecutionMode::Sequential => self.run_sequential(session, batch, &mut reporter).await,
            ExecutionMode::Parallel => self.run_parallel(session, batch, &mut reporter).await,
        }
        reporter.finalize()
    }

    async fn run_sequential(&self, session: &mut Session, batch: &Batch, reporter: &mut Reporter) {
        let count = batch.commands().len();
        for (position, spec) in batch.commands().iter().enumerate() {
            let result = self.runner.run(session, spec).await;
            let succeeded = result.is_success();
            reporter.record(batch.name(), position, result);

            if !succeeded && *spec.fatal() {
                error!(
                    "batch '{}': fatal command '{}' failed, skipping {} remaining",
                    batch.name(),
                    spec.command(),
                    count - position - 1
                );
                reporter.mark_aborted();
                break;
            }
            if position + 1 < count {
                let delay = batch.delay().after(succeeded);
                if !delay.is_zero() {
                    trace!("batch '{}': sleeping {:?}", batch.name(), delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Every command gets its own session from the manager that produced
    /// `session`, so no two commands share a transport.
    async fn run_parallel(&self, session: &mut Session, batch: &Batch, reporter: &mut Reporter) {
        let permits = Semaphore::new(self.pool_size);
        let mut in_flight = FuturesUnordered::new();
        for (position, spec) in batch.commands().iter().enumerate() {
            let mut worker = session
                .manager()
                .detached(session.target().clone(), session.credentials().clone());
            let permits = &permits;
            let runner = &self.runner;
            in_flight.push(async move {
                let _permit = permits.acquire().await;
                let result = runner.run(&mut worker, spec).await;
                worker.close().await;
                (position, result)
            });
        }

        let mut results: Vec<(usize, CommandResult)> = Vec::with_capacity(batch.commands().len());
        while let Some(done) = in_flight.next().await {
            results.push(done);
        }
        results.sort_by_key(|(position, _)| *position);
        for (position, result) in results {
            reporter.record(batch.name(), position, result);
        }
    }
}
