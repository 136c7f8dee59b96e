use async_trait::async_trait;
use color_eyre::eyre::Result;

pub mod batch;
pub mod command;
pub mod runner;
pub mod simple;

pub use batch::{Batch, BatchExecutor, DelayPolicy, ExecutionMode};
pub use command::{Backoff, Capture, CommandResult, CommandSpec, ExitStatus, SuccessCheck};
pub use runner::Runner;

pub type Logs = Vec<String>;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PartialLogStream {
    Next(Logs),
    End,
}

/// Receives live command output as it is produced.
#[async_trait]
pub trait LogSink: std::fmt::Debug {
    async fn sink(&mut self, logs: PartialLogStream) -> Result<usize>;
}

#[async_trait]
pub trait LogSource: std::fmt::Debug {
    async fn source(&mut self) -> Result<PartialLogStream>;
}
