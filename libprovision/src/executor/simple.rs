//! Channel-backed [`LogSink`] and [`LogSource`].

use async_trait::async_trait;
use color_eyre::eyre::{eyre, Context, Result};
use tokio::sync::mpsc;

use super::{LogSink, LogSource, PartialLogStream};

pub type SimpleLogTx = mpsc::Sender<PartialLogStream>;
pub type SimpleLogRx = mpsc::Receiver<PartialLogStream>;

/// Cheap to clone; every clone feeds the same receiver.
#[derive(Debug, Clone)]
pub struct SimpleLogSink {
    tx: SimpleLogTx,
}

impl SimpleLogSink {
    pub fn new(tx: SimpleLogTx) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl LogSink for SimpleLogSink {
    #[tracing::instrument(skip(self))]
    async fn sink(&mut self, logs: PartialLogStream) -> Result<usize> {
        let out = match logs {
            PartialLogStream::Next(ref logs) => logs.len(),
            PartialLogStream::End => 0,
        };
        self.tx.send(logs).await.context("Failed sending logs")?;
        Ok(out)
    }
}

#[derive(Debug)]
pub struct SimpleLogSource {
    rx: SimpleLogRx,
    ended: bool,
}

impl SimpleLogSource {
    pub fn new(rx: SimpleLogRx) -> Self {
        Self { rx, ended: false }
    }
}

#[async_trait]
impl LogSource for SimpleLogSource {
    /// Waits for the next batch of logs. Once [`PartialLogStream::End`] has
    /// been seen, further calls fail.
    #[tracing::instrument(skip(self))]
    async fn source(&mut self) -> Result<PartialLogStream> {
        if self.ended {
            color_eyre::eyre::bail!("Log source already ended");
        }
        match self.rx.recv().await {
            Some(PartialLogStream::End) => {
                self.ended = true;
                Ok(PartialLogStream::End)
            }
            Some(next) => Ok(next),
            None => Err(eyre!("sink lost")),
        }
    }
}
