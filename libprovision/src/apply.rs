//! Applying a [`Plan`] to one host.

use std::sync::Arc;

use derive_getters::Getters;

use crate::executor::BatchExecutor;
use crate::log::*;
use crate::plan::{Plan, Step};
use crate::recovery::{Probe, RecoveryCoordinator};
use crate::report::{ExecutionReport, Reporter};
use crate::session::{ConnectionManager, CredentialSet, Session, Target};

#[derive(Getters, Debug, Clone)]
pub struct Applier {
    manager: ConnectionManager,
    executor: BatchExecutor,
    #[getter(skip)]
    probe: Arc<dyn Probe>,
}

impl Applier {
    pub fn new(manager: ConnectionManager, executor: BatchExecutor, probe: Arc<dyn Probe>) -> Self {
        Self {
            manager,
            executor,
            probe,
        }
    }

    /// Connect to `target` and run every step of `plan` in order. A report is
    /// always produced; if the host cannot be reached at all it is empty,
    /// aborted, and carries the connection error.
    #[tracing::instrument(skip(self, plan, credentials), fields(plan = %plan.name()))]
    pub async fn apply(
        &self,
        plan: &Plan,
        target: Target,
        credentials: CredentialSet,
    ) -> ExecutionReport {
        let mut reporter = Reporter::new();
        match self.manager.connect(target, credentials).await {
            Ok(mut session) => {
                self.run_steps(plan, &mut session, &mut reporter).await;
                session.close().await;
            }
            Err(err) => {
                error!("apply: {}", err);
                reporter.record_error(err.to_string());
                reporter.mark_aborted();
            }
        }
        reporter.finalize()
    }

    async fn run_steps(&self, plan: &Plan, session: &mut Session, reporter: &mut Reporter) {
        let count = plan.steps().len();
        for (index, step) in plan.steps().iter().enumerate() {
            info!(
                "apply: [{}] step {}/{}: {}",
                session.target(),
                index + 1,
                count,
                step.name()
            );
            let proceed = match step {
                Step::Batch(batch) => {
                    let report = self.executor.run_batch(session, batch).await;
                    let aborted = report.aborted();
                    reporter.absorb(report);
                    !aborted
                }
                Step::WaitFor {
                    name,
                    command,
                    attempts,
                    delay,
                } => {
                    let result = self
                        .executor
                        .runner()
                        .poll_until(session, command, *attempts, *delay)
                        .await;
                    let succeeded = result.is_success();
                    if !succeeded {
                        warn!("apply: '{}' never reached its expected state", name);
                    }
                    reporter.record(name.clone(), 0, result);
                    succeeded || !*command.fatal()
                }
                Step::Reboot {
                    name,
                    command,
                    recovery,
                } => {
                    let mut coordinator =
                        RecoveryCoordinator::new(self.probe.clone(), recovery.clone())
                            .with_runner(self.executor.runner().clone());
                    match coordinator.disrupt_and_recover(session, command).await {
                        Ok(()) => true,
                        Err(err) => {
                            error!("apply: '{}' failed: {}", name, err);
                            reporter.record_error(format!("{}: {}", name, err));
                            false
                        }
                    }
                }
            };
            if !proceed {
                warn!(
                    "apply: stopping plan '{}' at step {} of {}",
                    plan.name(),
                    index + 1,
                    count
                );
                reporter.mark_aborted();
                return;
            }
        }
    }
}
