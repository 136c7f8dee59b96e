use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use provision::apply::Applier;
use provision::executor::batch::DEFAULT_POOL_SIZE;
use provision::executor::simple::{SimpleLogSink, SimpleLogSource};
use provision::executor::{BatchExecutor, LogSink, LogSource, PartialLogStream, Runner};
use provision::log::*;
use provision::plan::host::{ExecutorKind, Host, HostConfig};
use provision::plan::{Plan, Step};
use provision::recovery::TcpProbe;
use provision::report::ExecutionReport;
use provision::session::process::{LocalConnector, OpenSshConnector};
use provision::session::ssh::SshConnector;
use provision::session::{ConnectionManager, Connector};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::mpsc;

use super::{CommandErrors, Interactive};

/// Command-line credentials layered over what the hosts file says.
#[derive(Default)]
struct CredentialOverrides {
    key: Option<PathBuf>,
    passphrase: Option<String>,
    password: Option<String>,
    force_password: bool,
}

impl CredentialOverrides {
    fn apply(&self, host: &Host) -> Host {
        let mut host = host.clone();
        if let Some(key) = &self.key {
            host = host.with_key(key.clone());
        }
        if let Some(password) = &self.password {
            host = host.with_password(password.clone());
        }
        if self.force_password {
            host = host.with_force_password(true);
        }
        host
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    plan: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    generated_at: OffsetDateTime,
    hosts: &'a BTreeMap<String, ExecutionReport>,
}

pub struct PlanCommand;

impl PlanCommand {
    async fn read_hosts_config<S: Into<String>>(&self, path: S) -> Result<HostConfig> {
        let hosts = fs::read_to_string(path.into())
            .await
            .context("Failed reading hosts file")?;
        serde_yaml::from_str(hosts.as_str()).context("deserializing hosts config")
    }

    async fn read_plan<S: Into<String>>(&self, path: S) -> Result<Plan> {
        let plan = fs::read_to_string(path.into())
            .await
            .context("Failed reading plan file")?;
        serde_yaml::from_str(plan.as_str()).context("Failed deserializing plan")
    }

    /// Read the plan and hosts files named in `matches` and validate one
    /// against the other.
    async fn load<'a>(&self, matches: &'a ArgMatches) -> Result<(Plan, HostConfig)> {
        let file = self.read_existing_file_argument(matches, "file")?;
        let hosts_file = self.read_existing_file_argument(matches, "hosts")?;
        let hosts = self.read_hosts_config(hosts_file).await?;
        let plan = self.read_plan(file).await?;

        let errors = plan.validate(&hosts);
        if !errors.is_empty() {
            error!("plan is invalid.");
            println!("* plan '{}' is invalid:", plan.name());
            for error in &errors {
                println!("** {}", error);
            }
            return Err(CommandErrors::InvalidPlan(errors.len()).into());
        }
        Ok((plan, hosts))
    }

    async fn subcommand_validate<'a>(
        &self,
        _context: &'a super::CliContext<'a>,
        matches: &'a ArgMatches,
    ) -> Result<()> {
        let (plan, hosts) = self.load(matches).await?;
        info!("plan is valid.");
        println!("* plan '{}' is valid.", plan.name());
        println!("** hosts:");
        for name in hosts.resolve(plan.hosts())? {
            let host = hosts
                .hosts()
                .get(&name)
                .ok_or_else(|| CommandErrors::UnknownHost(name.clone()))?;
            println!(
                "*** {}: {}@{} ({})",
                name,
                host.user(),
                host.target(),
                host.executor()
            );
        }
        Ok(())
    }

    fn print_dry_run(&self, plan: &Plan, hosts: &[String]) {
        println!("*** plan: {} ***\n", plan.name());
        println!("* hosts: {}", hosts.join(", "));
        for step in plan.steps() {
            match step {
                Step::Batch(batch) => {
                    println!(
                        "* {} ({:?}, {} commands)",
                        batch.name(),
                        batch.mode(),
                        batch.commands().len()
                    );
                    for command in batch.commands() {
                        println!("** {}", command.command());
                    }
                }
                Step::WaitFor {
                    name,
                    command,
                    attempts,
                    delay,
                } => {
                    println!(
                        "* {}: wait for `{}` ({} attempts, {:?} apart)",
                        name,
                        command.command(),
                        attempts,
                        delay
                    );
                }
                Step::Reboot {
                    name,
                    command,
                    recovery,
                } => {
                    println!(
                        "* {}: `{}`, then reconnect within {:?}",
                        name,
                        command,
                        recovery.deadline()
                    );
                }
            }
        }
    }

    fn credential_overrides<'a>(&self, matches: &'a ArgMatches) -> Result<CredentialOverrides> {
        let passphrase = match matches.get_one::<String>("ssh-key-passphrase") {
            Some(path) => {
                let passphrase = std::fs::read_to_string(path)
                    .context("Failed to read ssh key passphrase")?;
                Some(passphrase.trim_end_matches(['\r', '\n']).to_string())
            }
            None => None,
        };
        let password = if matches.get_flag("ask-password") {
            Some(self.prompt_for_password("SSH password")?)
        } else {
            matches.get_one::<String>("password").cloned()
        };
        Ok(CredentialOverrides {
            key: matches.get_one::<String>("ssh-key").map(PathBuf::from),
            passphrase,
            password,
            force_password: matches.get_flag("force-password"),
        })
    }

    async fn subcommand_apply<'a>(
        &self,
        _context: &'a super::CliContext<'a>,
        matches: &'a ArgMatches,
    ) -> Result<()> {
        let (plan, hosts) = self.load(matches).await?;
        let names = hosts.resolve(plan.hosts())?;

        if matches.get_flag("dry") {
            self.print_dry_run(&plan, &names);
            return Ok(());
        }

        let overrides = self.credential_overrides(matches)?;
        let workers = matches
            .get_one::<usize>("workers")
            .copied()
            .unwrap_or(DEFAULT_POOL_SIZE);

        info!("applying plan...");
        let mut in_flight = FuturesUnordered::new();
        for name in &names {
            let host = hosts
                .hosts()
                .get(name)
                .ok_or_else(|| CommandErrors::UnknownHost(name.clone()))?;
            let host = overrides.apply(host);
            in_flight.push(self.do_apply(
                &plan,
                name.clone(),
                host,
                overrides.passphrase.clone(),
                workers,
            ));
        }
        let mut reports = BTreeMap::new();
        while let Some(done) = in_flight.next().await {
            let (name, report) = done?;
            reports.insert(name, report);
        }
        info!("done!");

        self.print_summary(&reports);
        if let Some(path) = matches.get_one::<String>("report") {
            let json = JsonReport {
                plan: plan.name(),
                generated_at: OffsetDateTime::now_utc(),
                hosts: &reports,
            };
            let json = serde_json::to_string_pretty(&json).context("Failed serializing report")?;
            fs::write(path, json)
                .await
                .with_context(|| format!("Failed writing report to {}", path))?;
            println!("* report written to {}", path);
        }

        let failed = reports.values().filter(|report| !report.is_success()).count();
        if failed > 0 {
            return Err(CommandErrors::HostsFailed(failed, reports.len()).into());
        }
        Ok(())
    }

    fn print_summary(&self, reports: &BTreeMap<String, ExecutionReport>) {
        println!("*** summary ***");
        for (name, report) in reports {
            let summary = report.summary();
            println!(
                "* {}: {}/{} commands succeeded in {:.1}s{}",
                name,
                summary.succeeded(),
                summary.total(),
                report.wall_time().as_secs_f64(),
                if report.aborted() { " (aborted)" } else { "" }
            );
            if let Some(error) = report.error() {
                println!("** error: {}", error);
            }
            for entry in report.failures() {
                let result = entry.result();
                let detail = match result.error() {
                    Some(error) => error.clone(),
                    None => result.stderr().lines().next().unwrap_or("").to_string(),
                };
                println!(
                    "** {}[{}] `{}`: {} {}",
                    entry.batch(),
                    entry.position(),
                    result.command(),
                    result.exit_status(),
                    detail
                );
            }
        }
    }

    #[tracing::instrument(skip(self, plan, host, passphrase))]
    async fn do_apply(
        &self,
        plan: &Plan,
        name: String,
        host: Host,
        passphrase: Option<String>,
        workers: usize,
    ) -> Result<(String, ExecutionReport)> {
        let (tx, rx) = mpsc::channel(1024);
        let mut log_source = SimpleLogSource::new(rx);
        let prefix = name.clone();
        let join_handle = tokio::task::spawn(async move {
            'outer: while let Ok(partial_stream) = log_source.source().await {
                match partial_stream {
                    PartialLogStream::Next(logs) => {
                        for log in logs {
                            println!("[{}] {}", prefix, log);
                        }
                    }
                    PartialLogStream::End => {
                        break 'outer;
                    }
                }
            }
            debug!("log printer for {} finished", prefix);
        });

        let connector: Arc<dyn Connector> = match host.executor() {
            ExecutorKind::Ssh => Arc::new(SshConnector::new()),
            ExecutorKind::Openssh => Arc::new(OpenSshConnector::new()),
            ExecutorKind::Local => Arc::new(LocalConnector::new()),
        };
        let mut sink = SimpleLogSink::new(tx);
        let applier = Applier::new(
            ConnectionManager::new(connector),
            BatchExecutor::new(Runner::with_log_sink(sink.clone())).with_pool_size(workers),
            Arc::new(TcpProbe::default()),
        );

        println!(
            "*** applying plan '{}' to {} ({}) ***",
            plan.name(),
            name,
            host.target()
        );
        let report = applier
            .apply(plan, host.target(), host.credentials(passphrase))
            .await;
        sink.sink(PartialLogStream::End).await?;
        join_handle.await?;
        info!("finished applying plan to {}", name);
        Ok((name, report))
    }
}

#[async_trait]
impl<'a> super::Command<'a> for PlanCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("validate", matches)) => {
                self.subcommand_validate(context, matches).await?;
            }
            Some(("apply", matches)) => {
                self.subcommand_apply(context, matches).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}

impl<'a> super::Interactive<'a> for PlanCommand {}
