//! Command dispatch and terminal output

use std::collections::BTreeMap;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::options::{AddHostArgs, Cli, Command, DeployArgs, HostsArgs, InventoryCommand, StopArgs};
use crate::app::state::AppState;
use crate::engine::lifecycle::{stop_clients, verify_clients};
use crate::engine::{PlanRun, RunStatus};
use crate::errors::OrchestratorError;
use crate::inventory::export::render_ansible_ini;
use crate::inventory::proxmox;
use crate::models::host::Host;
use crate::models::step::{StepOutcome, StepPlan};
use crate::resolver::TargetResolver;
use crate::state::{StateStore, StepRecord};
use crate::utils::version_info;

/// Run one CLI command; returns the process exit code
pub async fn run(cli: Cli, app: AppState) -> Result<i32, OrchestratorError> {
    match cli.command {
        Command::Deploy(args) => deploy(&app, args).await,
        Command::Plan(args) => {
            let plan = TargetResolver::new(&app.inventory).plan(&args.to_request())?;
            print_plan(&plan);
            Ok(0)
        }
        Command::Status(args) => status(&app, args).await,
        Command::Stop(args) => stop(&app, args, false).await,
        Command::Verify(args) => stop(&app, args, true).await,
        Command::Clean(args) => clean(&app, args).await,
        Command::Inventory(command) => inventory(&app, command).await,
        Command::ResetState { confirm } => reset_state(&app, confirm).await,
        command @ (Command::Version | Command::Check) => Ok(run_standalone(&command)?.unwrap_or(0)),
    }
}

/// Commands that need neither the inventory nor the state directory
pub fn run_standalone(command: &Command) -> Result<Option<i32>, OrchestratorError> {
    match command {
        Command::Version => {
            println!("{}", serde_json::to_string_pretty(&version_info())?);
            Ok(Some(0))
        }
        Command::Check => Ok(Some(check())),
        _ => Ok(None),
    }
}

async fn deploy(app: &AppState, args: DeployArgs) -> Result<i32, OrchestratorError> {
    let request = args.request.to_request();
    let policy = args.policy.to_policy(&app.settings);

    // Resolution failures abort here, before anything touches a host.
    let plan = TargetResolver::new(&app.inventory)
        .with_verify(args.verify)
        .plan(&request)?;
    let state = app.state_store().await?;
    let signals = SignalGuard::watch();
    let engine = app.engine(state)?.with_interrupt(signals.interrupt.clone());
    let run = engine.run(&plan, &policy, &signals.cancel).await?;

    print_summary(&run);
    Ok(run.exit_code())
}

/// `stop`, or `verify` when `verify` is set
async fn stop(app: &AppState, args: StopArgs, verify: bool) -> Result<i32, OrchestratorError> {
    let request = args.request.to_request();
    let policy = args.policy.to_policy(&app.settings);
    let state = app.state_store().await?;
    let signals = SignalGuard::watch();
    let engine = app.engine(state)?.with_interrupt(signals.interrupt.clone());

    let run = if verify {
        verify_clients(&engine, &app.inventory, &request, &args.hosts, &policy, &signals.cancel).await?
    } else {
        stop_clients(&engine, &app.inventory, &request, &args.hosts, &policy, &signals.cancel).await?
    };
    let Some(run) = run else {
        println!("No hosts are running {} on {}", request.client(), request.network());
        return Ok(0);
    };

    print_summary(&run);
    Ok(run.exit_code())
}

/// Cooperative cancellation on Ctrl-C / SIGTERM for the guard's lifetime
///
/// The first signal cancels `cancel` so no new steps start; a second one
/// cancels `interrupt`, aborting the steps in flight.
struct SignalGuard {
    cancel: CancellationToken,
    interrupt: CancellationToken,
    watcher: tokio::task::JoinHandle<()>,
}

impl SignalGuard {
    fn watch() -> Self {
        let cancel = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let watcher = tokio::spawn(watch_signals(cancel.clone(), interrupt.clone()));
        Self {
            cancel,
            interrupt,
            watcher,
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_signals(cancel: CancellationToken, interrupt: CancellationToken) {
    if await_shutdown_signal().await.is_err() {
        return;
    }
    warn!("Shutdown signal received, not starting further steps (repeat to abort running steps)");
    cancel.cancel();

    if await_shutdown_signal().await.is_ok() {
        warn!("Second shutdown signal received, aborting running steps");
        interrupt.cancel();
    }
}

async fn await_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl+C received");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

async fn status(app: &AppState, args: HostsArgs) -> Result<i32, OrchestratorError> {
    let snapshot = app.snapshotter().await?.status(&args.hosts);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(0);
    }
    if snapshot.is_empty() {
        println!("No recorded state");
    }
    print_status(&snapshot);
    Ok(0)
}

async fn clean(app: &AppState, args: HostsArgs) -> Result<i32, OrchestratorError> {
    let snapshotter = app.snapshotter().await?;
    let hosts = if args.hosts.is_empty() {
        snapshotter.status(&[]).into_keys().collect()
    } else {
        args.hosts
    };
    let removed = snapshotter.clear(&hosts).await?;
    println!("Removed {} records for {} hosts", removed, hosts.len());
    Ok(0)
}

async fn reset_state(app: &AppState, confirm: bool) -> Result<i32, OrchestratorError> {
    if !confirm {
        eprintln!("reset-state discards all recorded deployment state; pass --confirm");
        return Ok(2);
    }
    let moved = StateStore::discard_corrupt(&app.layout).await?;
    if moved.is_empty() {
        println!("No state files to discard");
    }
    for path in moved {
        println!("Moved aside: {}", path.display());
    }
    Ok(0)
}

async fn inventory(app: &AppState, command: InventoryCommand) -> Result<i32, OrchestratorError> {
    match command {
        InventoryCommand::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&app.inventory.to_document())?);
            } else {
                for host in app.inventory.hosts() {
                    print_host(&host);
                }
            }
        }
        InventoryCommand::Add(args) => {
            let host = host_from_args(args);
            println!("Saved {}", host.name);
            app.inventory.upsert(host).await?;
        }
        InventoryCommand::Discover => {
            let client = app.proxmox_client()?;
            let names = proxmox::discover(&client, &app.inventory).await?;
            println!("Discovered {} hosts", names.len());
            for name in names {
                println!("  {}", name);
            }
        }
        InventoryCommand::Export => print!("{}", render_ansible_ini(&app.inventory.hosts())),
    }
    Ok(0)
}

fn host_from_args(args: AddHostArgs) -> Host {
    let mut host = Host::new(args.name, args.connection, args.address);
    host.credentials_ref = args.credentials;
    let host = args.tags.into_iter().fold(host, |h, tag| h.with_tag(tag));
    args.vars.into_iter().fold(host, |h, (k, v)| h.with_var(k, v))
}

/// Report whether the tools the backends shell out to are on PATH
fn check() -> i32 {
    let mut missing = 0;
    for tool in ["sh", "ssh", "docker", "sedge"] {
        match find_on_path(tool) {
            Some(path) => println!("{} {} ({})", "ok".green(), tool, path.display()),
            None => {
                println!("{} {} not found on PATH", "missing".red(), tool);
                missing += 1;
            }
        }
    }
    if missing > 0 {
        1
    } else {
        0
    }
}

fn find_on_path(tool: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

// =============================== OUTPUT ================================== //

fn outcome_label(outcome: &StepOutcome) -> colored::ColoredString {
    match outcome {
        StepOutcome::Succeeded => outcome.label().green(),
        StepOutcome::Failed(_) => outcome.label().red(),
        StepOutcome::Skipped(_) => outcome.label().yellow(),
    }
}

fn print_plan(plan: &StepPlan) {
    println!("Plan for {} / {} ({} steps)", plan.network(), plan.client(), plan.len());
    for step in plan.steps() {
        println!("  {:<12} {:<20} {:?}", step.host, step.id, step.phase);
        println!("    {}", step.command.dimmed());
    }
}

fn print_summary(run: &PlanRun) {
    for result in &run.results {
        let detail = match &result.outcome {
            StepOutcome::Succeeded => format!("{:.1?}", result.duration),
            StepOutcome::Failed(reason) => reason.to_string(),
            StepOutcome::Skipped(reason) => reason.to_string(),
        };
        println!(
            "{:<10} {:<12} {:<20} {}",
            outcome_label(&result.outcome),
            result.host,
            result.step_id,
            detail
        );
    }

    let failures: Vec<_> = run.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("{}", "Failed steps:".bold());
        for failure in failures {
            println!(
                "  {} on {} (retries: {})",
                failure.step_id.bold(),
                failure.host,
                failure.retries
            );
            for line in failure.output.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
                println!("    {}", line);
            }
        }
    }

    let status = match run.status {
        RunStatus::Completed => run.status.to_string().green(),
        RunStatus::Partial => run.status.to_string().yellow(),
        RunStatus::Aborted => run.status.to_string().red(),
    };
    println!();
    println!("Deployment {} ({} steps)", status.bold(), run.results.len());
}

fn print_status(snapshot: &BTreeMap<String, Vec<StepRecord>>) {
    for (host, records) in snapshot {
        println!("{}", host.bold());
        if records.is_empty() {
            println!("  (no records)");
        }
        for record in records {
            println!(
                "  {:<10} {:<20} {}/{} {}",
                outcome_label(&record.result.outcome),
                record.step_id,
                record.network,
                record.client,
                record.recorded_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

fn print_host(host: &Host) {
    let tags: Vec<&str> = host.tags.iter().map(String::as_str).collect();
    println!(
        "{:<20} {:<6} {:<24} [{}]",
        host.name,
        host.connection,
        host.address,
        tags.join(", ")
    );
}
