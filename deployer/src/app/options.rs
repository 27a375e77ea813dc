//! Command-line options

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::engine::ConvergencePolicy;
use crate::errors::OrchestratorError;
use crate::models::host::ConnectionKind;
use crate::models::request::{DeploymentRequest, SyncMode};
use crate::storage::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "ethdeploy", about = "Converge Ethereum consensus clients onto inventory hosts")]
pub struct Cli {
    /// State directory (defaults to /var/lib/ethdeploy, or ~/.ethdeploy off Linux)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Settings file (defaults to <base-dir>/settings.json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve and converge a deployment
    Deploy(DeployArgs),
    /// Print the step plan without executing it
    Plan(RequestArgs),
    /// Show the recorded state of hosts
    Status(HostsArgs),
    /// Stop the client on hosts where it was started
    Stop(StopArgs),
    /// Check the RPC and engine endpoints of started nodes
    Verify(StopArgs),
    /// Forget recorded state for hosts (hosts are not contacted)
    Clean(HostsArgs),
    /// Inspect or edit the inventory
    #[command(subcommand)]
    Inventory(InventoryCommand),
    /// Move corrupt state files aside
    ResetState {
        /// Required; the recorded state is discarded
        #[arg(long)]
        confirm: bool,
    },
    /// Print version information
    Version,
    /// Check that required tools are installed
    Check,
}

#[derive(Debug, Args, Clone)]
pub struct RequestArgs {
    /// Network id, e.g. sepolia
    #[arg(long)]
    pub network: String,

    /// Consensus client id, e.g. lodestar
    #[arg(long)]
    pub client: String,

    #[arg(long, default_value = "fast")]
    pub sync_mode: SyncMode,

    /// Also configure a validator
    #[arg(long)]
    pub validator: bool,

    /// Template override, `key=value` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,
}

impl RequestArgs {
    pub fn to_request(&self) -> DeploymentRequest {
        self.overrides.iter().fold(
            DeploymentRequest::new(&self.network, &self.client, self.sync_mode)
                .with_validator(self.validator),
            |request, (key, value)| request.with_override(key, value),
        )
    }
}

#[derive(Debug, Args, Clone)]
pub struct PolicyArgs {
    /// Skip steps carrying this tag (repeatable)
    #[arg(long = "skip-tag")]
    pub skip_tags: Vec<String>,

    /// Extra attempts for a failed step
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Keep converging other hosts after one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Re-run steps that already converged
    #[arg(long)]
    pub force: bool,

    /// Report what would run without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Per-step timeout (defaults to the settings value)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Hosts converged concurrently
    #[arg(long)]
    pub parallel: Option<usize>,
}

impl PolicyArgs {
    pub fn to_policy(&self, settings: &Settings) -> ConvergencePolicy {
        let mut policy = ConvergencePolicy::from_settings(settings);
        policy.skip_tags = self.skip_tags.iter().cloned().collect();
        policy.max_retries = self.retries;
        policy.continue_on_error = self.continue_on_error;
        policy.force_rerun = self.force;
        policy.dry_run = self.dry_run;
        if let Some(secs) = self.timeout_secs {
            policy.step_timeout = Duration::from_secs(secs);
        }
        policy.parallelism = self.parallel;
        policy
    }
}

#[derive(Debug, Args, Clone)]
pub struct DeployArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Check the node's RPC and engine endpoints after starting it
    #[arg(long)]
    pub verify: bool,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Debug, Args, Clone)]
pub struct StopArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Only these hosts (default: every host where the client was started)
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Debug, Args, Clone)]
pub struct HostsArgs {
    /// Host names (default: all)
    #[arg(value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum InventoryCommand {
    /// List hosts
    List {
        #[arg(long)]
        json: bool,
    },
    /// Add or replace a host
    Add(AddHostArgs),
    /// Upsert running guests from the Proxmox API
    Discover,
    /// Print the inventory as an Ansible INI file
    Export,
}

#[derive(Debug, Args, Clone)]
pub struct AddHostArgs {
    pub name: String,

    /// local, ssh or api
    #[arg(long, default_value = "ssh")]
    pub connection: ConnectionKind,

    /// IP, hostname or API base URL
    #[arg(long, default_value = "")]
    pub address: String,

    /// SSH identity file or API credential name
    #[arg(long)]
    pub credentials: Option<String>,

    /// Tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Host variable, `key=value` (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,
}

pub fn parse_key_value(input: &str) -> Result<(String, String), OrchestratorError> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(OrchestratorError::ValidationError(format!(
            "expected KEY=VALUE, got '{}'",
            input
        ))),
    }
}
