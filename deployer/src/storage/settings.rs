//! Settings file management

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::utils::CooldownOptions;

/// Orchestrator settings, read once at startup from `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,

    /// Also write logs to a daily-rolling file under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Per-step timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Upper bound on host chains executed concurrently
    #[serde(default = "default_max_parallel_hosts")]
    pub max_parallel_hosts: usize,

    /// Journal entries appended before the state store compacts
    #[serde(default = "default_compact_every")]
    pub compact_every: usize,

    /// Backoff between retries of a failed step
    #[serde(default)]
    pub retry_cooldown: CooldownOptions,

    /// SSH backend configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Proxmox API configuration
    #[serde(default)]
    pub proxmox: ProxmoxSettings,

    /// Additional static inventory documents merged before `inventory.json`
    #[serde(default)]
    pub inventory_sources: Vec<String>,
}

fn default_step_timeout() -> u64 {
    900
}

fn default_max_parallel_hosts() -> usize {
    8
}

fn default_compact_every() -> usize {
    256
}

impl Settings {
    /// Read and validate `file`; defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, OrchestratorError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        self.retry_cooldown
            .validate()
            .map_err(|e| OrchestratorError::ConfigError(format!("retry_cooldown: {}", e)))?;
        if self.max_parallel_hosts == 0 {
            return Err(OrchestratorError::ConfigError(
                "max_parallel_hosts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            step_timeout_secs: default_step_timeout(),
            max_parallel_hosts: default_max_parallel_hosts(),
            compact_every: default_compact_every(),
            retry_cooldown: CooldownOptions::default(),
            ssh: SshSettings::default(),
            proxmox: ProxmoxSettings::default(),
            inventory_sources: Vec::new(),
        }
    }
}

/// SSH backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// ssh binary to invoke
    #[serde(default = "default_ssh_bin")]
    pub binary: String,

    /// Login user when the host does not set `ssh_user`
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Connect timeout passed to ssh, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`
    #[serde(default = "default_ssh_options")]
    pub options: Vec<String>,
}

fn default_ssh_bin() -> String {
    "ssh".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ssh_options() -> Vec<String> {
    vec!["StrictHostKeyChecking=accept-new".to_string()]
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_bin(),
            user: default_ssh_user(),
            connect_timeout_secs: default_connect_timeout(),
            options: default_ssh_options(),
        }
    }
}

/// Proxmox API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxSettings {
    /// API base URL, e.g. `https://pve.lan:8006`
    #[serde(default)]
    pub base_url: String,

    /// API token id, e.g. `deploy@pve!ethdeploy`
    #[serde(default)]
    pub token_id: String,

    /// Name of the environment variable holding the token secret
    #[serde(default = "default_token_env")]
    pub token_secret_env: String,

    /// Accept self-signed certificates
    #[serde(default)]
    pub insecure_tls: bool,
}

fn default_token_env() -> String {
    "PROXMOX_TOKEN_SECRET".to_string()
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_id: String::new(),
            token_secret_env: default_token_env(),
            insecure_tls: false,
        }
    }
}
