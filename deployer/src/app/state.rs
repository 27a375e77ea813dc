//! Shared handles built once per invocation

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::deploy::api::ApiBackend;
use crate::deploy::local::LocalBackend;
use crate::deploy::ssh::SshBackend;
use crate::deploy::{BackendRegistry, StepExecutor};
use crate::engine::ConvergenceEngine;
use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::inventory::proxmox::ProxmoxClient;
use crate::inventory::InventoryStore;
use crate::models::host::ConnectionKind;
use crate::state::{StateSnapshotter, StateStore};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

pub struct AppState {
    pub layout: StorageLayout,
    pub settings: Settings,
    pub inventory: Arc<InventoryStore>,
}

impl AppState {
    /// Create the storage layout and load the inventory
    pub async fn init(layout: StorageLayout, settings: Settings) -> Result<Self, OrchestratorError> {
        layout.setup().await?;

        let sources: Vec<File> = settings.inventory_sources.iter().map(File::new).collect();
        let inventory = InventoryStore::open(&sources, layout.inventory_file()).await?;

        Ok(Self {
            layout,
            settings,
            inventory: Arc::new(inventory),
        })
    }

    /// Open the deployment state; fails on corruption
    pub async fn state_store(&self) -> Result<Arc<StateStore>, OrchestratorError> {
        let store = StateStore::open_layout(&self.layout, self.settings.compact_every).await?;
        Ok(Arc::new(store))
    }

    pub async fn snapshotter(&self) -> Result<StateSnapshotter, OrchestratorError> {
        Ok(StateSnapshotter::new(self.state_store().await?))
    }

    /// Engine wired to the local, SSH and API backends
    pub fn engine(&self, state: Arc<StateStore>) -> Result<ConvergenceEngine, OrchestratorError> {
        let registry = BackendRegistry::new()
            .with(Arc::new(LocalBackend::new()))
            .with(Arc::new(SshBackend::new(self.settings.ssh.clone())))
            .with(Arc::new(ApiBackend::new(
                self.api_credentials(),
                self.settings.proxmox.insecure_tls,
            )?));
        Ok(ConvergenceEngine::new(StepExecutor::new(registry), state))
    }

    pub fn proxmox_client(&self) -> Result<ProxmoxClient, OrchestratorError> {
        let proxmox = &self.settings.proxmox;
        if proxmox.base_url.is_empty() || proxmox.token_id.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "proxmox.base_url and proxmox.token_id must be set".to_string(),
            ));
        }
        let secret = read_secret(&proxmox.token_secret_env).ok_or_else(|| {
            OrchestratorError::ConfigError(format!("{} is not set", proxmox.token_secret_env))
        })?;
        ProxmoxClient::new(&proxmox.base_url, &proxmox.token_id, secret, proxmox.insecure_tls)
    }

    /// Authorization values for `api` hosts, keyed by credentials reference
    ///
    /// A host's `credentials_ref` names an environment variable holding
    /// either a full `PVEAPIToken=...` value or just the token secret, in
    /// which case the configured token id is prepended.
    fn api_credentials(&self) -> HashMap<String, SecretString> {
        let mut credentials = HashMap::new();
        for host in self.inventory.hosts() {
            if host.connection != ConnectionKind::Api {
                continue;
            }
            let Some(reference) = host.credentials_ref.as_ref() else {
                continue;
            };
            if credentials.contains_key(reference) {
                continue;
            }
            match read_secret(reference) {
                Some(secret) => {
                    debug!("Loaded API credentials '{}'", reference);
                    credentials.insert(reference.clone(), self.authorization_for(secret));
                }
                None => warn!("API credentials '{}' for host {} are not set", reference, host.name),
            }
        }
        credentials
    }

    fn authorization_for(&self, secret: SecretString) -> SecretString {
        if secret.expose_secret().starts_with("PVEAPIToken=") {
            return secret;
        }
        SecretString::from(format!(
            "PVEAPIToken={}={}",
            self.settings.proxmox.token_id,
            secret.expose_secret()
        ))
    }
}

fn read_secret(var: &str) -> Option<SecretString> {
    env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}
