//! Inventory store: merged host-source documents plus discovered hosts

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::host::{Host, HostEntry, InventoryDocument};

/// Authoritative mapping of host names to connection facts
///
/// Mutations of one host are serialized by that host's lock; unrelated hosts
/// never wait on each other except for the short map insertion itself.
///
/// Only upserted hosts are persisted. Source documents stay the authority
/// for every host they declare that was never upserted.
pub struct InventoryStore {
    hosts: RwLock<BTreeMap<String, Host>>,
    upserted: RwLock<BTreeSet<String>>,
    host_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    persist_to: Option<File>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl InventoryStore {
    /// Create an empty store, optionally persisted to `persist_to`
    pub fn new(persist_to: Option<File>) -> Self {
        Self {
            hosts: RwLock::new(BTreeMap::new()),
            upserted: RwLock::new(BTreeSet::new()),
            host_locks: Mutex::new(HashMap::new()),
            persist_to,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Merge source documents in order
    ///
    /// Later sources override connection facts; tags accumulate across
    /// sources and are never removed.
    pub fn load(
        sources: &[InventoryDocument],
        persist_to: Option<File>,
    ) -> Result<Self, OrchestratorError> {
        let mut merged: BTreeMap<String, Host> = BTreeMap::new();
        for source in sources {
            for entry in &source.hosts {
                merge_entry(&mut merged, entry.clone())?;
            }
        }

        info!("Loaded inventory with {} hosts from {} sources", merged.len(), sources.len());
        let store = Self::new(persist_to);
        *store.hosts.write().unwrap_or_else(|e| e.into_inner()) = merged;
        Ok(store)
    }

    /// Read and merge source files, then the persisted upserts (if any)
    ///
    /// The persisted file holds upserted hosts only, so edits to a source
    /// take effect on the next open for every host it declares that was
    /// not upserted since.
    pub async fn open(sources: &[File], persisted: File) -> Result<Self, OrchestratorError> {
        let mut documents = Vec::with_capacity(sources.len() + 1);
        for source in sources {
            debug!("Reading inventory source {}", source.path().display());
            documents.push(source.read_json::<InventoryDocument>().await?);
        }

        let mut upserted = BTreeSet::new();
        if persisted.exists().await {
            let document = persisted.read_json::<InventoryDocument>().await?;
            upserted.extend(document.hosts.iter().map(|entry| entry.name.clone()));
            documents.push(document);
        }

        let store = Self::load(&documents, Some(persisted))?;
        *store.upserted.write().unwrap_or_else(|e| e.into_inner()) = upserted;
        Ok(store)
    }

    /// Insert or replace one host entry, then persist the upserted hosts
    pub async fn upsert(&self, host: Host) -> Result<(), OrchestratorError> {
        if host.name.trim().is_empty() {
            return Err(OrchestratorError::ValidationError("host name is empty".to_string()));
        }

        let lock = self.host_lock(&host.name);
        let _guard = lock.lock().await;

        debug!("Upserting host {} ({})", host.name, host.connection);
        {
            let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
            self.upserted
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(host.name.clone());
            hosts.insert(host.name.clone(), host);
        }

        self.persist().await
    }

    /// Look up a host by name
    pub fn resolve(&self, name: &str) -> Result<Host, OrchestratorError> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::HostNotFound(name.to_string()))
    }

    /// All hosts, ordered by name
    pub fn hosts(&self) -> Vec<Host> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.values().cloned().collect()
    }

    /// Hosts carrying `tag`, ordered by name
    pub fn select_by_tag(&self, tag: &str) -> Vec<Host> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.values().filter(|h| h.has_tag(tag)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current contents as a source document
    pub fn to_document(&self) -> InventoryDocument {
        InventoryDocument {
            hosts: self.hosts().into_iter().map(HostEntry::from).collect(),
        }
    }

    fn upserted_document(&self) -> InventoryDocument {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        let upserted = self.upserted.read().unwrap_or_else(|e| e.into_inner());
        InventoryDocument {
            hosts: upserted
                .iter()
                .filter_map(|name| hosts.get(name))
                .cloned()
                .map(HostEntry::from)
                .collect(),
        }
    }

    fn host_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.host_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn persist(&self) -> Result<(), OrchestratorError> {
        let Some(file) = &self.persist_to else {
            return Ok(());
        };

        // Writers share one temp file, so file replacement is serialized.
        let _guard = self.persist_lock.lock().await;
        let document = self.upserted_document();
        file.write_json(&document).await?;
        debug!("Persisted inventory ({} hosts) to {}", document.hosts.len(), file.path().display());
        Ok(())
    }
}

fn merge_entry(hosts: &mut BTreeMap<String, Host>, entry: HostEntry) -> Result<(), OrchestratorError> {
    if entry.name.trim().is_empty() {
        return Err(OrchestratorError::ValidationError("host name is empty".to_string()));
    }

    match hosts.get_mut(&entry.name) {
        Some(existing) => {
            if let Some(connection) = entry.connection {
                existing.connection = connection;
            }
            if let Some(address) = entry.address {
                existing.address = address;
            }
            if entry.credentials_ref.is_some() {
                existing.credentials_ref = entry.credentials_ref;
            }
            existing.vars.extend(entry.vars);
            existing.tags.extend(entry.tags);
        }
        None => {
            let connection = entry.connection.ok_or_else(|| {
                OrchestratorError::ValidationError(format!(
                    "host '{}' has no connection kind",
                    entry.name
                ))
            })?;
            hosts.insert(
                entry.name.clone(),
                Host {
                    name: entry.name,
                    connection,
                    address: entry.address.unwrap_or_default(),
                    credentials_ref: entry.credentials_ref,
                    tags: entry.tags,
                    vars: entry.vars,
                },
            );
        }
    }
    Ok(())
}
