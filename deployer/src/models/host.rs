//! Inventory host model

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the orchestrator reaches a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Commands run on the orchestrator machine
    Local,

    /// Commands run through an SSH session
    Ssh,

    /// Steps are HTTP calls against a remote API (Proxmox)
    Api,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Local => "local",
            ConnectionKind::Ssh => "ssh",
            ConnectionKind::Api => "api",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ConnectionKind::Local),
            "ssh" => Ok(ConnectionKind::Ssh),
            "api" => Ok(ConnectionKind::Api),
            _ => Err(format!("Invalid connection kind: {}", s)),
        }
    }
}

/// A deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Logical name, unique within an inventory
    pub name: String,

    /// Connection kind
    pub connection: ConnectionKind,

    /// Address: hostname/IP for ssh, API base URL for api, ignored for local
    #[serde(default)]
    pub address: String,

    /// Reference to credentials (env var or key file name), never the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,

    /// Free-form tags used for target selection and grouping
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Connection facts consumed by backends and command templates
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Host {
    /// Create a host with no tags or vars
    pub fn new(name: impl Into<String>, connection: ConnectionKind, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection,
            address: address.into(),
            credentials_ref: None,
            tags: BTreeSet::new(),
            vars: BTreeMap::new(),
        }
    }

    /// The conventional local host
    pub fn localhost() -> Self {
        Self::new("localhost", ConnectionKind::Local, "127.0.0.1")
    }

    /// Builder-style tag insertion
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Builder-style var insertion
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// A partial host entry as it appears in an inventory source document
///
/// Fields left out of a later source keep the value from earlier sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,

    #[serde(default)]
    pub connection: Option<ConnectionKind>,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub credentials_ref: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// One inventory source document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryDocument {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl From<Host> for HostEntry {
    fn from(host: Host) -> Self {
        Self {
            name: host.name,
            connection: Some(host.connection),
            address: Some(host.address),
            credentials_ref: host.credentials_ref,
            tags: host.tags,
            vars: host.vars,
        }
    }
}
