//! Deployment request model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::sha256_hash;

/// Consensus client sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Sync from genesis
    Full,

    /// Checkpoint sync from a trusted beacon endpoint
    #[default]
    Fast,

    /// Keep all historical states
    Archive,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Fast => "fast",
            SyncMode::Archive => "archive",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "fast" | "checkpoint" | "snap" => Ok(SyncMode::Fast),
            "archive" => Ok(SyncMode::Archive),
            _ => Err(format!("Invalid sync mode: {}", s)),
        }
    }
}

/// A requested deployment, immutable once submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    network: String,
    client: String,
    sync_mode: SyncMode,
    validator: bool,
    overrides: BTreeMap<String, String>,
}

impl DeploymentRequest {
    pub fn new(network: impl Into<String>, client: impl Into<String>, sync_mode: SyncMode) -> Self {
        Self {
            network: network.into().to_lowercase(),
            client: client.into().to_lowercase(),
            sync_mode,
            validator: false,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_validator(mut self, validator: bool) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn validator(&self) -> bool {
        self.validator
    }

    pub fn overrides(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    pub fn get_override(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Stable hash of the request contents
    ///
    /// Overrides live in a `BTreeMap`, so the serialized form and the hash
    /// do not depend on insertion order.
    pub fn request_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        sha256_hash(&canonical)
    }
}
