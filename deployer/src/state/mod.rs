//! Persisted deployment state

pub mod journal;
pub mod snapshotter;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::step::StepResult;

pub use snapshotter::StateSnapshotter;
pub use store::StateStore;

/// Last known result of one step on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub host: String,
    pub step_id: String,
    pub idempotency_key: String,
    pub request_hash: String,
    pub network: String,
    pub client: String,
    /// Request overrides the step's command was rendered with
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
    pub result: StepResult,
    pub recorded_at: DateTime<Utc>,
}

/// Step records keyed by idempotency key
///
/// The key already encodes the host, so one entry per (host, key) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    records: BTreeMap<String, StepRecord>,
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for its idempotency key
    pub fn insert(&mut self, record: StepRecord) {
        self.records.insert(record.idempotency_key.clone(), record);
    }

    pub fn get(&self, key: &str) -> Option<&StepRecord> {
        self.records.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<StepRecord> {
        self.records.remove(key)
    }

    /// Drop every record of `host`; returns how many were removed
    pub fn remove_host(&mut self, host: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.host != host);
        before - self.records.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.values()
    }

    pub fn for_host<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.records.values().filter(move |r| r.host == host)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
