//! Read-side view of the deployment state for status, stop and clean

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::errors::OrchestratorError;
use crate::models::step::StepOutcome;
use crate::state::{StateStore, StepRecord};

#[derive(Clone)]
pub struct StateSnapshotter {
    store: Arc<StateStore>,
}

impl StateSnapshotter {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Records grouped by host; every host with records when `hosts` is empty
    ///
    /// Each host's records are ordered by the time they were recorded.
    pub fn status(&self, hosts: &[String]) -> BTreeMap<String, Vec<StepRecord>> {
        let mut by_host: BTreeMap<String, Vec<StepRecord>> = BTreeMap::new();
        for host in hosts {
            by_host.entry(host.clone()).or_default();
        }

        let state = self.store.state();
        for record in state.records() {
            if hosts.is_empty() || hosts.contains(&record.host) {
                by_host.entry(record.host.clone()).or_default().push(record.clone());
            }
        }
        for records in by_host.values_mut() {
            records.sort_by_key(|r| r.recorded_at);
        }
        by_host
    }

    /// Succeeded `step_id` records for this network and client, by host
    pub fn succeeded_records(&self, step_id: &str, network: &str, client: &str) -> Vec<StepRecord> {
        let state = self.store.state();
        let mut records: Vec<StepRecord> = state
            .records()
            .filter(|r| {
                r.step_id == step_id
                    && r.network == network
                    && r.client == client
                    && r.result.outcome == StepOutcome::Succeeded
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.host.cmp(&b.host).then(a.recorded_at.cmp(&b.recorded_at)));
        records
    }

    /// Hosts where `step_id` last succeeded for this network and client
    pub fn hosts_with_succeeded(&self, step_id: &str, network: &str, client: &str) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .succeeded_records(step_id, network, client)
            .into_iter()
            .map(|r| r.host)
            .collect();
        hosts.dedup();
        hosts
    }

    /// Forget persisted state for `hosts` without contacting them
    pub async fn clear(&self, hosts: &[String]) -> Result<usize, OrchestratorError> {
        let removed = self.store.clear_hosts(hosts).await?;
        info!("Cleared {} state records for {} hosts", removed, hosts.len());
        Ok(removed)
    }
}
