//! Convergence policy

use std::collections::BTreeSet;
use std::time::Duration;

use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;

/// How a plan is driven to completion
///
/// Built once by the front end and passed to the engine by reference.
#[derive(Debug, Clone)]
pub struct ConvergencePolicy {
    /// Steps carrying any of these tags are skipped
    pub skip_tags: BTreeSet<String>,

    /// Extra attempts after the first failure
    pub max_retries: u32,

    /// Backoff between attempts
    pub cooldown: CooldownOptions,

    /// Keep running other host chains after a chain fails
    pub continue_on_error: bool,

    /// Run steps even when state says they already converged
    pub force_rerun: bool,

    /// Report the plan without executing or persisting anything
    pub dry_run: bool,

    pub step_timeout: Duration,

    /// Explicit pool size; defaults to the number of host chains
    pub parallelism: Option<usize>,

    /// Upper bound on the pool size
    pub max_parallel: usize,
}

impl ConvergencePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            step_timeout: Duration::from_secs(settings.step_timeout_secs),
            cooldown: settings.retry_cooldown.clone(),
            max_parallel: settings.max_parallel_hosts.max(1),
            ..Self::default()
        }
    }

    pub fn skips(&self, tags: &BTreeSet<String>) -> Option<String> {
        tags.intersection(&self.skip_tags).next().cloned()
    }

    /// Worker pool size for a plan with `chains` independent host chains
    pub fn pool_size(&self, chains: usize) -> usize {
        self.parallelism
            .unwrap_or(chains)
            .min(self.max_parallel)
            .max(1)
    }
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            skip_tags: BTreeSet::new(),
            max_retries: 0,
            cooldown: CooldownOptions::default(),
            continue_on_error: false,
            force_rerun: false,
            dry_run: false,
            step_timeout: Duration::from_secs(900),
            parallelism: None,
            max_parallel: 8,
        }
    }
}
