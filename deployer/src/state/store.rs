//! Durable deployment state: snapshot plus journal

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::state::journal::{self, JournalEntry, JournalOp};
use crate::state::{DeploymentState, StepRecord};
use crate::storage::layout::StorageLayout;
use crate::utils::{now_millis, sha256_hash};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    last_sequence: u64,
    written_at: DateTime<Utc>,
    checksum: String,
    state: DeploymentState,
}

impl Snapshot {
    fn checksum_of(state: &DeploymentState) -> Result<String, OrchestratorError> {
        Ok(sha256_hash(serde_json::to_string(state)?.as_bytes()))
    }
}

#[derive(Debug)]
struct JournalWriter {
    next_sequence: u64,
    appended_since_compaction: usize,
}

/// Deployment state store
///
/// Mutations are appended to the journal (and fsynced) before they become
/// visible in memory. Every `compact_every` appends the full state is
/// written as a new snapshot and the journal is replaced by an empty one.
pub struct StateStore {
    snapshot_file: File,
    journal_file: File,
    state: RwLock<DeploymentState>,
    writer: tokio::sync::Mutex<JournalWriter>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    compact_every: usize,
}

impl StateStore {
    /// Open the store at the layout's state paths
    pub async fn open_layout(layout: &StorageLayout, compact_every: usize) -> Result<Self, OrchestratorError> {
        Self::open(layout.state_snapshot_file(), layout.state_journal_file(), compact_every).await
    }

    /// Load snapshot, replay the journal, and repair a torn trailing line
    pub async fn open(
        snapshot_file: File,
        journal_file: File,
        compact_every: usize,
    ) -> Result<Self, OrchestratorError> {
        let (mut state, last_sequence) = load_snapshot(&snapshot_file).await?;
        let mut next_sequence = last_sequence + 1;

        if journal_file.exists().await {
            let contents = journal_file.read_string().await?;
            let parsed = journal::parse(&contents).map_err(|message| OrchestratorError::StateCorruption {
                path: journal_file.path().display().to_string(),
                message,
            })?;

            let mut replayed = 0;
            for entry in parsed.entries.iter().filter(|e| e.sequence > last_sequence) {
                entry.op.apply(&mut state);
                replayed += 1;
            }
            if let Some(last) = parsed.entries.last() {
                next_sequence = next_sequence.max(last.sequence + 1);
            }
            debug!("Replayed {} journal entries", replayed);

            if parsed.torn_tail {
                warn!("Rewriting journal {} without its torn tail", journal_file.path().display());
                let mut repaired = String::new();
                for entry in &parsed.entries {
                    repaired.push_str(&entry.to_line()?);
                    repaired.push('\n');
                }
                journal_file.write_atomic(repaired.as_bytes()).await?;
            }
        }

        info!("Loaded deployment state with {} records", state.len());
        Ok(Self {
            snapshot_file,
            journal_file,
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(JournalWriter {
                next_sequence,
                appended_since_compaction: 0,
            }),
            key_locks: Mutex::new(HashMap::new()),
            compact_every,
        })
    }

    /// Move unreadable state files aside so a fresh store can be opened
    ///
    /// Returns the paths the files were moved to.
    pub async fn discard_corrupt(layout: &StorageLayout) -> Result<Vec<PathBuf>, OrchestratorError> {
        let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S"));
        let mut moved = Vec::new();
        for file in [layout.state_snapshot_file(), layout.state_journal_file()] {
            if !file.exists().await {
                continue;
            }
            let mut target = file.path().as_os_str().to_os_string();
            target.push(format!(".{}", suffix));
            let target = PathBuf::from(target);
            file.rename_to(&target).await?;
            warn!("Moved {} to {}", file.path().display(), target.display());
            moved.push(target);
        }
        Ok(moved)
    }

    /// Mutation lock for one idempotency key
    pub fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<StepRecord> {
        self.read().get(key).cloned()
    }

    /// Copy of the whole state
    pub fn state(&self) -> DeploymentState {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist a record, replacing any previous record for its key
    pub async fn record(&self, record: StepRecord) -> Result<(), OrchestratorError> {
        self.apply(JournalOp::Put { record }).await
    }

    /// Remove records by idempotency key
    pub async fn remove(&self, keys: Vec<String>) -> Result<(), OrchestratorError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.apply(JournalOp::Remove { keys }).await
    }

    /// Remove every record of `hosts`; returns how many records went away
    pub async fn clear_hosts(&self, hosts: &[String]) -> Result<usize, OrchestratorError> {
        let affected = {
            let state = self.read();
            state.records().filter(|r| hosts.contains(&r.host)).count()
        };
        self.apply(JournalOp::ClearHosts { hosts: hosts.to_vec() }).await?;
        Ok(affected)
    }

    /// Write a snapshot of the current state and empty the journal
    pub async fn compact(&self) -> Result<(), OrchestratorError> {
        let mut writer = self.writer.lock().await;
        self.compact_locked(&mut writer).await
    }

    async fn apply(&self, op: JournalOp) -> Result<(), OrchestratorError> {
        let mut writer = self.writer.lock().await;

        let entry = JournalEntry::new(writer.next_sequence, now_millis(), op);
        self.journal_file.append_line(&entry.to_line()?).await?;
        writer.next_sequence += 1;
        writer.appended_since_compaction += 1;

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            entry.op.apply(&mut state);
        }

        if self.compact_every > 0 && writer.appended_since_compaction >= self.compact_every {
            self.compact_locked(&mut writer).await?;
        }
        Ok(())
    }

    async fn compact_locked(&self, writer: &mut JournalWriter) -> Result<(), OrchestratorError> {
        let state = self.state();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            last_sequence: writer.next_sequence - 1,
            written_at: Utc::now(),
            checksum: Snapshot::checksum_of(&state)?,
            state,
        };

        // The snapshot must be durable before the journal it replaces is emptied.
        self.snapshot_file.write_json(&snapshot).await?;
        self.journal_file.write_atomic(b"").await?;
        writer.appended_since_compaction = 0;

        debug!("Compacted state at sequence {}", snapshot.last_sequence);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DeploymentState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}

async fn load_snapshot(file: &File) -> Result<(DeploymentState, u64), OrchestratorError> {
    if !file.exists().await {
        return Ok((DeploymentState::new(), 0));
    }

    let corruption = |message: String| OrchestratorError::StateCorruption {
        path: file.path().display().to_string(),
        message,
    };

    let contents = file.read_string().await?;
    let snapshot: Snapshot = serde_json::from_str(&contents).map_err(|e| corruption(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(corruption(format!("unsupported snapshot version {}", snapshot.version)));
    }
    if Snapshot::checksum_of(&snapshot.state)? != snapshot.checksum {
        return Err(corruption("checksum mismatch".to_string()));
    }
    Ok((snapshot.state, snapshot.last_sequence))
}
