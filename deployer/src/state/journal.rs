//! Append-only state journal
//!
//! Every mutation of the deployment state is written as one JSON line and
//! fsynced before it is applied in memory. Lines carry a sequence number and
//! a SHA-256 checksum so replay can tell a torn trailing write (dropped) from
//! real corruption (surfaced).

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::{DeploymentState, StepRecord};
use crate::utils::sha256_hash;

/// A state mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// Insert or overwrite a record
    Put { record: StepRecord },

    /// Drop every record of the listed hosts
    ClearHosts { hosts: Vec<String> },

    /// Drop records by idempotency key
    Remove { keys: Vec<String> },
}

impl JournalOp {
    /// Apply to an in-memory state. Re-applying an op is harmless.
    pub fn apply(&self, state: &mut DeploymentState) {
        match self {
            JournalOp::Put { record } => state.insert(record.clone()),
            JournalOp::ClearHosts { hosts } => {
                for host in hosts {
                    state.remove_host(host);
                }
            }
            JournalOp::Remove { keys } => {
                for key in keys {
                    state.remove(key);
                }
            }
        }
    }
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub op: JournalOp,
    pub checksum: String,
}

impl JournalEntry {
    pub fn new(sequence: u64, timestamp_ms: u64, op: JournalOp) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp_ms, &op);
        Self {
            sequence,
            timestamp_ms,
            op,
            checksum,
        }
    }

    fn compute_checksum(sequence: u64, timestamp_ms: u64, op: &JournalOp) -> String {
        let op_json = serde_json::to_string(op).unwrap_or_default();
        sha256_hash(format!("{}:{}:{}", sequence, timestamp_ms, op_json).as_bytes())
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp_ms, &self.op)
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Result of parsing a journal file
#[derive(Debug, Default)]
pub struct ParsedJournal {
    pub entries: Vec<JournalEntry>,

    /// The final line was incomplete and has been dropped
    pub torn_tail: bool,
}

/// Parse journal contents
///
/// Only the last line may be damaged, and only when it lacks its
/// terminating newline: that is a write that never completed. Any other
/// unreadable or checksum-failing line is an error naming the line number.
pub fn parse(contents: &str) -> Result<ParsedJournal, String> {
    let mut parsed = ParsedJournal::default();
    let unterminated = !contents.is_empty() && !contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let is_last = idx + 1 == lines.len();
        let entry = serde_json::from_str::<JournalEntry>(line)
            .map_err(|e| e.to_string())
            .and_then(|entry| {
                if entry.verify_checksum() {
                    Ok(entry)
                } else {
                    Err("checksum mismatch".to_string())
                }
            });

        match entry {
            Ok(entry) => {
                if let Some(prev) = parsed.entries.last() {
                    if entry.sequence <= prev.sequence {
                        return Err(format!(
                            "line {}: sequence {} does not follow {}",
                            idx + 1,
                            entry.sequence,
                            prev.sequence
                        ));
                    }
                }
                parsed.entries.push(entry);
            }
            Err(e) if is_last && unterminated => {
                warn!("Dropping incomplete trailing journal line: {}", e);
                parsed.torn_tail = true;
            }
            Err(e) => return Err(format!("line {}: {}", idx + 1, e)),
        }
    }

    // A complete entry missing only its newline still needs the file rewritten
    // before anything is appended after it.
    if unterminated {
        parsed.torn_tail = true;
    }
    Ok(parsed)
}
