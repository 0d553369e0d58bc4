use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Run metadata handed to the persistence boundary after every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manuscript_id: Option<Uuid>,
    #[serde(default)]
    pub chapters: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("failed to write run history `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to encode run record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("run store unavailable: {0}")]
    Unavailable(String),
}

/// External run history. A failing store never fails the run.
pub trait RunStore: Send + Sync {
    fn record(&self, entry: &RunRecord) -> Result<(), RunStoreError>;
}

/// Keeps records in memory, for library callers and tests.
#[derive(Default)]
pub struct MemoryRunStore {
    records: Mutex<Vec<RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RunStore for MemoryRunStore {
    fn record(&self, entry: &RunRecord) -> Result<(), RunStoreError> {
        self.records
            .lock()
            .map_err(|_| RunStoreError::Unavailable("history lock poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}
