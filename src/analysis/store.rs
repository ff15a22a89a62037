//! Storage collaborator for analysis results.
//!
//! The pipeline persists two derived subsets: remedy suggestions from a full
//! case analysis and the portrait summary from narrative analysis. Everything
//! else is handed back to the caller and never stored here.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::types::RemedySuggestion;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedySuggestionRecord {
    pub analysis_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub case_summary: String,
    pub remedies: Vec<RemedySuggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortraitSummaryRecord {
    pub analysis_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub portrait_summary: String,
    pub themes: Vec<String>,
}

/// Where successful results go. The hosting application owns case identity,
/// so an implementation is usually scoped to one open case.
pub trait AnalysisStore: Send + Sync {
    fn persist_remedy_suggestions(&self, record: &RemedySuggestionRecord) -> Result<(), StoreError>;

    fn persist_portrait_summary(&self, record: &PortraitSummaryRecord) -> Result<(), StoreError>;
}

// ──────────────────────────────────────────────
// In-memory store
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    remedies: Mutex<Vec<RemedySuggestionRecord>>,
    portraits: Mutex<Vec<PortraitSummaryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remedy_suggestions(&self) -> Vec<RemedySuggestionRecord> {
        self.remedies.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn portrait_summaries(&self) -> Vec<PortraitSummaryRecord> {
        self.portraits.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl AnalysisStore for MemoryStore {
    fn persist_remedy_suggestions(&self, record: &RemedySuggestionRecord) -> Result<(), StoreError> {
        self.remedies
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }

    fn persist_portrait_summary(&self, record: &PortraitSummaryRecord) -> Result<(), StoreError> {
        self.portraits
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }
}

// ──────────────────────────────────────────────
// JSON-lines file store (CLI)
// ──────────────────────────────────────────────

/// One tagged JSON object per line, appended.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    RemedySuggestions(RemedySuggestionRecord),
    PortraitSummary(PortraitSummaryRecord),
}

pub struct JsonLinesStore {
    path: PathBuf,
    // Serializes appends from concurrent analyses.
    write_lock: Mutex<()>,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, skipping blank lines.
    pub fn load(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    fn append(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl AnalysisStore for JsonLinesStore {
    fn persist_remedy_suggestions(&self, record: &RemedySuggestionRecord) -> Result<(), StoreError> {
        self.append(&StoredRecord::RemedySuggestions(record.clone()))
    }

    fn persist_portrait_summary(&self, record: &PortraitSummaryRecord) -> Result<(), StoreError> {
        self.append(&StoredRecord::PortraitSummary(record.clone()))
    }
}
