//! Append-only usage log. One entry per authenticated request, never updated.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(AuditStatus::Success),
            "failed" => Some(AuditStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    /// Unique; equal to `request_id`.
    pub id: String,
    pub request_id: String,
    pub user_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub request_snapshot: Value,
    pub response_snapshot: Value,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since_ts_ms: Option<i64>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl AuditQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, entry: &UsageLogEntry) -> bool {
        self.since_ts_ms
            .is_none_or(|since| entry.created_at_ms >= since)
            && self
                .user_id
                .as_deref()
                .is_none_or(|user_id| entry.user_id == user_id)
            && self
                .workflow_id
                .as_deref()
                .is_none_or(|workflow_id| entry.workflow_id == workflow_id)
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("usage log entry {0} already exists")]
    Duplicate(String),
    #[error("audit backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), AuditError>;

    /// Newest first.
    async fn list(&self, query: &AuditQuery) -> Result<Vec<UsageLogEntry>, AuditError>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<UsageLogEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in append order.
    pub fn entries(&self) -> Vec<UsageLogEntry> {
        self.lock().map(|entries| entries.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<UsageLogEntry>>, AuditError> {
        self.entries
            .lock()
            .map_err(|_| AuditError::Backend("audit log lock poisoned".to_string()))
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), AuditError> {
        let mut entries = self.lock()?;
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(AuditError::Duplicate(entry.id));
        }
        entries.push(entry);
        Ok(())
    }

    async fn list(&self, query: &AuditQuery) -> Result<Vec<UsageLogEntry>, AuditError> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}
