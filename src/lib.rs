//! Quota-gated execution of remote workflows.
//!
//! A request is authenticated, checked against per-user daily and monthly
//! quotas, forwarded to the upstream workflow service (with retry, or as an
//! event stream) and recorded exactly once in the usage log.

pub mod audit;
pub mod clock;
pub mod config;
mod error;
#[cfg(feature = "server")]
pub mod http;
pub mod orchestrator;
#[cfg(feature = "otel")]
pub mod otel;
pub mod quota;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod utils;
pub mod workflow;

pub use audit::{AuditSink, AuditStatus, MemoryAuditLog, UsageLogEntry};
pub use config::FlowgateConfig;
pub use error::{FlowgateError, Result};
#[cfg(feature = "server")]
pub use http::{FlowgateHttpState, router};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use quota::{MemoryQuotaStore, QuotaGate, QuotaStore};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use workflow::{WorkflowClient, WorkflowClientConfig, WorkflowError};
