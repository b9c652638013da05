//! Seams to the external services. Every stage asks [`Connectors`] for a fresh
//! client, so nothing mutable is shared between stages.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use replay::AttemptError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{BatchJobHandle, BatchStatus, Category, RequestCounts};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ConnectorError {
    /// Network failures, throttling and server errors are worth another attempt.
    /// Everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Transport(e) => !e.is_decode() && !e.is_builder(),
            ConnectorError::Status { status, .. } => *status == 429 || *status >= 500,
            ConnectorError::Malformed(_) => false,
        }
    }

    pub fn into_attempt(self, context: impl Into<String>) -> AttemptError {
        let transient = self.is_transient();
        let err = anyhow::Error::new(self).context(context.into());
        if transient {
            AttemptError::Transient(err)
        } else {
            AttemptError::Fatal(err)
        }
    }
}

/// One dataset entry as the source returns it. `input` and `expected_output`
/// are either plain strings or objects; see `loader::normalize_item`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawDatasetItem {
    pub id: Value,
    #[serde(default)]
    pub input: Value,
    #[serde(default, alias = "expectedOutput")]
    pub expected_output: Value,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBatch {
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchStatusReport {
    pub status: BatchStatus,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub request_counts: Option<RequestCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
}

/// A node in the trace tree sent to the sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub input: Value,
    pub output: Value,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceRecord>,
}

impl TraceRecord {
    /// Ids are derived from the run and a per-run name, so a retried attempt
    /// re-sends the same ids and the sink can drop duplicates.
    pub fn stable_id(run_id: &str, name: &str) -> Uuid {
        let run_ns = Uuid::new_v5(&Uuid::NAMESPACE_OID, run_id.as_bytes());
        Self::child_id(&run_ns, name)
    }

    /// Id scoped under `parent`. Names are never concatenated, so no choice of
    /// name can reproduce an id from another scope.
    pub fn child_id(parent: &Uuid, name: &str) -> Uuid {
        Uuid::new_v5(parent, name.as_bytes())
    }
}

#[async_trait]
pub trait TaxonomySource: Send + Sync {
    async fn categories(&self) -> Result<Vec<Category>, ConnectorError>;
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn items(&self, dataset_name: &str) -> Result<Vec<RawDatasetItem>, ConnectorError>;
}

#[async_trait]
pub trait BatchProvider: Send + Sync {
    async fn upload_file(&self, filename: &str, payload: Bytes) -> Result<String, ConnectorError>;
    async fn create_batch(&self, req: &NewBatch) -> Result<BatchJobHandle, ConnectorError>;
    async fn batch_status(&self, job_id: &str) -> Result<BatchStatusReport, ConnectorError>;
    async fn file_content(&self, file_id: &str) -> Result<String, ConnectorError>;
    fn info(&self) -> ProviderInfo;
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn submit(&self, record: TraceRecord) -> Result<(), ConnectorError>;
    /// Returns once every record submitted so far is durable on the sink side.
    async fn flush(&self) -> Result<(), ConnectorError>;
}

pub trait Connectors: Send + Sync {
    fn taxonomy(&self) -> Box<dyn TaxonomySource>;
    fn dataset(&self) -> Box<dyn DatasetSource>;
    fn provider(&self) -> Box<dyn BatchProvider>;
    fn trace_sink(&self) -> Box<dyn TraceSink>;
}
