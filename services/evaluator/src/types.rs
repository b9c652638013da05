use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatasetItem {
    pub id: String,
    pub text: String,
    pub expected_category: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl BatchStatus {
    /// Maps the provider's status string. Anything unrecognised is treated as
    /// still running so the poller keeps waiting.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "queued" | "validating" => BatchStatus::Queued,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "expired" => BatchStatus::Expired,
            "cancelled" => BatchStatus::Cancelled,
            _ => BatchStatus::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Queued | BatchStatus::Running)
    }

    pub fn is_success(self) -> bool {
        self == BatchStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchJobHandle {
    pub job_id: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Provider request counters, when the provider reports them.
    pub requests: Option<RequestCounts>,
    /// Sum of the per-line usage blocks in the result file.
    pub tokens: TokenUsage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub id: String,
    pub category: String,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRecord {
    pub id: String,
    pub expected: String,
    pub predicted: String,
    pub correct: bool,
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// Absent when no result could be scored.
    pub accuracy: Option<f64>,
    pub correct_count: usize,
    pub total_count: usize,
    /// Results matched to a loaded item, with or without ground truth.
    pub items_processed: usize,
    pub job_id: String,
    pub usage: Usage,
    pub records: Vec<EvaluationRecord>,
}

/// What a finished run reports back to whoever triggered it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvaluationOutcome {
    pub dataset_name: String,
    pub items_processed: usize,
    pub job_id: String,
    pub accuracy: Option<f64>,
    pub correct_count: usize,
    pub total_count: usize,
    pub categories_used: Vec<String>,
    pub usage: Usage,
}

pub fn accuracy(correct: usize, total: usize) -> Option<f64> {
    (total > 0).then(|| correct as f64 / total as f64)
}

/// Ids arrive as strings or numbers depending on the source.
pub fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
