use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EvaluationOutcome;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Loading,
    Uploading,
    Submitting,
    Polling,
    Recording,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub dataset_name: String,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Originating stage and cause for failed runs.
    pub failed_stage: Option<String>,
    pub error: Option<String>,

    pub outcome: Option<EvaluationOutcome>,
}

impl RunRecord {
    pub fn new(run_id: String, dataset_name: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            dataset_name,
            phase: RunPhase::Pending,
            created_at: now,
            updated_at: now,
            failed_stage: None,
            error: None,
            outcome: None,
        }
    }
}

// ---- Store keys (helpers) ----
pub fn key_run(run_id: &str) -> String {
    format!("run:{run_id}")
}

pub fn key_run_index() -> &'static str {
    "runs:index"
}
