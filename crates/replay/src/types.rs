//! Persisted bookkeeping for a single stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State of one stage within one run.
///
/// `attempts` is written before every attempt starts, so a crash in the middle of
/// an attempt still consumes budget when the run resumes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageRecord {
    Running {
        attempts: u32,
        started_at: DateTime<Utc>,
        last_error: Option<String>,
    },
    Completed {
        value: Value,
        attempts: u32,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        attempts: u32,
        failed_at: DateTime<Utc>,
    },
}

impl StageRecord {
    pub fn attempts(&self) -> u32 {
        match self {
            StageRecord::Running { attempts, .. }
            | StageRecord::Completed { attempts, .. }
            | StageRecord::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StageRecord::Completed { .. })
    }
}

// ---- Keys ----
pub fn stage_key(run_id: &str, stage: &str) -> String {
    format!("run:{run_id}:stage:{stage}")
}
