//! One evaluation run: load → upload → create → await → record, every step a
//! memoized stage of the same [`StageExecutor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use replay::{RetryPolicy, StageError, StageExecutor};
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::connector::Connectors;
use crate::loader::load_inputs;
use crate::poller::await_batch;
use crate::recorder::{record_evaluation, RecordContext};
use crate::submitter::{create_batch, upload_batch, ModelParams};
use crate::types::EvaluationOutcome;
use crate::types_runs::RunPhase;

pub const MAX_DATASET_NAME_LEN: usize = 200;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub model: ModelParams,
    /// Loader, submitter and recorder stages.
    pub default_policy: RetryPolicy,
    pub poll_policy: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model: ModelParams {
                model: cfg.model.clone(),
                temperature: cfg.temperature,
            },
            default_policy: RetryPolicy::default(),
            poll_policy: poll_policy(cfg.poll_interval, cfg.poll_max_attempts, cfg.poll_timeout),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model: ModelParams {
                model: "gpt-4o-mini".to_string(),
                temperature: 0.1,
            },
            default_policy: RetryPolicy::default(),
            poll_policy: poll_policy(Duration::from_secs(60), 1440, Duration::from_secs(25 * 60 * 60)),
        }
    }
}

/// Fixed interval, enough attempts to cover the completion window, and a
/// timeout with some slack past it.
pub fn poll_policy(interval: Duration, max_attempts: u32, timeout: Duration) -> RetryPolicy {
    RetryPolicy::constant(interval, max_attempts.saturating_sub(1)).with_timeout(timeout)
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid dataset name {name:?}: {reason}")]
    InvalidDatasetName { name: String, reason: &'static str },

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl PipelineError {
    /// Stage the run failed in, if it got that far.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::InvalidDatasetName { .. } => None,
            PipelineError::Stage(e) => Some(e.stage()),
        }
    }
}

pub fn validate_dataset_name(name: &str) -> Result<(), PipelineError> {
    let reason = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name.chars().count() > MAX_DATASET_NAME_LEN {
        Some("longer than 200 characters")
    } else if name.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PipelineError::InvalidDatasetName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Told about every phase the run enters.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn phase_changed(&self, phase: RunPhase);
}

pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {
    async fn phase_changed(&self, _phase: RunPhase) {}
}

pub struct Pipeline {
    executor: StageExecutor,
    connectors: Arc<dyn Connectors>,
    settings: PipelineSettings,
    observer: Arc<dyn RunObserver>,
}

impl Pipeline {
    pub fn new(
        executor: StageExecutor,
        connectors: Arc<dyn Connectors>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            executor,
            connectors,
            settings,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn run_id(&self) -> &str {
        self.executor.run_id()
    }

    pub async fn run(&self, dataset_name: &str) -> Result<EvaluationOutcome, PipelineError> {
        validate_dataset_name(dataset_name)?;

        let exec = &self.executor;
        let connectors = self.connectors.as_ref();
        let s = &self.settings;
        info!(run_id = exec.run_id(), dataset_name, "pipeline: run started");

        self.observer.phase_changed(RunPhase::Loading).await;
        let (categories, items) = load_inputs(exec, connectors, &s.default_policy, dataset_name).await?;

        self.observer.phase_changed(RunPhase::Uploading).await;
        let upload = upload_batch(exec, connectors, &s.default_policy, &items, &categories, &s.model).await?;

        self.observer.phase_changed(RunPhase::Submitting).await;
        let handle = create_batch(exec, connectors, &s.default_policy, &upload).await?;

        self.observer.phase_changed(RunPhase::Polling).await;
        let output = await_batch(exec, connectors, &s.poll_policy, &handle).await?;

        self.observer.phase_changed(RunPhase::Recording).await;
        let ctx = RecordContext {
            run_id: exec.run_id(),
            dataset_name,
            model: &s.model.model,
            categories: &categories,
            items: &items,
            output: &output,
        };
        let summary = record_evaluation(exec, connectors, &s.default_policy, &ctx).await?;

        info!(
            run_id = exec.run_id(),
            job_id = %summary.job_id,
            accuracy = ?summary.accuracy,
            "pipeline: run finished"
        );
        Ok(EvaluationOutcome {
            dataset_name: dataset_name.to_string(),
            items_processed: summary.items_processed,
            job_id: summary.job_id,
            accuracy: summary.accuracy,
            correct_count: summary.correct_count,
            total_count: summary.total_count,
            categories_used: categories.into_iter().map(|c| c.title).collect(),
            usage: summary.usage,
        })
    }
}
