//! Drives runs in the background and mirrors their progress into the registry.

use std::sync::Arc;

use async_trait::async_trait;
use replay::StageExecutor;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, RunObserver};
use crate::registry::{Admission, RegistryError, RunRegistry};
use crate::state::SharedState;
use crate::types_runs::{RunPhase, RunRecord};

/// Writes every phase change of one run to the registry.
pub struct RunTracker {
    registry: Arc<RunRegistry>,
    run_id: String,
}

impl RunTracker {
    pub fn new(registry: Arc<RunRegistry>, run_id: String) -> Self {
        Self { registry, run_id }
    }
}

#[async_trait]
impl RunObserver for RunTracker {
    async fn phase_changed(&self, phase: RunPhase) {
        if let Err(e) = self.registry.update(&self.run_id, |r| r.phase = phase).await {
            warn!(run_id=%self.run_id, error=%e, "runner: could not record phase");
        }
    }
}

/// Spawns the pipeline for a run this process has claimed.
pub fn spawn_run(state: SharedState, record: RunRecord) -> JoinHandle<()> {
    tokio::spawn(async move {
        drive(&state, &record.run_id, &record.dataset_name).await;
        state.registry.release(&record.run_id).await;
    })
}

async fn drive(state: &SharedState, run_id: &str, dataset_name: &str) {
    let executor = StageExecutor::new(run_id, state.store.clone());
    let tracker = RunTracker::new(state.registry.clone(), run_id.to_string());
    let pipeline = Pipeline::new(executor, state.connectors.clone(), state.settings.clone())
        .with_observer(Arc::new(tracker));

    let result = pipeline.run(dataset_name).await;
    let update = match result {
        Ok(outcome) => {
            info!(run_id, items = outcome.items_processed, "runner: run completed");
            state
                .registry
                .update(run_id, |r| {
                    r.phase = RunPhase::Completed;
                    r.outcome = Some(outcome);
                })
                .await
        }
        Err(e) => {
            error!(run_id, stage = e.stage().unwrap_or("-"), error=%e, "runner: run failed");
            state
                .registry
                .update(run_id, |r| {
                    r.phase = RunPhase::Failed;
                    r.failed_stage = e.stage().map(str::to_string);
                    r.error = Some(e.to_string());
                })
                .await
        }
    };
    if let Err(e) = update {
        warn!(run_id, error=%e, "runner: could not record final state");
    }
}

/// Starts the run unless it is finished or already running here.
pub async fn submit_run(
    state: &SharedState,
    run_id: &str,
    dataset_name: &str,
) -> Result<(RunRecord, bool), RegistryError> {
    match state.registry.create_or_resume(run_id, dataset_name).await? {
        Admission::Start(record) => {
            spawn_run(state.clone(), record.clone());
            Ok((record, true))
        }
        Admission::Existing(record) => Ok((record, false)),
    }
}

/// Re-spawns every run a previous process left unfinished. Completed stages
/// replay from the store, so each run picks up where it stopped.
pub async fn recover_runs(state: &SharedState) -> Result<usize, RegistryError> {
    state.registry.load().await?;
    let mut resumed = 0;
    for record in state.registry.unfinished().await {
        if state.registry.claim(&record.run_id).await {
            info!(run_id=%record.run_id, phase=?record.phase, "runner: resuming run");
            spawn_run(state.clone(), record);
            resumed += 1;
        }
    }
    Ok(resumed)
}
