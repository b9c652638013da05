use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{stage_key, RetryPolicy, StageRecord, StageStore, StoreError};

/// Outcome of a single failed attempt. Decides whether the executor tries again.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The work is waiting on something external. Retried after the policy delay
    /// and never reported as a failure.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("{0:#}")]
    Transient(anyhow::Error),

    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl AttemptError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        AttemptError::NotReady(reason.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        AttemptError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        AttemptError::Fatal(err.into())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage `{stage}` failed: {cause:#}")]
    Failed { stage: String, cause: anyhow::Error },

    #[error("stage `{stage}` gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        stage: String,
        attempts: u32,
        last_error: String,
    },

    #[error("stage `{stage}` timed out after {elapsed:?}")]
    TimedOut { stage: String, elapsed: Duration },

    #[error("stage `{stage}` already failed in this run: {error}")]
    PreviouslyFailed { stage: String, error: String },

    #[error("stage `{stage}` store error: {source}")]
    Store {
        stage: String,
        #[source]
        source: StoreError,
    },

    #[error("stage `{stage}` result codec error: {message}")]
    Codec { stage: String, message: String },
}

impl StageError {
    pub fn stage(&self) -> &str {
        match self {
            StageError::Failed { stage, .. }
            | StageError::Exhausted { stage, .. }
            | StageError::TimedOut { stage, .. }
            | StageError::PreviouslyFailed { stage, .. }
            | StageError::Store { stage, .. }
            | StageError::Codec { stage, .. } => stage,
        }
    }

    /// The error returned by the work itself, when the stage failed fatally.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            StageError::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Runs stages for one pipeline run.
///
/// Cheap to clone; clones share the same store and run id.
#[derive(Clone)]
pub struct StageExecutor {
    run_id: String,
    store: Arc<dyn StageStore>,
}

impl StageExecutor {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn StageStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn record(&self, stage: &str) -> Result<Option<StageRecord>, StageError> {
        let key = stage_key(&self.run_id, stage);
        let raw = self.store.get(&key).await.map_err(|source| StageError::Store {
            stage: stage.to_string(),
            source,
        })?;
        raw.map(serde_json::from_value)
            .transpose()
            .map_err(|e| StageError::Codec {
                stage: stage.to_string(),
                message: format!("stored record: {e}"),
            })
    }

    async fn save(&self, stage: &str, rec: &StageRecord) -> Result<(), StageError> {
        let key = stage_key(&self.run_id, stage);
        let value = serde_json::to_value(rec).map_err(|e| StageError::Codec {
            stage: stage.to_string(),
            message: e.to_string(),
        })?;
        self.store.put(&key, &value).await.map_err(|source| StageError::Store {
            stage: stage.to_string(),
            source,
        })
    }

    async fn fail(&self, stage: &str, attempts: u32, err: StageError) -> StageError {
        error!(run_id=%self.run_id, stage, attempts, error=%err, "stage: failed");
        let rec = StageRecord::Failed {
            error: err.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        match self.save(stage, &rec).await {
            Ok(()) => err,
            Err(store_err) => {
                warn!(run_id=%self.run_id, stage, error=%store_err, "stage: could not persist failure");
                err
            }
        }
    }

    /// Run `work` under `policy`, or return the memoized value if `stage` already
    /// completed in this run.
    pub async fn execute<T, F, Fut>(
        &self,
        stage: &str,
        policy: &RetryPolicy,
        mut work: F,
    ) -> Result<T, StageError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let (mut attempts, started_at, mut last_error) = match self.record(stage).await? {
            Some(StageRecord::Completed { value, attempts, .. }) => {
                info!(run_id=%self.run_id, stage, attempts, "stage: replaying memoized result");
                return serde_json::from_value(value).map_err(|e| StageError::Codec {
                    stage: stage.to_string(),
                    message: e.to_string(),
                });
            }
            Some(StageRecord::Failed { error, .. }) => {
                return Err(StageError::PreviouslyFailed {
                    stage: stage.to_string(),
                    error,
                });
            }
            Some(StageRecord::Running {
                attempts,
                started_at,
                last_error,
            }) => {
                info!(run_id=%self.run_id, stage, attempts, "stage: resuming");
                (attempts, started_at, last_error)
            }
            None => (0, Utc::now(), None),
        };

        let max_attempts = policy.max_attempts();

        loop {
            let elapsed = elapsed_since(started_at);
            if let Some(limit) = policy.timeout {
                if elapsed >= limit {
                    let err = StageError::TimedOut {
                        stage: stage.to_string(),
                        elapsed,
                    };
                    return Err(self.fail(stage, attempts, err).await);
                }
            }
            if attempts >= max_attempts {
                let err = StageError::Exhausted {
                    stage: stage.to_string(),
                    attempts,
                    last_error: last_error.unwrap_or_else(|| "no attempt succeeded".to_string()),
                };
                return Err(self.fail(stage, attempts, err).await);
            }

            attempts += 1;
            self.save(
                stage,
                &StageRecord::Running {
                    attempts,
                    started_at,
                    last_error: last_error.clone(),
                },
            )
            .await?;

            let outcome = match policy.timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit.saturating_sub(elapsed), work()).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let err = StageError::TimedOut {
                                stage: stage.to_string(),
                                elapsed: elapsed_since(started_at),
                            };
                            return Err(self.fail(stage, attempts, err).await);
                        }
                    }
                }
                None => work().await,
            };

            match outcome {
                Ok(value) => {
                    let json = serde_json::to_value(&value).map_err(|e| StageError::Codec {
                        stage: stage.to_string(),
                        message: e.to_string(),
                    })?;
                    self.save(
                        stage,
                        &StageRecord::Completed {
                            value: json,
                            attempts,
                            completed_at: Utc::now(),
                        },
                    )
                    .await?;
                    info!(run_id=%self.run_id, stage, attempts, "stage: completed");
                    return Ok(value);
                }
                Err(AttemptError::Fatal(cause)) => {
                    let err = StageError::Failed {
                        stage: stage.to_string(),
                        cause,
                    };
                    return Err(self.fail(stage, attempts, err).await);
                }
                Err(AttemptError::NotReady(reason)) => {
                    info!(run_id=%self.run_id, stage, attempt=attempts, reason=%reason, "stage: not ready, waiting");
                    last_error = Some(reason);
                }
                Err(AttemptError::Transient(cause)) => {
                    warn!(run_id=%self.run_id, stage, attempt=attempts, error=%format!("{cause:#}"), "stage: attempt failed");
                    last_error = Some(format!("{cause:#}"));
                }
            }

            if attempts >= max_attempts {
                continue;
            }

            self.save(
                stage,
                &StageRecord::Running {
                    attempts,
                    started_at,
                    last_error: last_error.clone(),
                },
            )
            .await?;

            let mut delay = policy.delay_for(attempts);
            if let Some(limit) = policy.timeout {
                delay = delay.min(limit.saturating_sub(elapsed_since(started_at)));
            }
            tokio::time::sleep(delay).await;
        }
    }
}

fn elapsed_since(started_at: DateTime<Utc>) -> Duration {
    (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO)
}
