//! Durable stage execution
//!
//! Runs named units of work at most once per successful completion. Results are
//! memoized in a [`StageStore`] keyed by run id and stage name, so a restarted
//! process replays finished stages instead of re-running them.

mod executor;
mod policy;
mod storage;
mod types;

pub use executor::{AttemptError, StageError, StageExecutor};
pub use policy::{Backoff, RetryPolicy};
pub use storage::{FileStore, InMemoryStore, StageStore};
pub use types::{stage_key, StageRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
