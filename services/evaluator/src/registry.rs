//! Run records, persisted next to the stage memos so a restart can find the
//! runs it still owes a result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use replay::{StageStore, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::types_runs::{key_run, key_run_index, RunRecord};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("corrupt record at `{key}`: {message}")]
    Codec { key: String, message: String },

    #[error("run `{run_id}` already exists for dataset `{dataset_name}`")]
    Conflict { run_id: String, dataset_name: String },

    #[error("run `{0}` not found")]
    NotFound(String),
}

/// What `create_or_resume` decided.
#[derive(Debug)]
pub enum Admission {
    /// Caller owns the run and must drive it.
    Start(RunRecord),
    /// Already finished or already being driven; nothing to do.
    Existing(RunRecord),
}

pub struct RunRegistry {
    store: Arc<dyn StageStore>,
    runs: RwLock<HashMap<String, RunRecord>>,
    active: Mutex<HashSet<String>>,
    index_lock: Mutex<()>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn StageStore>) -> Self {
        Self {
            store,
            runs: RwLock::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            index_lock: Mutex::new(()),
        }
    }

    /// Loads the indexed runs that still owe a result. Returns how many were
    /// found. Finished runs stay in the store and are read on demand.
    pub async fn load(&self) -> Result<usize, RegistryError> {
        let ids = self.index().await?;
        let mut loaded = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.read::<RunRecord>(&key_run(&id)).await {
                Ok(Some(rec)) if rec.phase.is_terminal() => {
                    // Finished after its index entry was written but before it was pruned.
                    self.remove_from_index(&id).await?;
                }
                Ok(Some(rec)) => {
                    loaded.insert(id, rec);
                }
                Ok(None) => warn!(run_id=%id, "registry: indexed run has no record"),
                Err(e) => warn!(run_id=%id, error=%e, "registry: skipping unreadable run"),
            }
        }
        let n = loaded.len();
        self.runs.write().await.extend(loaded);
        Ok(n)
    }

    pub async fn create_or_resume(
        &self,
        run_id: &str,
        dataset_name: &str,
    ) -> Result<Admission, RegistryError> {
        let existing = self.get(run_id).await?;
        let record = match existing {
            Some(rec) if rec.dataset_name != dataset_name => {
                return Err(RegistryError::Conflict {
                    run_id: run_id.to_string(),
                    dataset_name: rec.dataset_name,
                });
            }
            Some(rec) if rec.phase.is_terminal() => return Ok(Admission::Existing(rec)),
            Some(rec) => rec,
            None => {
                let rec = RunRecord::new(run_id.to_string(), dataset_name.to_string());
                self.save(&rec).await?;
                self.add_to_index(run_id).await?;
                rec
            }
        };

        if self.claim(run_id).await {
            Ok(Admission::Start(record))
        } else {
            Ok(Admission::Existing(record))
        }
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, RegistryError> {
        if let Some(rec) = self.runs.read().await.get(run_id) {
            return Ok(Some(rec.clone()));
        }
        let rec = self.read::<RunRecord>(&key_run(run_id)).await?;
        if let Some(r) = rec.as_ref().filter(|r| !r.phase.is_terminal()) {
            self.runs.write().await.insert(run_id.to_string(), r.clone());
        }
        Ok(rec)
    }

    /// Applies `f` to the stored record and persists the result.
    pub async fn update<F>(&self, run_id: &str, f: F) -> Result<RunRecord, RegistryError>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut rec = self
            .get(run_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))?;
        f(&mut rec);
        rec.updated_at = Utc::now();
        self.save(&rec).await?;
        Ok(rec)
    }

    /// Runs loaded into memory that have not reached a terminal phase.
    pub async fn unfinished(&self) -> Vec<RunRecord> {
        let mut out: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| !r.phase.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Marks the run as driven by this process. False if it already is.
    pub async fn claim(&self, run_id: &str) -> bool {
        self.active.lock().await.insert(run_id.to_string())
    }

    pub async fn release(&self, run_id: &str) {
        self.active.lock().await.remove(run_id);
    }

    /// Number of runs held in memory.
    pub async fn resident(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Persists `rec`. Only unfinished runs stay resident and indexed.
    async fn save(&self, rec: &RunRecord) -> Result<(), RegistryError> {
        self.write(&key_run(&rec.run_id), rec).await?;
        if rec.phase.is_terminal() {
            self.runs.write().await.remove(&rec.run_id);
            self.remove_from_index(&rec.run_id).await?;
        } else {
            self.runs.write().await.insert(rec.run_id.clone(), rec.clone());
        }
        Ok(())
    }

    async fn index(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.read(key_run_index()).await?.unwrap_or_default())
    }

    async fn add_to_index(&self, run_id: &str) -> Result<(), RegistryError> {
        let _guard = self.index_lock.lock().await;
        let mut ids = self.index().await?;
        if !ids.iter().any(|id| id == run_id) {
            ids.push(run_id.to_string());
            self.write(key_run_index(), &ids).await?;
        }
        Ok(())
    }

    async fn remove_from_index(&self, run_id: &str) -> Result<(), RegistryError> {
        let _guard = self.index_lock.lock().await;
        let mut ids = self.index().await?;
        let before = ids.len();
        ids.retain(|id| id != run_id);
        if ids.len() != before {
            self.write(key_run_index(), &ids).await?;
        }
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RegistryError> {
        match self.store.get(key).await? {
            Some(v) => serde_json::from_value(v).map(Some).map_err(|e| RegistryError::Codec {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        let v = serde_json::to_value(value).map_err(|e| RegistryError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.store.put(key, &v).await?;
        Ok(())
    }
}
