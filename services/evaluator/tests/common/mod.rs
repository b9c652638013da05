#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;

use evaluator::connector::{
    BatchProvider, BatchStatusReport, ConnectorError, Connectors, DatasetSource, NewBatch,
    ProviderInfo, RawDatasetItem, TaxonomySource, TraceRecord, TraceSink,
};
use evaluator::pipeline::{poll_policy, PipelineSettings};
use evaluator::submitter::ModelParams;
use evaluator::types::{BatchJobHandle, BatchStatus, Category, RequestCounts};
use replay::RetryPolicy;

pub const OUTPUT_FILE: &str = "file-out";

/// Scripted external world shared by every client the fakes hand out.
#[derive(Default)]
pub struct World {
    pub categories: Vec<Category>,
    pub datasets: HashMap<String, Vec<RawDatasetItem>>,
    /// Taxonomy answers 503 this many times before succeeding.
    pub taxonomy_failures: AtomicUsize,
    pub taxonomy_calls: AtomicUsize,
    pub dataset_calls: AtomicUsize,

    /// Popped one per status query; the last one repeats.
    pub statuses: Mutex<VecDeque<BatchStatus>>,
    pub status_calls: AtomicUsize,
    pub output: Mutex<String>,
    pub uploads: Mutex<Vec<(String, Bytes)>>,
    pub creates: Mutex<Vec<NewBatch>>,

    pub flushed: Mutex<Vec<TraceRecord>>,
    pub flush_calls: AtomicUsize,
    /// Records still buffered when a sink was dropped.
    pub unflushed: AtomicUsize,
}

impl World {
    pub fn new() -> Arc<Self> {
        let mut w = World {
            categories: vec![
                Category { id: "c1".into(), title: "false".into() },
                Category { id: "c2".into(), title: "true".into() },
            ],
            ..Default::default()
        };
        w.datasets.insert(
            "claims".to_string(),
            vec![
                raw_item(json!({"id": "a", "input": "The sky is blue.", "expected_output": "true"})),
                raw_item(json!({
                    "id": "b",
                    "input": {"text": "Fish can fly."},
                    "expectedOutput": {"category": "false"}
                })),
            ],
        );
        Arc::new(w)
    }

    pub fn script(&self, statuses: &[BatchStatus]) {
        *self.statuses.lock().unwrap() = statuses.iter().copied().collect();
    }

    pub fn set_output(&self, lines: &[String]) {
        *self.output.lock().unwrap() = lines.join("\n");
    }

    pub fn flushed_names(&self) -> Vec<String> {
        self.flushed.lock().unwrap().iter().map(|r| r.name.clone()).collect()
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn raw_item(v: serde_json::Value) -> RawDatasetItem {
    serde_json::from_value(v).unwrap()
}

/// One provider result envelope whose message content is the given category.
pub fn result_line(id: &str, category: &str) -> String {
    let content = json!({"category": category, "confidence": 0.9, "reasoning": "because"}).to_string();
    json!({
        "id": format!("req-{id}"),
        "custom_id": id,
        "response": {
            "status_code": 200,
            "body": {
                "choices": [{"message": {"role": "assistant", "content": content}}],
                "usage": {"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30}
            }
        },
        "error": null
    })
    .to_string()
}

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        model: ModelParams { model: "test-model".into(), temperature: 0.1 },
        default_policy: RetryPolicy::constant(Duration::from_millis(5), 3),
        poll_policy: poll_policy(Duration::from_millis(5), 20, Duration::from_secs(10)),
    }
}

struct FakeTaxonomy(Arc<World>);

#[async_trait]
impl TaxonomySource for FakeTaxonomy {
    async fn categories(&self) -> Result<Vec<Category>, ConnectorError> {
        self.0.taxonomy_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.0.taxonomy_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.taxonomy_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Status { status: 503, body: "busy".into() });
        }
        Ok(self.0.categories.clone())
    }
}

struct FakeDataset(Arc<World>);

#[async_trait]
impl DatasetSource for FakeDataset {
    async fn items(&self, dataset_name: &str) -> Result<Vec<RawDatasetItem>, ConnectorError> {
        self.0.dataset_calls.fetch_add(1, Ordering::SeqCst);
        self.0
            .datasets
            .get(dataset_name)
            .cloned()
            .ok_or_else(|| ConnectorError::Status { status: 404, body: "no such dataset".into() })
    }
}

struct FakeProvider(Arc<World>);

#[async_trait]
impl BatchProvider for FakeProvider {
    async fn upload_file(&self, filename: &str, payload: Bytes) -> Result<String, ConnectorError> {
        let mut uploads = self.0.uploads.lock().unwrap();
        uploads.push((filename.to_string(), payload));
        Ok(format!("file-{}", uploads.len()))
    }

    async fn create_batch(&self, req: &NewBatch) -> Result<BatchJobHandle, ConnectorError> {
        let mut creates = self.0.creates.lock().unwrap();
        creates.push(req.clone());
        Ok(BatchJobHandle {
            job_id: format!("batch-{}", creates.len()),
            status: BatchStatus::Queued,
            created_at: Utc::now(),
        })
    }

    async fn batch_status(&self, _job_id: &str) -> Result<BatchStatusReport, ConnectorError> {
        self.0.status_calls.fetch_add(1, Ordering::SeqCst);
        let status = {
            let mut q = self.0.statuses.lock().unwrap();
            if q.len() > 1 {
                q.pop_front()
            } else {
                q.front().copied()
            }
        }
        .unwrap_or(BatchStatus::Running);

        let done = status == BatchStatus::Completed;
        Ok(BatchStatusReport {
            status,
            output_file_id: done.then(|| OUTPUT_FILE.to_string()),
            error_file_id: None,
            request_counts: done.then_some(RequestCounts { total: 2, completed: 2, failed: 0 }),
        })
    }

    async fn file_content(&self, file_id: &str) -> Result<String, ConnectorError> {
        if file_id != OUTPUT_FILE {
            return Err(ConnectorError::Status { status: 404, body: file_id.to_string() });
        }
        Ok(self.0.output.lock().unwrap().clone())
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo { name: "fake".into() }
    }
}

/// Buffers like a real sink; anything left unflushed on drop is counted.
struct RecordingSink {
    world: Arc<World>,
    pending: Mutex<Vec<TraceRecord>>,
}

#[async_trait]
impl TraceSink for RecordingSink {
    async fn submit(&self, record: TraceRecord) -> Result<(), ConnectorError> {
        self.pending.lock().unwrap().push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConnectorError> {
        let drained: Vec<TraceRecord> = self.pending.lock().unwrap().drain(..).collect();
        self.world.flushed.lock().unwrap().extend(drained);
        self.world.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        let left = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        self.world.unflushed.fetch_add(left, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FakeConnectors(pub Arc<World>);

impl Connectors for FakeConnectors {
    fn taxonomy(&self) -> Box<dyn TaxonomySource> {
        Box::new(FakeTaxonomy(self.0.clone()))
    }

    fn dataset(&self) -> Box<dyn DatasetSource> {
        Box::new(FakeDataset(self.0.clone()))
    }

    fn provider(&self) -> Box<dyn BatchProvider> {
        Box::new(FakeProvider(self.0.clone()))
    }

    fn trace_sink(&self) -> Box<dyn TraceSink> {
        Box::new(RecordingSink {
            world: self.0.clone(),
            pending: Mutex::new(Vec::new()),
        })
    }
}
