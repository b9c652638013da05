use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::connector::{BatchProvider, BatchStatusReport, ConnectorError, NewBatch, ProviderInfo};
use crate::connector_http::{read_json, read_text};
use crate::types::{BatchJobHandle, BatchStatus, RequestCounts};

/// OpenAI-compatible Files + Batches API.
pub struct OpenAiBatchProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    request_counts: Option<RequestCounts>,
}

impl OpenAiBatchProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl BatchProvider for OpenAiBatchProvider {
    async fn upload_file(&self, filename: &str, payload: Bytes) -> Result<String, ConnectorError> {
        let part = reqwest::multipart::Part::bytes(payload.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let resp = self
            .authed(self.client.post(self.url("/v1/files")))
            .multipart(form)
            .send()
            .await?;
        let file: FileObject = read_json(resp).await?;
        Ok(file.id)
    }

    async fn create_batch(&self, req: &NewBatch) -> Result<BatchJobHandle, ConnectorError> {
        let resp = self
            .authed(self.client.post(self.url("/v1/batches")))
            .json(req)
            .send()
            .await?;
        let batch: BatchObject = read_json(resp).await?;

        let created_at = batch
            .created_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);
        Ok(BatchJobHandle {
            job_id: batch.id,
            status: BatchStatus::from_provider(&batch.status),
            created_at,
        })
    }

    async fn batch_status(&self, job_id: &str) -> Result<BatchStatusReport, ConnectorError> {
        let path = format!("/v1/batches/{}", urlencoding::encode(job_id));
        let resp = self.authed(self.client.get(self.url(&path))).send().await?;
        let batch: BatchObject = read_json(resp).await?;

        Ok(BatchStatusReport {
            status: BatchStatus::from_provider(&batch.status),
            output_file_id: batch.output_file_id,
            error_file_id: batch.error_file_id,
            request_counts: batch.request_counts,
        })
    }

    async fn file_content(&self, file_id: &str) -> Result<String, ConnectorError> {
        let path = format!("/v1/files/{}/content", urlencoding::encode(file_id));
        let resp = self.authed(self.client.get(self.url(&path))).send().await?;
        read_text(resp).await
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "openai-batch".to_string(),
        }
    }
}
