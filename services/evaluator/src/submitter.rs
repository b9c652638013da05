//! Batch submitter: builds the JSONL request file, uploads it, then starts the
//! bulk job. Upload and job creation are separate stages so a crash after the
//! upload never uploads twice.

use anyhow::anyhow;
use bytes::Bytes;
use replay::{AttemptError, RetryPolicy, StageError, StageExecutor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connector::{Connectors, NewBatch};
use crate::types::{BatchJobHandle, Category, DatasetItem};

pub const STAGE_UPLOAD: &str = "upload-batch";
pub const STAGE_CREATE: &str = "create-batch";

pub const CHAT_ENDPOINT: &str = "/v1/chat/completions";
/// Longest window the provider accepts.
pub const COMPLETION_WINDOW: &str = "24h";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatBody {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
    pub response_format: serde_json::Value,
}

/// One line of the uploaded request file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatBody,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedBatch {
    pub file_id: String,
    pub request_count: usize,
    /// BLAKE3 of the uploaded bytes, hex.
    pub payload_hash_hex: String,
}

pub fn system_prompt(categories: &[Category]) -> String {
    let mut prompt = String::from(
        "You are a text classifier. Assign the user's text to exactly one of these categories:\n",
    );
    for c in categories {
        prompt.push_str("- ");
        prompt.push_str(&c.title);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nAnswer with a JSON object of the form \
         {\"category\": \"<title>\", \"confidence\": <number between 0 and 1>, \"reasoning\": \"<one or two sentences>\"}. \
         The category must be copied exactly from the list above.",
    );
    prompt
}

pub fn build_requests(
    items: &[DatasetItem],
    categories: &[Category],
    params: &ModelParams,
) -> Vec<BatchRequest> {
    let system = system_prompt(categories);
    items
        .iter()
        .map(|item| BatchRequest {
            custom_id: item.id.clone(),
            method: "POST".to_string(),
            url: CHAT_ENDPOINT.to_string(),
            body: ChatBody {
                model: params.model.clone(),
                temperature: params.temperature,
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: system.clone(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: item.text.clone(),
                    },
                ],
                response_format: serde_json::json!({ "type": "json_object" }),
            },
        })
        .collect()
}

pub fn encode_jsonl(requests: &[BatchRequest]) -> serde_json::Result<Bytes> {
    let mut out = Vec::new();
    for r in requests {
        serde_json::to_writer(&mut out, r)?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

pub async fn upload_batch(
    executor: &StageExecutor,
    connectors: &dyn Connectors,
    policy: &RetryPolicy,
    items: &[DatasetItem],
    categories: &[Category],
    params: &ModelParams,
) -> Result<UploadedBatch, StageError> {
    let filename = format!("{}.jsonl", executor.run_id());
    let filename = filename.as_str();
    executor
        .execute(STAGE_UPLOAD, policy, || async move {
            let requests = build_requests(items, categories, params);
            let payload = encode_jsonl(&requests)
                .map_err(|e| AttemptError::fatal(anyhow!("encoding batch payload: {e}")))?;
            let payload_hash_hex = blake3::hash(&payload).to_hex().to_string();

            let provider = connectors.provider();
            let file_id = provider
                .upload_file(filename, payload)
                .await
                .map_err(|e| e.into_attempt("uploading batch payload"))?;

            info!(file_id=%file_id, requests = requests.len(), "submitter: payload uploaded");
            Ok::<_, AttemptError>(UploadedBatch {
                file_id,
                request_count: requests.len(),
                payload_hash_hex,
            })
        })
        .await
}

pub async fn create_batch(
    executor: &StageExecutor,
    connectors: &dyn Connectors,
    policy: &RetryPolicy,
    upload: &UploadedBatch,
) -> Result<BatchJobHandle, StageError> {
    let req = NewBatch {
        input_file_id: upload.file_id.clone(),
        endpoint: CHAT_ENDPOINT.to_string(),
        completion_window: COMPLETION_WINDOW.to_string(),
        metadata: serde_json::json!({ "run_id": executor.run_id() }),
    };
    let req = &req;
    executor
        .execute(STAGE_CREATE, policy, || async move {
            let provider = connectors.provider();
            let handle = provider
                .create_batch(req)
                .await
                .map_err(|e| e.into_attempt(format!("creating batch from file {}", req.input_file_id)))?;
            info!(
                job_id=%handle.job_id,
                status=%handle.status,
                provider=%provider.info().name,
                "submitter: batch created"
            );
            Ok::<_, AttemptError>(handle)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<Category> {
        vec![
            Category { id: "1".into(), title: "false".into() },
            Category { id: "2".into(), title: "Billing / Refunds".into() },
        ]
    }

    #[test]
    fn prompt_lists_every_title_verbatim() {
        let prompt = system_prompt(&categories());
        assert!(prompt.contains("- false\n"));
        assert!(prompt.contains("- Billing / Refunds\n"));
        assert!(prompt.contains("confidence"));
        assert!(prompt.contains("reasoning"));
    }

    #[test]
    fn one_jsonl_line_per_item() {
        let items = vec![
            DatasetItem {
                id: "a".into(),
                text: "first".into(),
                expected_category: None,
                metadata: serde_json::Value::Null,
            },
            DatasetItem {
                id: "b".into(),
                text: "second\nline".into(),
                expected_category: Some("false".into()),
                metadata: serde_json::Value::Null,
            },
        ];
        let params = ModelParams { model: "m".into(), temperature: 0.1 };
        let payload = encode_jsonl(&build_requests(&items, &categories(), &params)).unwrap();

        let text = std::str::from_utf8(&payload).unwrap();
        let lines: Vec<BatchRequest> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].custom_id, "a");
        assert_eq!(lines[1].body.messages[1].content, "second\nline");
        assert_eq!(lines[1].url, CHAT_ENDPOINT);
        assert_eq!(lines[1].body.messages[0].role, "system");
    }
}
