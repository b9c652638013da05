//! Completion poller.
//!
//! Each poll is one attempt of the `await-batch` stage. A job that is still
//! queued or running answers "not ready", and the executor waits out the poll
//! interval before the next attempt. The attempt counter lives in the stage
//! store, so polling picks up where it left off after a restart.

use replay::{AttemptError, RetryPolicy, StageError, StageExecutor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::connector::Connectors;
use crate::types::{BatchJobHandle, BatchStatus, ClassificationResult, RequestCounts, TokenUsage, Usage};

pub const STAGE_AWAIT: &str = "await-batch";

#[derive(Debug, Error)]
pub enum PollError {
    #[error("batch job {job_id} ended with status {status}")]
    Terminal { job_id: String, status: BatchStatus },

    #[error("batch job {job_id} completed without an output file")]
    MissingOutput { job_id: String },

    #[error("result line {line}: {reason}")]
    Decode { line: usize, reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchOutput {
    pub job_id: String,
    pub results: Vec<ClassificationResult>,
    pub usage: Usage,
}

// ---- Result file wire format ----
#[derive(Deserialize)]
struct Envelope {
    #[serde(alias = "customId")]
    custom_id: String,
    #[serde(default)]
    response: Option<EnvelopeResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct EnvelopeResponse {
    #[serde(default)]
    status_code: Option<u16>,
    body: ResponseBody,
}

#[derive(Deserialize)]
struct ResponseBody {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

/// What the model was told to answer with.
#[derive(Deserialize)]
struct Payload {
    category: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub async fn await_batch(
    executor: &StageExecutor,
    connectors: &dyn Connectors,
    policy: &RetryPolicy,
    handle: &BatchJobHandle,
) -> Result<BatchOutput, StageError> {
    let job_id = handle.job_id.as_str();
    executor
        .execute(STAGE_AWAIT, policy, || poll_once(connectors, job_id))
        .await
}

async fn poll_once(connectors: &dyn Connectors, job_id: &str) -> Result<BatchOutput, AttemptError> {
    let provider = connectors.provider();
    let report = provider
        .batch_status(job_id)
        .await
        .map_err(|e| e.into_attempt(format!("querying batch {job_id}")))?;

    let status = report.status;
    if !status.is_terminal() {
        return Err(AttemptError::not_ready(format!("batch {job_id} is {status}")));
    }
    if !status.is_success() {
        warn!(job_id, %status, error_file = ?report.error_file_id, "poller: batch ended without results");
        return Err(AttemptError::fatal(PollError::Terminal {
            job_id: job_id.to_string(),
            status,
        }));
    }

    let file_id = report.output_file_id.ok_or_else(|| {
        AttemptError::fatal(PollError::MissingOutput {
            job_id: job_id.to_string(),
        })
    })?;
    let content = provider
        .file_content(&file_id)
        .await
        .map_err(|e| e.into_attempt(format!("downloading results file {file_id}")))?;

    let results = decode_results(&content).map_err(AttemptError::fatal)?;
    let usage = usage_for(report.request_counts, &results);
    info!(job_id, results = results.len(), "poller: batch results decoded");

    Ok(BatchOutput {
        job_id: job_id.to_string(),
        results,
        usage,
    })
}

/// Decodes the provider's result file. Any line that does not carry a usable
/// classification fails the whole file.
pub fn decode_results(content: &str) -> Result<Vec<ClassificationResult>, PollError> {
    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(decode_line(line).map_err(|reason| PollError::Decode {
            line: line_no,
            reason,
        })?);
    }
    Ok(out)
}

fn decode_line(line: &str) -> Result<ClassificationResult, String> {
    let env: Envelope = serde_json::from_str(line).map_err(|e| format!("invalid envelope: {e}"))?;
    let id = env.custom_id;

    if let Some(err) = env.error.filter(|e| !e.is_null()) {
        return Err(format!("request `{id}` failed: {err}"));
    }
    let resp = env
        .response
        .ok_or_else(|| format!("request `{id}` has no response"))?;
    if let Some(code) = resp.status_code.filter(|c| !(200..300).contains(c)) {
        return Err(format!("request `{id}` returned HTTP {code}"));
    }

    let content = resp
        .body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| format!("request `{id}` has no message content"))?;
    let payload: Payload = serde_json::from_str(&content)
        .map_err(|e| format!("request `{id}` payload is not a classification: {e}"))?;

    Ok(ClassificationResult {
        id,
        category: payload.category,
        confidence: payload.confidence,
        reasoning: payload.reasoning,
        usage: resp.body.usage,
    })
}

pub fn usage_for(counts: Option<RequestCounts>, results: &[ClassificationResult]) -> Usage {
    let mut tokens = TokenUsage::default();
    for u in results.iter().filter_map(|r| r.usage.as_ref()) {
        tokens.add(u);
    }
    Usage {
        requests: counts,
        tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(id: &str, content: &str) -> String {
        json!({
            "id": "batch_req_1",
            "custom_id": id,
            "response": {
                "status_code": 200,
                "body": {
                    "choices": [{"message": {"role": "assistant", "content": content}}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
                }
            },
            "error": null
        })
        .to_string()
    }

    #[test]
    fn decodes_each_line() {
        let file = format!(
            "{}\n\n{}\n",
            line("a", r#"{"category":"true","confidence":0.9,"reasoning":"clear"}"#),
            line("b", r#"{"category":"false"}"#),
        );
        let results = decode_results(&file).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[0].confidence, Some(0.9));
        assert_eq!(results[0].reasoning.as_deref(), Some("clear"));
        assert_eq!(results[1].category, "false");
        assert_eq!(results[1].confidence, None);

        let usage = usage_for(None, &results);
        assert_eq!(usage.tokens.total_tokens, 30);
        assert_eq!(usage.requests, None);
    }

    #[test]
    fn camel_case_custom_id_is_accepted() {
        let l = json!({
            "customId": "a",
            "response": {"body": {"choices": [{"message": {"content": "{\"category\":\"x\"}"}}]}}
        })
        .to_string();
        assert_eq!(decode_results(&l).unwrap()[0].id, "a");
    }

    #[test]
    fn malformed_lines_fail_with_line_number() {
        let file = format!("{}\nnot json\n", line("a", r#"{"category":"true"}"#));
        match decode_results(&file).unwrap_err() {
            PollError::Decode { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other}"),
        }

        let bad_payload = line("a", "the answer is true");
        assert!(matches!(decode_results(&bad_payload), Err(PollError::Decode { line: 1, .. })));
    }

    #[test]
    fn failed_requests_are_not_silently_dropped() {
        let l = json!({
            "custom_id": "a",
            "response": null,
            "error": {"code": "server_error", "message": "boom"}
        })
        .to_string();
        let err = decode_results(&l).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
