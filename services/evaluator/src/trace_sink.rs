use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::info;

use crate::connector::{ConnectorError, TraceRecord, TraceSink};
use crate::connector_http::read_text;

type HmacSha256 = Hmac<Sha256>;

/// Buffers records and ships them in one signed batch on `flush`.
pub struct HttpTraceSink {
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
    pending: Mutex<Vec<TraceRecord>>,
}

impl HttpTraceSink {
    pub fn new(base_url: String, secret: Option<String>) -> Self {
        Self {
            url: format!("{}/ingest", base_url.trim_end_matches('/')),
            secret,
            client: reqwest::Client::new(),
            pending: Mutex::new(Vec::new()),
        }
    }
}

/// Same ids in the same order always give the same key, so a re-sent batch is
/// recognisable as a duplicate.
pub fn batch_idempotency_key(records: &[TraceRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in records {
        hasher.update(r.id.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub fn sign_payload(secret: &str, ts: i64, body: &str) -> Result<String, ConnectorError> {
    let payload = format!("{}.{}", ts, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ConnectorError::Malformed(format!("trace secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    async fn submit(&self, record: TraceRecord) -> Result<(), ConnectorError> {
        self.pending.lock().await.push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConnectorError> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({ "batch": &*pending }).to_string();
        let ts = Utc::now().timestamp();

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", batch_idempotency_key(&pending))
            .header("X-Timestamp", ts.to_string());
        if let Some(secret) = &self.secret {
            req = req.header("X-Signature", sign_payload(secret, ts, &body)?);
        }

        // Records stay buffered until the sink has acknowledged them.
        let resp = req.body(body).send().await?;
        read_text(resp).await?;

        info!(records = pending.len(), "trace: flushed");
        pending.clear();
        Ok(())
    }
}

/// Used when no trace endpoint is configured: records go to the log.
#[derive(Default)]
pub struct LogTraceSink {
    pending: Mutex<Vec<TraceRecord>>,
}

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn submit(&self, record: TraceRecord) -> Result<(), ConnectorError> {
        self.pending.lock().await.push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConnectorError> {
        let mut pending = self.pending.lock().await;
        for record in pending.drain(..) {
            let json = serde_json::to_string(&record)
                .map_err(|e| ConnectorError::Malformed(e.to_string()))?;
            info!(target: "trace", id=%record.id, name=%record.name, record=%json, "trace: record");
        }
        Ok(())
    }
}
