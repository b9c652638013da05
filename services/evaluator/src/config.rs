use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub taxonomy_url: String,
    pub dataset_url: String,

    pub provider_base_url: String,
    pub provider_api_key: Option<String>,
    pub model: String,
    pub temperature: f32,

    pub trace_url: Option<String>,
    pub trace_secret: Option<String>,

    pub database_url: Option<String>,
    pub state_dir: PathBuf,
    pub bind_addr: String,

    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub poll_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let taxonomy_url = get("TAXONOMY_URL")?;
        let dataset_url = get("DATASET_URL")?;

        let provider_base_url = std::env::var("PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let provider_api_key = optional("PROVIDER_API_KEY");
        let model = std::env::var("EVAL_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let temperature: f32 = parse_or("EVAL_TEMPERATURE", 0.1)?;

        let trace_url = optional("TRACE_URL");
        let trace_secret = optional("TRACE_SECRET");

        let database_url = optional("DATABASE_URL");
        let state_dir = PathBuf::from(
            std::env::var("EVAL_STATE_DIR").unwrap_or_else(|_| "data/stages".to_string()),
        );
        let bind_addr = std::env::var("EVAL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let poll_interval = Duration::from_secs(parse_or("POLL_INTERVAL_SECS", 60)?);
        let poll_max_attempts = parse_or("POLL_MAX_ATTEMPTS", 1440)?;
        let poll_timeout = Duration::from_secs(parse_or("POLL_TIMEOUT_SECS", 90_000)?);

        // Fail fast on obviously broken URLs
        check_url("TAXONOMY_URL", &taxonomy_url)?;
        check_url("DATASET_URL", &dataset_url)?;
        check_url("PROVIDER_BASE_URL", &provider_base_url)?;
        if let Some(url) = &trace_url {
            check_url("TRACE_URL", url)?;
        }
        if !(0.0..=2.0).contains(&temperature) {
            bail!("EVAL_TEMPERATURE must be between 0 and 2");
        }
        if poll_max_attempts == 0 {
            bail!("POLL_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            taxonomy_url,
            dataset_url,
            provider_base_url,
            provider_api_key,
            model,
            temperature,
            trace_url,
            trace_secret,
            database_url,
            state_dir,
            bind_addr,
            poll_interval,
            poll_max_attempts,
            poll_timeout,
        })
    }
}

fn get(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Missing required env var: {key}"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is not valid ({raw}): {e}")),
        None => Ok(default),
    }
}

fn check_url(key: &str, url: &str) -> Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        bail!("{key} must start with http:// or https://");
    }
    Ok(())
}
