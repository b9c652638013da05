use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::connector::{
    BatchProvider, ConnectorError, Connectors, DatasetSource, RawDatasetItem, TaxonomySource,
    TraceSink,
};
use crate::provider_openai::OpenAiBatchProvider;
use crate::trace_sink::{HttpTraceSink, LogTraceSink};
use crate::types::{id_string, Category};

const MAX_ERROR_BODY: usize = 512;

pub(crate) async fn read_text(resp: reqwest::Response) -> Result<String, ConnectorError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(ConnectorError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ConnectorError> {
    let body = read_text(resp).await?;
    serde_json::from_str(&body).map_err(|e| ConnectorError::Malformed(e.to_string()))
}

/// Lists arrive bare or wrapped in an envelope object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Categories { categories: Vec<T> },
    Items { items: Vec<T> },
    Data { data: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Bare(v)
            | Listing::Categories { categories: v }
            | Listing::Items { items: v }
            | Listing::Data { data: v } => v,
        }
    }
}

#[derive(Deserialize)]
struct RawCategory {
    id: Value,
    title: Option<String>,
}

pub struct HttpTaxonomySource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaxonomySource {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaxonomySource for HttpTaxonomySource {
    async fn categories(&self) -> Result<Vec<Category>, ConnectorError> {
        let url = format!("{}/categories", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).send().await?;
        let listing: Listing<RawCategory> = read_json(resp).await?;

        listing
            .into_vec()
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let id = id_string(&raw.id)
                    .ok_or_else(|| ConnectorError::Malformed(format!("category {i} has no id")))?;
                match raw.title {
                    Some(title) if !title.trim().is_empty() => Ok(Category { id, title }),
                    _ => Err(ConnectorError::Malformed(format!("category `{id}` has no title"))),
                }
            })
            .collect()
    }
}

pub struct HttpDatasetSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDatasetSource {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    async fn items(&self, dataset_name: &str) -> Result<Vec<RawDatasetItem>, ConnectorError> {
        let url = format!(
            "{}/datasets/{}/items",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(dataset_name)
        );
        let resp = self.client.get(url).send().await?;
        let listing: Listing<RawDatasetItem> = read_json(resp).await?;
        Ok(listing.into_vec())
    }
}

/// Builds a new client per call from the loaded configuration.
#[derive(Clone)]
pub struct HttpConnectors {
    cfg: AppConfig,
}

impl HttpConnectors {
    pub fn new(cfg: AppConfig) -> Self {
        Self { cfg }
    }
}

impl Connectors for HttpConnectors {
    fn taxonomy(&self) -> Box<dyn TaxonomySource> {
        Box::new(HttpTaxonomySource::new(self.cfg.taxonomy_url.clone()))
    }

    fn dataset(&self) -> Box<dyn DatasetSource> {
        Box::new(HttpDatasetSource::new(self.cfg.dataset_url.clone()))
    }

    fn provider(&self) -> Box<dyn BatchProvider> {
        Box::new(OpenAiBatchProvider::new(
            self.cfg.provider_base_url.clone(),
            self.cfg.provider_api_key.clone(),
        ))
    }

    fn trace_sink(&self) -> Box<dyn TraceSink> {
        match &self.cfg.trace_url {
            Some(url) => Box::new(HttpTraceSink::new(url.clone(), self.cfg.trace_secret.clone())),
            None => Box::new(LogTraceSink::default()),
        }
    }
}
