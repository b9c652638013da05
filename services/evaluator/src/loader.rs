//! Fan-in loader: taxonomy and dataset are fetched as two independent stages
//! running at the same time.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};
use replay::{AttemptError, RetryPolicy, StageError, StageExecutor};
use serde_json::Value;

use crate::connector::{Connectors, RawDatasetItem};
use crate::types::{id_string, Category, DatasetItem};

pub const STAGE_FETCH_TAXONOMY: &str = "fetch-taxonomy";
pub const STAGE_FETCH_DATASET: &str = "fetch-dataset";

pub async fn load_inputs(
    executor: &StageExecutor,
    connectors: &dyn Connectors,
    policy: &RetryPolicy,
    dataset_name: &str,
) -> Result<(Vec<Category>, Vec<DatasetItem>), StageError> {
    let taxonomy = executor.execute(STAGE_FETCH_TAXONOMY, policy, || fetch_taxonomy(connectors));
    let dataset = executor.execute(STAGE_FETCH_DATASET, policy, || {
        fetch_dataset(connectors, dataset_name)
    });
    tokio::try_join!(taxonomy, dataset)
}

async fn fetch_taxonomy(connectors: &dyn Connectors) -> Result<Vec<Category>, AttemptError> {
    let source = connectors.taxonomy();
    let categories = source
        .categories()
        .await
        .map_err(|e| e.into_attempt("fetching taxonomy"))?;
    if categories.is_empty() {
        return Err(AttemptError::fatal(anyhow!("taxonomy source returned no categories")));
    }
    Ok(categories)
}

async fn fetch_dataset(
    connectors: &dyn Connectors,
    dataset_name: &str,
) -> Result<Vec<DatasetItem>, AttemptError> {
    let source = connectors.dataset();
    let raw = source
        .items(dataset_name)
        .await
        .map_err(|e| e.into_attempt(format!("fetching dataset `{dataset_name}`")))?;

    normalize_items(raw).map_err(|e| {
        AttemptError::Fatal(e.context(format!("normalizing dataset `{dataset_name}`")))
    })
}

pub fn normalize_items(raw: Vec<RawDatasetItem>) -> Result<Vec<DatasetItem>> {
    if raw.is_empty() {
        bail!("dataset has no items");
    }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut items = Vec::with_capacity(raw.len());
    for r in raw {
        let item = normalize_item(r)?;
        if !seen.insert(item.id.clone()) {
            bail!("duplicate item id `{}`", item.id);
        }
        items.push(item);
    }
    Ok(items)
}

/// Collapses the loosely-typed source shape into a [`DatasetItem`].
///
/// `input` may be `"text"` or `{"text": "..."}`; `expected_output` may be
/// `"label"`, `{"category": "label"}` or absent.
pub fn normalize_item(raw: RawDatasetItem) -> Result<DatasetItem> {
    let id = id_string(&raw.id).ok_or_else(|| anyhow!("item has no usable id: {}", raw.id))?;

    let text = match &raw.input {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(s)) => s.clone(),
            _ => bail!("item `{id}`: input object has no `text` string"),
        },
        Value::Null => bail!("item `{id}`: missing input"),
        other => bail!("item `{id}`: unsupported input {other}"),
    };

    let expected_category = match &raw.expected_output {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => match map.get("category") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => bail!("item `{id}`: expected category must be a string, got {other}"),
        },
        other => bail!("item `{id}`: unsupported expected output {other}"),
    };

    Ok(DatasetItem {
        id,
        text,
        expected_category,
        metadata: raw.metadata,
    })
}
