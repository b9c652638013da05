//! Evaluator/recorder: scores the decoded results against ground truth and
//! ships one trace per item plus a run summary to the trace sink.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use replay::{AttemptError, RetryPolicy, StageError, StageExecutor};
use serde_json::json;
use tracing::{info, warn};

use crate::connector::{Connectors, TraceRecord};
use crate::poller::BatchOutput;
use crate::types::{accuracy, Category, ClassificationResult, DatasetItem, EvaluationRecord, RunSummary};

pub const STAGE_RECORD: &str = "record-evaluation";

/// A result joined with the item it was produced for.
#[derive(Debug)]
pub struct Scored<'a> {
    pub item: &'a DatasetItem,
    pub result: &'a ClassificationResult,
    /// Present only when the item carries ground truth.
    pub record: Option<EvaluationRecord>,
}

#[derive(Debug)]
pub struct Scorecard<'a> {
    pub scored: Vec<Scored<'a>>,
    pub records: Vec<EvaluationRecord>,
    pub correct_count: usize,
    pub total_count: usize,
}

/// Joins results to items by id. Results for unknown ids and repeated ids are
/// skipped; items without an expected category are traced but not counted.
pub fn score<'a>(items: &'a [DatasetItem], results: &'a [ClassificationResult]) -> Scorecard<'a> {
    let by_id: HashMap<&str, &DatasetItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut seen = HashSet::new();

    let mut card = Scorecard {
        scored: Vec::new(),
        records: Vec::new(),
        correct_count: 0,
        total_count: 0,
    };

    for result in results {
        let Some(item) = by_id.get(result.id.as_str()).copied() else {
            warn!(id=%result.id, "recorder: result for unknown item dropped");
            continue;
        };
        if !seen.insert(result.id.as_str()) {
            warn!(id=%result.id, "recorder: duplicate result dropped");
            continue;
        }

        let record = item.expected_category.as_ref().map(|expected| EvaluationRecord {
            id: item.id.clone(),
            expected: expected.clone(),
            predicted: result.category.clone(),
            correct: *expected == result.category,
            confidence: result.confidence,
        });
        if let Some(r) = &record {
            card.total_count += 1;
            if r.correct {
                card.correct_count += 1;
            }
            card.records.push(r.clone());
        }
        card.scored.push(Scored { item, result, record });
    }

    card
}

pub struct RecordContext<'a> {
    pub run_id: &'a str,
    pub dataset_name: &'a str,
    pub model: &'a str,
    pub categories: &'a [Category],
    pub items: &'a [DatasetItem],
    pub output: &'a BatchOutput,
}

pub fn item_trace(ctx: &RecordContext<'_>, titles: &[String], s: &Scored<'_>) -> TraceRecord {
    let now = Utc::now();
    let item_id = &s.item.id;
    let items_ns = TraceRecord::stable_id(ctx.run_id, "items");
    let parent_id = TraceRecord::child_id(&items_ns, item_id);
    let generation = TraceRecord {
        id: TraceRecord::child_id(&parent_id, "generation"),
        name: "generation".to_string(),
        timestamp: now,
        input: json!({ "text": s.item.text }),
        output: json!({
            "category": s.result.category,
            "confidence": s.result.confidence,
            "reasoning": s.result.reasoning,
        }),
        metadata: json!({ "model": ctx.model, "usage": s.result.usage }),
        children: vec![],
    };

    TraceRecord {
        id: parent_id,
        name: "classification".to_string(),
        timestamp: now,
        input: json!({ "item_id": item_id, "text": s.item.text }),
        output: json!({
            "expected": s.item.expected_category,
            "predicted": s.result.category,
            "correct": s.record.as_ref().map(|r| r.correct),
            "confidence": s.result.confidence,
            "reasoning": s.result.reasoning,
        }),
        metadata: json!({
            "run_id": ctx.run_id,
            "dataset_name": ctx.dataset_name,
            "job_id": ctx.output.job_id,
            "categories": titles,
            "item_metadata": s.item.metadata,
        }),
        children: vec![generation],
    }
}

pub fn summary_trace(ctx: &RecordContext<'_>, titles: &[String], summary: &RunSummary) -> TraceRecord {
    TraceRecord {
        id: TraceRecord::stable_id(ctx.run_id, "summary"),
        name: "evaluation-summary".to_string(),
        timestamp: Utc::now(),
        input: json!({ "dataset_name": ctx.dataset_name, "items": ctx.items.len() }),
        output: json!({
            "accuracy": summary.accuracy,
            "correct_count": summary.correct_count,
            "total_count": summary.total_count,
            "items_processed": summary.items_processed,
            "records": summary.records,
        }),
        metadata: json!({
            "run_id": ctx.run_id,
            "job_id": summary.job_id,
            "model": ctx.model,
            "categories": titles,
            "usage": summary.usage,
        }),
        children: vec![],
    }
}

pub async fn record_evaluation(
    executor: &StageExecutor,
    connectors: &dyn Connectors,
    policy: &RetryPolicy,
    ctx: &RecordContext<'_>,
) -> Result<RunSummary, StageError> {
    executor
        .execute(STAGE_RECORD, policy, || record_once(connectors, ctx))
        .await
}

async fn record_once(
    connectors: &dyn Connectors,
    ctx: &RecordContext<'_>,
) -> Result<RunSummary, AttemptError> {
    let card = score(ctx.items, &ctx.output.results);
    let summary = RunSummary {
        accuracy: accuracy(card.correct_count, card.total_count),
        correct_count: card.correct_count,
        total_count: card.total_count,
        items_processed: card.scored.len(),
        job_id: ctx.output.job_id.clone(),
        usage: ctx.output.usage.clone(),
        records: card.records.clone(),
    };
    let titles: Vec<String> = ctx.categories.iter().map(|c| c.title.clone()).collect();

    // New sink per attempt; nothing buffered by a failed attempt survives.
    let sink = connectors.trace_sink();
    for s in &card.scored {
        sink.submit(item_trace(ctx, &titles, s))
            .await
            .map_err(|e| e.into_attempt(format!("submitting trace for item {}", s.item.id)))?;
    }
    sink.submit(summary_trace(ctx, &titles, &summary))
        .await
        .map_err(|e| e.into_attempt("submitting summary trace"))?;
    sink.flush()
        .await
        .map_err(|e| e.into_attempt("flushing traces"))?;

    info!(
        run_id = ctx.run_id,
        correct = summary.correct_count,
        total = summary.total_count,
        "recorder: evaluation recorded"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, expected: Option<&str>) -> DatasetItem {
        DatasetItem {
            id: id.to_string(),
            text: format!("text of {id}"),
            expected_category: expected.map(str::to_string),
            metadata: serde_json::Value::Null,
        }
    }

    fn result(id: &str, category: &str) -> ClassificationResult {
        ClassificationResult {
            id: id.to_string(),
            category: category.to_string(),
            confidence: Some(0.8),
            reasoning: None,
            usage: None,
        }
    }

    #[test]
    fn exact_match_scores_one() {
        let items = vec![item("a", Some("true"))];
        let results = vec![result("a", "true")];
        let card = score(&items, &results);
        assert_eq!((card.correct_count, card.total_count), (1, 1));
        assert_eq!(accuracy(card.correct_count, card.total_count), Some(1.0));

        let results = vec![result("a", "false")];
        let card = score(&items, &results);
        assert_eq!((card.correct_count, card.total_count), (0, 1));
        assert_eq!(accuracy(card.correct_count, card.total_count), Some(0.0));
    }

    #[test]
    fn comparison_is_case_and_whitespace_sensitive() {
        let items = vec![item("a", Some("True")), item("b", Some("true"))];
        let results = vec![result("a", "true"), result("b", "true ")];
        let card = score(&items, &results);
        assert_eq!(card.correct_count, 0);
        assert_eq!(card.total_count, 2);
    }

    #[test]
    fn unknown_and_repeated_results_are_not_counted() {
        let items = vec![item("a", Some("x"))];
        let results = vec![result("zzz", "x"), result("a", "x"), result("a", "y")];
        let card = score(&items, &results);
        assert_eq!(card.scored.len(), 1);
        assert_eq!(card.records.len(), 1);
        assert!(card.records[0].correct);
        assert_eq!(card.total_count, 1);
    }

    #[test]
    fn items_without_ground_truth_are_traced_but_not_scored() {
        let items = vec![item("a", None), item("b", Some("x"))];
        let results = vec![result("a", "x"), result("b", "y")];
        let card = score(&items, &results);
        assert_eq!(card.scored.len(), 2);
        assert!(card.scored[0].record.is_none());
        assert_eq!(card.total_count, 1);
        assert_eq!(card.correct_count, 0);
        assert!(card.correct_count <= card.total_count);
    }

    #[test]
    fn trace_ids_are_stable_across_attempts() {
        let items = vec![item("a", Some("x"))];
        let results = vec![result("a", "x")];
        let output = BatchOutput {
            job_id: "batch_1".into(),
            results: results.clone(),
            usage: Default::default(),
        };
        let categories = vec![Category { id: "1".into(), title: "x".into() }];
        let ctx = RecordContext {
            run_id: "run-1",
            dataset_name: "ds",
            model: "m",
            categories: &categories,
            items: &items,
            output: &output,
        };
        let card = score(&items, &results);
        let titles = vec!["x".to_string()];
        let first = item_trace(&ctx, &titles, &card.scored[0]);
        let second = item_trace(&ctx, &titles, &card.scored[0]);
        assert_eq!(first.id, second.id);
        assert_eq!(first.children.len(), 1);
        assert_eq!(first.children[0].name, "generation");
        assert_eq!(first.metadata["job_id"], "batch_1");
        assert_eq!(first.metadata["categories"][0], "x");
    }

    #[test]
    fn item_ids_cannot_collide_with_other_records() {
        let items = vec![
            item("a", Some("x")),
            item("a/generation", Some("x")),
            item("summary", Some("x")),
        ];
        let results = vec![result("a", "x"), result("a/generation", "x"), result("summary", "x")];
        let output = BatchOutput {
            job_id: "batch_1".into(),
            results: results.clone(),
            usage: Default::default(),
        };
        let ctx = RecordContext {
            run_id: "run-1",
            dataset_name: "ds",
            model: "m",
            categories: &[],
            items: &items,
            output: &output,
        };
        let card = score(&items, &results);
        let titles: Vec<String> = vec![];
        let summary = RunSummary {
            accuracy: Some(1.0),
            correct_count: 3,
            total_count: 3,
            items_processed: 3,
            job_id: "batch_1".into(),
            usage: Default::default(),
            records: vec![],
        };

        let mut ids = HashSet::new();
        for s in &card.scored {
            let t = item_trace(&ctx, &titles, s);
            assert!(ids.insert(t.id), "duplicate id for item {}", s.item.id);
            assert!(ids.insert(t.children[0].id), "duplicate child id for item {}", s.item.id);
        }
        assert!(ids.insert(summary_trace(&ctx, &titles, &summary).id));
        assert_eq!(ids.len(), 7);
    }
}
