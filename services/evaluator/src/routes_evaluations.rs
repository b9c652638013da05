use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::validate_dataset_name;
use crate::registry::RegistryError;
use crate::runner::submit_run;
use crate::state::SharedState;
use crate::types_runs::{RunPhase, RunRecord};

const MAX_RUN_ID_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct CreateEvaluationRequest {
    pub dataset_name: String,
    /// Re-using a run id resumes that run.
    pub run_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EvaluationAccepted {
    pub run_id: String,
    pub phase: RunPhase,
    pub started: bool,
}

fn valid_run_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RUN_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub async fn post_evaluation(
    State(state): State<SharedState>,
    Json(req): Json<CreateEvaluationRequest>,
) -> Result<(StatusCode, Json<EvaluationAccepted>), (StatusCode, String)> {
    validate_dataset_name(&req.dataset_name).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let run_id = req.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if !valid_run_id(&run_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            "run_id must be 1-128 characters of [A-Za-z0-9._-]".to_string(),
        ));
    }

    let (record, started) = submit_run(&state, &run_id, &req.dataset_name)
        .await
        .map_err(|e| match e {
            RegistryError::Conflict { .. } => (StatusCode::CONFLICT, e.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;

    let status = if record.phase.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(EvaluationAccepted {
            run_id: record.run_id,
            phase: record.phase,
            started,
        }),
    ))
}

pub async fn get_evaluation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, (StatusCode, String)> {
    match state.registry.get(&id).await {
        Ok(Some(rec)) => Ok(Json(rec)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Run not found".to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
