//! Facts panel endpoints: pending candidates, conflict resolution, active
//! truth, version history, and the embedding reindex.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::TimeLayerError;
use crate::facts;
use crate::pending;
use crate::summary;
use crate::{db_call, AppState};

#[derive(Deserialize)]
pub(super) struct IdBody {
    id: i64,
}

#[derive(Deserialize)]
pub(super) struct IdsBody {
    #[serde(default)]
    ids: Vec<i64>,
}

#[derive(Deserialize)]
pub(super) struct AddPendingBody {
    fact: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
pub(super) struct ResolveBody {
    action: String,
    #[serde(default)]
    replacement: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub(super) struct ReindexBody {
    #[serde(default)]
    target: Option<String>,
}

pub(super) async fn facts_counts(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let (pending, conflicts) =
        db_call(&state.db, |m| (m.count_pending_facts(), m.count_fact_conflicts())).await?;
    Ok(Json(serde_json::json!({ "pending": pending, "conflicts": conflicts })))
}

pub(super) async fn pending_count(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let count = db_call(&state.db, |m| m.count_pending_facts()).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub(super) async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let items = db_call(&state.db, |m| m.list_pending_facts(60)).await??;
    Ok(Json(serde_json::json!({ "count": items.len(), "items": items })))
}

pub(super) async fn add_pending(
    State(state): State<AppState>,
    Json(body): Json<AddPendingBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let fact = body.fact.trim().to_string();
    if fact.is_empty() {
        return Err(TimeLayerError::Validation("fact must not be empty".into()));
    }
    pending::add_pending_manual(&state.db, &fact, body.confidence.unwrap_or(0.0)).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn pending_groups(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let groups =
        pending::list_pending_groups(&state.db, &state.ai, &state.cfg, 60).await?;
    Ok(Json(serde_json::json!({ "ok": true, "groups": groups })))
}

pub(super) async fn remember_pending_by_path(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    remember_one(&state, id).await
}

pub(super) async fn remember_pending_by_body(
    State(state): State<AppState>,
    Json(body): Json<IdBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    remember_one(&state, body.id).await
}

async fn remember_one(state: &AppState, id: i64) -> Result<Json<serde_json::Value>, TimeLayerError> {
    if id <= 0 {
        return Err(TimeLayerError::Validation("invalid id".into()));
    }
    let outcome = facts::remember_pending(&state.db, &state.ai, &state.cfg, id).await?;
    Ok(Json(serde_json::json!({ "ok": true, "outcome": outcome })))
}

pub(super) async fn reject_pending_by_path(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    reject_one(&state, id).await
}

pub(super) async fn reject_pending_by_body(
    State(state): State<AppState>,
    Json(body): Json<IdBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    reject_one(&state, body.id).await
}

async fn reject_one(state: &AppState, id: i64) -> Result<Json<serde_json::Value>, TimeLayerError> {
    if id <= 0 {
        return Err(TimeLayerError::Validation("invalid id".into()));
    }
    facts::reject_pending(&state.db, id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn remember_batch(
    State(state): State<AppState>,
    Json(body): Json<IdsBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let outcomes = facts::remember_pending_batch(&state.db, &state.ai, &state.cfg, &body.ids).await;
    let map: serde_json::Map<String, serde_json::Value> = outcomes
        .into_iter()
        .map(|(id, o)| (id.to_string(), serde_json::to_value(o).unwrap_or(serde_json::Value::Null)))
        .collect();
    Ok(Json(serde_json::json!({ "ok": true, "outcomes": map })))
}

pub(super) async fn reject_batch(
    State(state): State<AppState>,
    Json(body): Json<IdsBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    facts::reject_pending_batch(&state.db, &body.ids).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn list_conflicts(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let items = db_call(&state.db, |m| m.list_fact_conflicts(60)).await??;
    Ok(Json(serde_json::json!({ "ok": true, "count": items.len(), "items": items })))
}

pub(super) async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    if id <= 0 {
        return Err(TimeLayerError::Validation("invalid id".into()));
    }
    match body.action.trim().to_lowercase().as_str() {
        "keep" => facts::resolve_conflict_keep(&state.db, id).await?,
        "replace" => {
            facts::resolve_conflict_replace(&state.db, &state.ai, &state.cfg, id, body.replacement)
                .await?
        }
        _ => {
            return Err(TimeLayerError::Validation(
                "invalid action: expected keep|replace".into(),
            ))
        }
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn list_active(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let items = db_call(&state.db, |m| m.list_active_facts(200)).await??;
    Ok(Json(serde_json::json!({ "ok": true, "items": items })))
}

pub(super) async fn fact_history(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let limit = q.limit.unwrap_or(200).clamp(1, 500);
    let items = db_call(&state.db, move |m| m.list_fact_history(limit)).await??;
    Ok(Json(serde_json::json!({ "ok": true, "items": items })))
}

pub(super) async fn reindex(
    State(state): State<AppState>,
    Json(body): Json<ReindexBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let target = body.target.unwrap_or_else(|| "daily".into());
    let report = summary::reindex(&state.db, &state.ai, &state.cfg, &target).await?;
    Ok(Json(serde_json::json!({ "ok": true, "report": report })))
}
