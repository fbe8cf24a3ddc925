use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::auth::require_user;
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::workflows;
use crate::state::PlatformState;

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/_workflows/pending", get(list_pending))
        .route("/{app}/_workflows/{id}", get(get_instance))
        .route("/{app}/_workflows/{id}/approve", post(approve))
        .route("/{app}/_workflows/{id}/reject", post(reject))
}

async fn list_pending(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _workflow_instances t
         WHERE status = 'waiting_approval'
         ORDER BY created_at DESC
         LIMIT 100",
    )
    .fetch_all(&app.pool)
    .await
    .map_err(map_db_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn get_instance(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;
    let instance_id = parse_id(&id)?;

    let row = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _workflow_instances t WHERE id = $1 LIMIT 1",
    )
    .bind(instance_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .and_then(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
    .ok_or_else(|| AppError::NotFound("Workflow instance not found.".to_string()))?;

    Ok(Json(json!({ "data": row })))
}

async fn approve(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let instance_id = parse_id(&id)?;
    let result = workflows::review(&app, instance_id, true, &user).await?;
    Ok(Json(json!({ "data": result })))
}

async fn reject(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let instance_id = parse_id(&id)?;
    let result = workflows::review(&app, instance_id, false, &user).await?;
    Ok(Json(json!({ "data": result })))
}

fn parse_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::NotFound("Workflow instance not found.".to_string()))
}
