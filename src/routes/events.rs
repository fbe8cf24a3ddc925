use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::auth::require_user;
use crate::error::{map_db_error, AppError, AppResult};
use crate::state::PlatformState;

#[derive(Debug, Deserialize)]
struct BusinessEventInput {
    component: String,
    action: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/_events", post(record_event))
        .route("/{app}/_events", get(list_events))
        .route("/{app}/_events/trace/{trace_id}", get(get_trace))
        .route("/{app}/_events/stats", get(stats))
}

async fn record_event(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(input): Json<BusinessEventInput>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    if input.component.trim().is_empty() || input.action.trim().is_empty() {
        return Err(AppError::BadRequest(
            "component and action are required.".to_string(),
        ));
    }
    app.instrumentation
        .emit(input.component.trim(), input.action.trim(), input.metadata);
    Ok(Json(json!({ "data": { "accepted": true } })))
}

async fn list_events(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    let mut query =
        QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM _events t WHERE 1=1");
    for column in ["component", "action", "entity", "source", "status"] {
        if let Some(value) = params.get(column).filter(|value| !value.is_empty()) {
            query
                .push(" AND t.")
                .push(column)
                .push(" = ")
                .push_bind(value.clone());
        }
    }
    let limit = params
        .get("per_page")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(50)
        .clamp(1, 200);
    let page = params
        .get("page")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(1)
        .max(1);
    query
        .push(" ORDER BY t.created_at DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind((page - 1) * limit);

    let rows = query
        .build()
        .fetch_all(&app.pool)
        .await
        .map_err(map_db_error)?;
    let data: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect();
    Ok(Json(json!({
        "data": data,
        "meta": { "page": page, "per_page": limit },
    })))
}

async fn get_trace(
    State(state): State<PlatformState>,
    Path((app_name, trace_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;
    let trace_id = Uuid::parse_str(trace_id.trim())
        .map_err(|_| AppError::NotFound("Trace not found.".to_string()))?;

    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _events t
         WHERE trace_id = $1 ORDER BY created_at ASC LIMIT 500",
    )
    .bind(trace_id)
    .fetch_all(&app.pool)
    .await
    .map_err(map_db_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn stats(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    let rows = sqlx::query(
        "SELECT component, action, COUNT(*)::bigint AS count,
                AVG(duration_ms) AS avg_duration_ms,
                MAX(created_at) AS last_seen
         FROM _events
         GROUP BY component, action
         ORDER BY count DESC
         LIMIT 100",
    )
    .fetch_all(&app.pool)
    .await
    .map_err(map_db_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "component": row.try_get::<String, _>("component").unwrap_or_default(),
                "action": row.try_get::<String, _>("action").unwrap_or_default(),
                "count": row.try_get::<i64, _>("count").unwrap_or_default(),
                "avg_duration_ms": row.try_get::<Option<f64>, _>("avg_duration_ms").unwrap_or(None),
                "last_seen": row
                    .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>("last_seen")
                    .ok()
                    .flatten()
                    .map(|ts| ts.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}
