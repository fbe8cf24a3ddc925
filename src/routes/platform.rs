use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::schemas::{validate_input, DbDriver};
use crate::state::PlatformState;

#[derive(Debug, Deserialize, Validate)]
struct CreateAppInput {
    #[validate(length(min = 1, max = 63))]
    name: String,
    #[validate(length(min = 1, max = 255))]
    display_name: String,
    #[serde(default = "default_driver")]
    db_driver: DbDriver,
}

fn default_driver() -> DbDriver {
    DbDriver::Postgres
}

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/_platform/apps", get(list_apps))
        .route("/_platform/apps", post(create_app))
        .route("/_platform/apps/{name}", delete(delete_app))
}

/// Platform surface is gated by a deploy-time key, not per-app JWTs.
fn require_platform_key(state: &PlatformState, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = &state.config.platform_api_key else {
        return Err(AppError::Unauthorized(
            "Platform API key is not configured.".to_string(),
        ));
    };
    let presented = headers
        .get("x-platform-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return Err(AppError::Unauthorized("Invalid platform key.".to_string()));
    }
    Ok(())
}

async fn list_apps(
    State(state): State<PlatformState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_platform_key(&state, &headers)?;
    let data: Vec<Value> = state
        .apps
        .list()
        .into_iter()
        .map(|(name, display_name)| json!({ "name": name, "display_name": display_name }))
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn create_app(
    State(state): State<PlatformState>,
    headers: HeaderMap,
    Json(input): Json<CreateAppInput>,
) -> AppResult<impl IntoResponse> {
    require_platform_key(&state, &headers)?;
    validate_input(&input)?;

    let (ctx, admin_password) = state
        .apps
        .create(&input.name, &input.display_name, input.db_driver)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": {
                "name": ctx.name,
                "display_name": ctx.display_name,
                "admin_email": format!("admin@{}.local", ctx.name),
                // returned exactly once; not retrievable later
                "admin_password": admin_password,
            },
        })),
    ))
}

async fn delete_app(
    State(state): State<PlatformState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    require_platform_key(&state, &headers)?;
    state.apps.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
