use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::schemas::validate_input;
use crate::state::PlatformState;

#[derive(Debug, Deserialize, Validate)]
struct LoginInput {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1))]
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshInput {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct AcceptInviteInput {
    token: String,
    password: String,
}

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/auth/login", post(login))
        .route("/{app}/auth/refresh", post(refresh))
        .route("/{app}/auth/logout", post(logout))
        .route("/{app}/auth/accept-invite", post(accept_invite))
}

async fn login(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Json(input): Json<LoginInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let app = state.apps.get(&app_name)?;
    let pair = auth::login(
        &app,
        &input.email,
        &input.password,
        state.config.access_token_ttl_minutes,
        state.config.refresh_token_ttl_days,
    )
    .await?;
    Ok(Json(pair.to_json()))
}

async fn refresh(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Json(input): Json<RefreshInput>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let token = parse_token(&input.refresh_token)?;
    let pair = auth::refresh(
        &app,
        token,
        state.config.access_token_ttl_minutes,
        state.config.refresh_token_ttl_days,
    )
    .await?;
    Ok(Json(pair.to_json()))
}

async fn logout(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Json(input): Json<RefreshInput>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let token = parse_token(&input.refresh_token)?;
    auth::logout(&app, token).await?;
    Ok(Json(json!({ "data": { "ok": true } })))
}

async fn accept_invite(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Json(input): Json<AcceptInviteInput>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let token = parse_token(&input.token)?;
    let user = auth::accept_invite(&app, token, &input.password).await?;
    Ok(Json(json!({ "data": user })))
}

fn parse_token(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest("Malformed token.".to_string()))
}
