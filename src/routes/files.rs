use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::require_user;
use crate::error::{AppError, AppResult};
use crate::services::files;
use crate::state::PlatformState;

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    per_page: Option<i64>,
}

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/_files/upload", post(upload))
        .route("/{app}/_files", get(list))
        .route("/{app}/_files/{id}", get(download))
        .route("/{app}/_files/{id}", delete(remove))
}

async fn upload(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::BadRequest(format!("Malformed multipart body: {error}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "upload.bin".to_string());
        let mime_type = field
            .content_type()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let content = field
            .bytes()
            .await
            .map_err(|error| AppError::BadRequest(format!("Upload failed: {error}")))?
            .to_vec();
        if content.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty.".to_string()));
        }

        let descriptor = files::save_file(&app.pool, &filename, &mime_type, content).await?;
        return Ok((StatusCode::CREATED, Json(json!({ "data": descriptor }))));
    }

    Err(AppError::BadRequest(
        "Multipart body needs a 'file' field.".to_string(),
    ))
}

async fn list(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;

    let per_page = params.per_page.unwrap_or(50).clamp(1, 200);
    let page = params.page.unwrap_or(1).max(1);
    let data = files::list_files(&app.pool, per_page, (page - 1) * per_page).await?;
    Ok(Json(json!({
        "data": data,
        "meta": { "page": page, "per_page": per_page },
    })))
}

async fn download(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;
    let id = parse_id(&id)?;

    let (filename, mime_type, content) = files::get_file(&app.pool, id).await?;
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        content,
    ))
}

async fn remove(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let app = state.apps.get(&app_name)?;
    let _user = require_user(&app, &headers)?;
    let id = parse_id(&id)?;

    files::delete_file(&app.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::NotFound("File not found.".to_string()))
}
