use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{map_db_error, AppError, AppResult};

pub async fn save_file(
    pool: &PgPool,
    filename: &str,
    mime_type: &str,
    content: Vec<u8>,
) -> AppResult<Value> {
    let size = content.len() as i64;
    let row = sqlx::query(
        "INSERT INTO _files (filename, mime_type, size, content)
         VALUES ($1, $2, $3, $4)
         RETURNING json_build_object(
             'id', id::text, 'filename', filename, 'mime_type', mime_type,
             'size', size, 'created_at', created_at
         ) AS row",
    )
    .bind(filename)
    .bind(mime_type)
    .bind(size)
    .bind(content)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    row.try_get::<Option<Value>, _>("row")
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::Internal("Could not store file.".to_string()))
}

pub async fn list_files(pool: &PgPool, limit: i64, offset: i64) -> AppResult<Vec<Value>> {
    let rows = sqlx::query(
        "SELECT json_build_object(
             'id', id::text, 'filename', filename, 'mime_type', mime_type,
             'size', size, 'created_at', created_at
         ) AS row
         FROM _files ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit.clamp(1, 200))
    .bind(offset.max(0))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect())
}

pub async fn get_file(pool: &PgPool, id: Uuid) -> AppResult<(String, String, Vec<u8>)> {
    let row = sqlx::query("SELECT filename, mime_type, content FROM _files WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("File not found.".to_string()))?;

    Ok((
        row.try_get("filename").map_err(map_db_error)?,
        row.try_get("mime_type").map_err(map_db_error)?,
        row.try_get("content").map_err(map_db_error)?,
    ))
}

pub async fn delete_file(pool: &PgPool, id: Uuid) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM _files WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("File not found.".to_string()));
    }
    Ok(())
}
