use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{map_db_error, AppError};
use crate::schemas::{
    EntityDef, PermissionDef, RelationDef, RuleDef, StateMachineDef, WebhookDef, WorkflowDef,
};

/// Metadata rows live as jsonb `definition` columns; id-keyed tables get the
/// row id injected so in-memory definitions are addressable.
async fn load_keyed<T: DeserializeOwned>(pool: &PgPool, table: &str) -> Result<Vec<T>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT definition FROM {table} ORDER BY name"
    ))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let definition: Value = row.try_get("definition").map_err(map_db_error)?;
        match serde_json::from_value::<T>(definition) {
            Ok(item) => items.push(item),
            Err(error) => {
                tracing::warn!(table, error = %error, "Skipping malformed metadata definition");
            }
        }
    }
    Ok(items)
}

async fn load_serial<T: DeserializeOwned>(pool: &PgPool, table: &str) -> Result<Vec<T>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT id, definition FROM {table} ORDER BY id"
    ))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.try_get("id").map_err(map_db_error)?;
        let mut definition: Value = row.try_get("definition").map_err(map_db_error)?;
        if let Some(object) = definition.as_object_mut() {
            object.insert("id".to_string(), Value::from(id));
        }
        match serde_json::from_value::<T>(definition) {
            Ok(item) => items.push(item),
            Err(error) => {
                tracing::warn!(table, id, error = %error, "Skipping malformed metadata definition");
            }
        }
    }
    Ok(items)
}

pub async fn load_entities(pool: &PgPool) -> Result<Vec<EntityDef>, AppError> {
    load_keyed(pool, "_entities").await
}

pub async fn load_relations(pool: &PgPool) -> Result<Vec<RelationDef>, AppError> {
    load_keyed(pool, "_relations").await
}

pub async fn load_rules(pool: &PgPool) -> Result<Vec<RuleDef>, AppError> {
    load_serial(pool, "_rules").await
}

pub async fn load_state_machines(pool: &PgPool) -> Result<Vec<StateMachineDef>, AppError> {
    load_serial(pool, "_state_machines").await
}

pub async fn load_workflows(pool: &PgPool) -> Result<Vec<WorkflowDef>, AppError> {
    load_serial(pool, "_workflows").await
}

pub async fn load_permissions(pool: &PgPool) -> Result<Vec<PermissionDef>, AppError> {
    load_serial(pool, "_permissions").await
}

pub async fn load_webhooks(pool: &PgPool) -> Result<Vec<WebhookDef>, AppError> {
    load_serial(pool, "_webhooks").await
}
