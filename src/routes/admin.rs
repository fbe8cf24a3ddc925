use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::auth::require_admin;
use crate::error::{map_db_error, AppError, AppResult};
use crate::repository::bootstrap::{entity_table_ddl, join_table_ddl};
use crate::schemas::{
    EntityDef, PermissionDef, RelationDef, RuleDef, StateMachineDef, StepKind, TransitionSlot,
    WebhookDef, WorkflowDef,
};
use crate::state::PlatformState;
use crate::tenancy::AppContext;

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/_admin/export", get(export_metadata))
        .route("/{app}/_admin/import", post(import_metadata))
        .route("/{app}/_admin/webhook-logs", get(list_webhook_logs))
        .route("/{app}/_admin/webhook-logs/{id}/retry", post(retry_webhook_log))
        .route("/{app}/_admin/users", get(list_users))
        .route("/{app}/_admin/users", post(create_user))
        .route("/{app}/_admin/users/{id}", put(update_user))
        .route("/{app}/_admin/users/{id}", delete(delete_user))
        .route("/{app}/_admin/invites", get(list_invites))
        .route("/{app}/_admin/invites", post(create_invite))
        .route("/{app}/_admin/{collection}", get(list_collection))
        .route("/{app}/_admin/{collection}", post(create_definition))
        .route("/{app}/_admin/{collection}/{id}", get(get_definition))
        .route("/{app}/_admin/{collection}/{id}", put(update_definition))
        .route("/{app}/_admin/{collection}/{id}", delete(delete_definition))
}

/// Metadata collections and how they persist: keyed tables address rows by
/// name, serial tables by bigserial id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Entities,
    Relations,
    Rules,
    StateMachines,
    Workflows,
    Permissions,
    Webhooks,
    UiConfigs,
}

impl Collection {
    fn parse(raw: &str) -> AppResult<Self> {
        Ok(match raw {
            "entities" => Collection::Entities,
            "relations" => Collection::Relations,
            "rules" => Collection::Rules,
            "state-machines" => Collection::StateMachines,
            "workflows" => Collection::Workflows,
            "permissions" => Collection::Permissions,
            "webhooks" => Collection::Webhooks,
            "ui-configs" => Collection::UiConfigs,
            other => {
                return Err(AppError::NotFound(format!(
                    "Unknown admin collection '{other}'."
                )))
            }
        })
    }

    fn table(&self) -> &'static str {
        match self {
            Collection::Entities => "_entities",
            Collection::Relations => "_relations",
            Collection::Rules => "_rules",
            Collection::StateMachines => "_state_machines",
            Collection::Workflows => "_workflows",
            Collection::Permissions => "_permissions",
            Collection::Webhooks => "_webhooks",
            Collection::UiConfigs => "_ui_configs",
        }
    }

    fn keyed_by_name(&self) -> bool {
        matches!(
            self,
            Collection::Entities | Collection::Relations | Collection::UiConfigs
        )
    }
}

/// Deserialize into the collection's schema type so malformed definitions
/// are rejected before they reach the registry.
fn validate_definition(
    app: &AppContext,
    collection: Collection,
    definition: &Value,
) -> AppResult<()> {
    let snapshot = app.registry.snapshot();
    match collection {
        Collection::Entities => {
            let entity: EntityDef = parse_definition(definition)?;
            entity.validate_shape()?;
            // A table collision would poison every later registry reload.
            if let Some(owner) = snapshot.table_owner(&entity.table) {
                if owner != entity.name {
                    return Err(AppError::Conflict(format!(
                        "Table '{}' already belongs to entity '{owner}'.",
                        entity.table
                    )));
                }
            }
        }
        Collection::Relations => {
            let relation: RelationDef = parse_definition(definition)?;
            relation.validate_shape()?;
            snapshot.entity(&relation.source)?;
            snapshot.entity(&relation.target)?;
        }
        Collection::Rules => {
            let rule: RuleDef = parse_definition(definition)?;
            snapshot.entity(&rule.entity)?;
        }
        Collection::StateMachines => {
            let machine: StateMachineDef = parse_definition(definition)?;
            let entity = snapshot.entity(&machine.entity)?;
            if entity.field(&machine.field).is_none() {
                return Err(AppError::BadRequest(format!(
                    "Entity '{}' has no field '{}'.",
                    machine.entity, machine.field
                )));
            }
        }
        Collection::Workflows => {
            let workflow: WorkflowDef = parse_definition(definition)?;
            snapshot.entity(&workflow.trigger.entity)?;
            validate_workflow_graph(&workflow)?;
        }
        Collection::Permissions => {
            let permission: PermissionDef = parse_definition(definition)?;
            snapshot.entity(&permission.entity)?;
        }
        Collection::Webhooks => {
            let webhook: WebhookDef = parse_definition(definition)?;
            snapshot.entity(&webhook.entity)?;
            url::Url::parse(&webhook.url)
                .map_err(|_| AppError::BadRequest(format!("Invalid URL '{}'.", webhook.url)))?;
        }
        Collection::UiConfigs => {
            if definition.get("name").and_then(Value::as_str).is_none() {
                return Err(AppError::BadRequest(
                    "ui-config needs a 'name'.".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn parse_definition<T: serde::de::DeserializeOwned>(definition: &Value) -> AppResult<T> {
    serde_json::from_value(definition.clone())
        .map_err(|error| AppError::BadRequest(format!("Malformed definition: {error}")))
}

/// Every step id unique, every slot target resolvable.
fn validate_workflow_graph(workflow: &WorkflowDef) -> AppResult<()> {
    if workflow.steps.is_empty() {
        return Err(AppError::BadRequest(
            "Workflow needs at least one step.".to_string(),
        ));
    }
    let ids: Vec<&str> = workflow.steps.iter().map(|step| step.id.as_str()).collect();
    let unique: std::collections::HashSet<&&str> = ids.iter().collect();
    if unique.len() != ids.len() {
        return Err(AppError::BadRequest(
            "Workflow step ids must be unique.".to_string(),
        ));
    }

    let check_slot = |slot: &Option<TransitionSlot>| -> AppResult<()> {
        if let Some(slot) = slot {
            let target = slot.goto();
            if target != "end" && !ids.contains(&target) {
                return Err(AppError::BadRequest(format!(
                    "Workflow references unknown step '{target}'."
                )));
            }
        }
        Ok(())
    };

    for step in &workflow.steps {
        match &step.kind {
            StepKind::Action { then, .. } => check_slot(then)?,
            StepKind::Condition {
                on_true, on_false, ..
            } => {
                check_slot(on_true)?;
                check_slot(on_false)?;
            }
            StepKind::Approval {
                on_approve,
                on_reject,
                on_timeout,
                ..
            } => {
                check_slot(on_approve)?;
                check_slot(on_reject)?;
                check_slot(on_timeout)?;
            }
        }
    }
    Ok(())
}

fn definition_name(collection: Collection, definition: &Value) -> AppResult<String> {
    definition
        .get("name")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "A {} definition needs a 'name'.",
                collection.table()
            ))
        })
}

// ---------------------------------------------------------------------------
// Generic collection handlers
// ---------------------------------------------------------------------------

async fn list_collection(
    State(state): State<PlatformState>,
    Path((app_name, collection)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let collection = Collection::parse(&collection)?;

    let rows = if collection.keyed_by_name() {
        sqlx::query(&format!(
            "SELECT json_build_object('name', name, 'definition', definition) AS row
             FROM {} ORDER BY name",
            collection.table()
        ))
        .fetch_all(&app.pool)
        .await
    } else {
        sqlx::query(&format!(
            "SELECT json_build_object('id', id, 'definition', definition) AS row
             FROM {} ORDER BY id",
            collection.table()
        ))
        .fetch_all(&app.pool)
        .await
    }
    .map_err(map_db_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn get_definition(
    State(state): State<PlatformState>,
    Path((app_name, collection, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let collection = Collection::parse(&collection)?;

    let row = if collection.keyed_by_name() {
        sqlx::query(&format!(
            "SELECT definition FROM {} WHERE name = $1",
            collection.table()
        ))
        .bind(&id)
        .fetch_optional(&app.pool)
        .await
    } else {
        let id = parse_serial_id(&id)?;
        sqlx::query(&format!(
            "SELECT definition FROM {} WHERE id = $1",
            collection.table()
        ))
        .bind(id)
        .fetch_optional(&app.pool)
        .await
    }
    .map_err(map_db_error)?;

    let definition = row
        .and_then(|row| row.try_get::<Option<Value>, _>("definition").ok().flatten())
        .ok_or_else(|| AppError::NotFound("Definition not found.".to_string()))?;
    Ok(Json(json!({ "data": definition })))
}

async fn create_definition(
    State(state): State<PlatformState>,
    Path((app_name, collection)): Path<(String, String)>,
    headers: HeaderMap,
    Json(definition): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let collection = Collection::parse(&collection)?;
    validate_definition(&app, collection, &definition)?;

    let stored = if collection.keyed_by_name() {
        let name = definition_name(collection, &definition)?;

        // Entity creation also provisions the physical table.
        if collection == Collection::Entities {
            let entity: EntityDef = parse_definition(&definition)?;
            let ddl = entity_table_ddl(&entity)?;
            sqlx::query(&ddl)
                .execute(&app.pool)
                .await
                .map_err(map_db_error)?;
        }
        if collection == Collection::Relations {
            let relation: RelationDef = parse_definition(&definition)?;
            if relation.is_many_to_many() {
                let ddl = join_table_ddl(&relation)?;
                sqlx::query(&ddl)
                    .execute(&app.pool)
                    .await
                    .map_err(map_db_error)?;
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} (name, definition) VALUES ($1, $2)",
            collection.table()
        ))
        .bind(&name)
        .bind(&definition)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
        json!({ "name": name, "definition": definition })
    } else {
        let row = sqlx::query(&format!(
            "INSERT INTO {} (definition) VALUES ($1) RETURNING id",
            collection.table()
        ))
        .bind(&definition)
        .fetch_one(&app.pool)
        .await
        .map_err(map_db_error)?;
        let id: i64 = row.try_get("id").map_err(map_db_error)?;
        json!({ "id": id, "definition": definition })
    };

    app.registry.reload(&app.pool).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": stored }))))
}

async fn update_definition(
    State(state): State<PlatformState>,
    Path((app_name, collection, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(definition): Json<Value>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let collection = Collection::parse(&collection)?;
    validate_definition(&app, collection, &definition)?;

    let affected = if collection.keyed_by_name() {
        sqlx::query(&format!(
            "UPDATE {} SET definition = $2, updated_at = now() WHERE name = $1",
            collection.table()
        ))
        .bind(&id)
        .bind(&definition)
        .execute(&app.pool)
        .await
    } else {
        let serial = parse_serial_id(&id)?;
        sqlx::query(&format!(
            "UPDATE {} SET definition = $2, updated_at = now() WHERE id = $1",
            collection.table()
        ))
        .bind(serial)
        .bind(&definition)
        .execute(&app.pool)
        .await
    }
    .map_err(map_db_error)?
    .rows_affected();

    if affected == 0 {
        return Err(AppError::NotFound("Definition not found.".to_string()));
    }
    app.registry.reload(&app.pool).await?;
    Ok(Json(json!({ "data": definition })))
}

async fn delete_definition(
    State(state): State<PlatformState>,
    Path((app_name, collection, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let collection = Collection::parse(&collection)?;

    let affected = if collection.keyed_by_name() {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE name = $1",
            collection.table()
        ))
        .bind(&id)
        .execute(&app.pool)
        .await
    } else {
        let serial = parse_serial_id(&id)?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", collection.table()))
            .bind(serial)
            .execute(&app.pool)
            .await
    }
    .map_err(map_db_error)?
    .rows_affected();

    if affected == 0 {
        return Err(AppError::NotFound("Definition not found.".to_string()));
    }
    app.registry.reload(&app.pool).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_serial_id(raw: &str) -> AppResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| AppError::NotFound("Definition not found.".to_string()))
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

const EXPORT_SECTIONS: &[(&str, Collection)] = &[
    ("entities", Collection::Entities),
    ("relations", Collection::Relations),
    ("rules", Collection::Rules),
    ("state_machines", Collection::StateMachines),
    ("workflows", Collection::Workflows),
    ("permissions", Collection::Permissions),
    ("webhooks", Collection::Webhooks),
    ("ui_configs", Collection::UiConfigs),
];

async fn export_metadata(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let mut document = Map::new();
    for (section, collection) in EXPORT_SECTIONS {
        let rows = sqlx::query(&format!(
            "SELECT definition FROM {} ORDER BY {}",
            collection.table(),
            if collection.keyed_by_name() { "name" } else { "id" }
        ))
        .fetch_all(&app.pool)
        .await
        .map_err(map_db_error)?;
        let definitions: Vec<Value> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<Option<Value>, _>("definition").ok().flatten())
            .collect();
        document.insert(section.to_string(), Value::Array(definitions));
    }
    Ok(Json(json!({ "data": document })))
}

/// Import upserts keyed definitions by name and appends serial ones, then
/// reloads the registry once.
async fn import_metadata(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(document): Json<Value>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let mut imported = Map::new();
    for (section, collection) in EXPORT_SECTIONS {
        let Some(definitions) = document.get(*section).and_then(Value::as_array) else {
            continue;
        };
        let mut count = 0u64;
        for definition in definitions {
            validate_definition(&app, *collection, definition)?;

            // Imported entities and M2M relations need their physical
            // tables just like create_definition; the DDL is IF NOT EXISTS
            // so re-importing an already-provisioned app is a no-op here.
            if *collection == Collection::Entities {
                let entity: EntityDef = parse_definition(definition)?;
                let ddl = entity_table_ddl(&entity)?;
                sqlx::query(&ddl)
                    .execute(&app.pool)
                    .await
                    .map_err(map_db_error)?;
            }
            if *collection == Collection::Relations {
                let relation: RelationDef = parse_definition(definition)?;
                if relation.is_many_to_many() {
                    let ddl = join_table_ddl(&relation)?;
                    sqlx::query(&ddl)
                        .execute(&app.pool)
                        .await
                        .map_err(map_db_error)?;
                }
            }

            if collection.keyed_by_name() {
                let name = definition_name(*collection, definition)?;
                sqlx::query(&format!(
                    "INSERT INTO {} (name, definition) VALUES ($1, $2)
                     ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = now()",
                    collection.table()
                ))
                .bind(&name)
                .bind(definition)
                .execute(&app.pool)
                .await
                .map_err(map_db_error)?;
            } else {
                sqlx::query(&format!(
                    "INSERT INTO {} (definition) VALUES ($1)",
                    collection.table()
                ))
                .bind(definition)
                .execute(&app.pool)
                .await
                .map_err(map_db_error)?;
            }
            count += 1;
        }
        imported.insert(section.to_string(), json!(count));
    }

    app.registry.reload(&app.pool).await?;
    Ok(Json(json!({ "data": imported })))
}

// ---------------------------------------------------------------------------
// Webhook logs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WebhookLogParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    per_page: Option<i64>,
}

async fn list_webhook_logs(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    Query(params): Query<WebhookLogParams>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let per_page = params.per_page.unwrap_or(50).clamp(1, 200);
    let page = params.page.unwrap_or(1).max(1);

    let mut query = sqlx::QueryBuilder::<sqlx::Postgres>::new(
        "SELECT row_to_json(t) AS row FROM _webhook_logs t WHERE 1=1",
    );
    if let Some(status) = params.status.as_deref().filter(|status| !status.is_empty()) {
        query.push(" AND t.status = ").push_bind(status.to_string());
    }
    query
        .push(" ORDER BY t.created_at DESC LIMIT ")
        .push_bind(per_page)
        .push(" OFFSET ")
        .push_bind((page - 1) * per_page);

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
        "meta": { "page": page, "per_page": per_page },
    })))
}

async fn retry_webhook_log(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let log_id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::NotFound("Webhook log not found.".to_string()))?;

    crate::services::webhooks::manual_retry(&app.pool, log_id).await?;

    // Dispatch immediately rather than waiting for the next scheduler tick.
    let pool = app.pool.clone();
    let client = app.http.clone();
    let backoff = app.backoff_base_seconds;
    let timeout = app.webhook_timeout;
    tokio::spawn(async move {
        crate::services::webhooks::retry_due(&pool, &client, backoff, timeout, 10).await;
    });

    Ok(Json(json!({ "data": { "queued": true } })))
}

// ---------------------------------------------------------------------------
// Users and invites
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateUserInput {
    email: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateUserInput {
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateInviteInput {
    email: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default = "default_invite_days")]
    expires_in_days: i64,
}

fn default_invite_days() -> i64 {
    14
}

async fn list_users(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let rows = sqlx::query(
        "SELECT json_build_object(
             'id', id::text, 'email', email, 'roles', roles,
             'active', active, 'created_at', created_at
         ) AS row
         FROM _users ORDER BY email LIMIT 500",
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

async fn create_user(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(input): Json<CreateUserInput>,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let hash = match &input.password {
        Some(password) if !password.is_empty() => Some(
            bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map_err(|error| AppError::Internal(format!("Password hashing failed: {error}")))?,
        ),
        _ => None,
    };

    let row = sqlx::query(
        "INSERT INTO _users (email, password_hash, roles, active)
         VALUES ($1, $2, $3, true)
         RETURNING json_build_object('id', id::text, 'email', email, 'roles', roles, 'active', active) AS row",
    )
    .bind(input.email.trim().to_ascii_lowercase())
    .bind(hash)
    .bind(json!(input.roles))
    .fetch_one(&app.pool)
    .await
    .map_err(map_db_error)?;

    let data = row
        .try_get::<Option<Value>, _>("row")
        .map_err(map_db_error)?
        .unwrap_or(Value::Null);
    Ok((StatusCode::CREATED, Json(json!({ "data": data }))))
}

async fn update_user(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(input): Json<UpdateUserInput>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let user_id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::NotFound("User not found.".to_string()))?;

    let hash = match &input.password {
        Some(password) if !password.is_empty() => Some(
            bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map_err(|error| AppError::Internal(format!("Password hashing failed: {error}")))?,
        ),
        _ => None,
    };

    let row = sqlx::query(
        "UPDATE _users
         SET roles = COALESCE($2, roles),
             active = COALESCE($3, active),
             password_hash = COALESCE($4, password_hash),
             updated_at = now()
         WHERE id = $1
         RETURNING json_build_object('id', id::text, 'email', email, 'roles', roles, 'active', active) AS row",
    )
    .bind(user_id)
    .bind(input.roles.map(|roles| json!(roles)))
    .bind(input.active)
    .bind(hash)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("User not found.".to_string()))?;

    let data = row
        .try_get::<Option<Value>, _>("row")
        .map_err(map_db_error)?
        .unwrap_or(Value::Null);
    Ok(Json(json!({ "data": data })))
}

async fn delete_user(
    State(state): State<PlatformState>,
    Path((app_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;
    let user_id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::NotFound("User not found.".to_string()))?;

    let affected = sqlx::query("DELETE FROM _users WHERE id = $1")
        .bind(user_id)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound("User not found.".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_invites(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let rows = sqlx::query(
        "SELECT json_build_object(
             'token', token::text, 'email', email, 'roles', roles,
             'expires_at', expires_at, 'accepted_at', accepted_at
         ) AS row
         FROM _invites ORDER BY created_at DESC LIMIT 200",
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

async fn create_invite(
    State(state): State<PlatformState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(input): Json<CreateInviteInput>,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let _user = require_admin(&app, &headers)?;

    let row = sqlx::query(
        "INSERT INTO _invites (email, roles, expires_at)
         VALUES ($1, $2, now() + ($3 * interval '1 day'))
         RETURNING token::text AS token, email, expires_at",
    )
    .bind(input.email.trim().to_ascii_lowercase())
    .bind(json!(input.roles))
    .bind(input.expires_in_days.clamp(1, 90) as f64)
    .fetch_one(&app.pool)
    .await
    .map_err(map_db_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": {
                "token": row.try_get::<String, _>("token").unwrap_or_default(),
                "email": row.try_get::<String, _>("email").unwrap_or_default(),
            },
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_parse_covers_admin_surface() {
        for name in [
            "entities",
            "relations",
            "rules",
            "state-machines",
            "workflows",
            "permissions",
            "webhooks",
            "ui-configs",
        ] {
            assert!(Collection::parse(name).is_ok(), "failed on {name}");
        }
        assert!(Collection::parse("gremlins").is_err());
    }

    #[test]
    fn workflow_graph_validation_rejects_dangling_goto() {
        let workflow: WorkflowDef = serde_json::from_value(json!({
            "id": 1, "name": "w",
            "trigger": {"entity": "order", "to_status": "paid"},
            "steps": [
                {"id": "a", "type": "action", "actions": [], "then": "missing"}
            ]
        }))
        .unwrap();
        assert!(validate_workflow_graph(&workflow).is_err());

        let workflow: WorkflowDef = serde_json::from_value(json!({
            "id": 1, "name": "w",
            "trigger": {"entity": "order", "to_status": "paid"},
            "steps": [
                {"id": "a", "type": "condition", "expression": "record.x > 1",
                 "on_true": "b", "on_false": "end"},
                {"id": "b", "type": "action", "actions": [], "then": "end"}
            ]
        }))
        .unwrap();
        assert!(validate_workflow_graph(&workflow).is_ok());
    }

    #[test]
    fn workflow_graph_validation_rejects_duplicate_ids() {
        let workflow: WorkflowDef = serde_json::from_value(json!({
            "id": 1, "name": "w",
            "trigger": {"entity": "order", "to_status": "paid"},
            "steps": [
                {"id": "a", "type": "action", "actions": [], "then": "end"},
                {"id": "a", "type": "action", "actions": [], "then": "end"}
            ]
        }))
        .unwrap();
        assert!(validate_workflow_graph(&workflow).is_err());
    }
}
