use sqlx::PgPool;

use crate::error::{map_db_error, AppError};
use crate::repository::table_service::validate_identifier;
use crate::schemas::{EntityDef, FieldType, PkType, RelationDef};

/// Platform database schema: the app directory and platform operators.
pub const PLATFORM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS apps (
    name text PRIMARY KEY,
    display_name text NOT NULL,
    db_name text NOT NULL UNIQUE,
    db_driver text NOT NULL DEFAULT 'postgres',
    jwt_secret text NOT NULL,
    status text NOT NULL DEFAULT 'active',
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS platform_users (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    email text NOT NULL UNIQUE,
    password_hash text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS platform_refresh_tokens (
    token uuid PRIMARY KEY,
    user_id uuid NOT NULL REFERENCES platform_users(id) ON DELETE CASCADE,
    expires_at timestamptz NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);
"#;

/// Per-app system tables, applied once at app provisioning. All system
/// tables are `_`-prefixed; entity tables are created later by the admin
/// surface from entity definitions.
pub const APP_SYSTEM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _entities (
    name text PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _relations (
    name text PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _rules (
    id bigserial PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _state_machines (
    id bigserial PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _workflows (
    id bigserial PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _workflow_instances (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    workflow_id bigint NOT NULL,
    entity text NOT NULL,
    record_id text,
    status text NOT NULL DEFAULT 'running',
    current_step text,
    current_step_deadline timestamptz,
    context jsonb NOT NULL DEFAULT '{}'::jsonb,
    history jsonb NOT NULL DEFAULT '[]'::jsonb,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS _workflow_instances_waiting_idx
    ON _workflow_instances (status, current_step_deadline);

CREATE TABLE IF NOT EXISTS _permissions (
    id bigserial PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _webhooks (
    id bigserial PRIMARY KEY,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _webhook_logs (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    webhook_id bigint NOT NULL,
    entity text NOT NULL,
    request jsonb NOT NULL,
    response jsonb,
    status text NOT NULL DEFAULT 'pending',
    attempt int NOT NULL DEFAULT 0,
    max_attempts int NOT NULL DEFAULT 3,
    next_retry_at timestamptz,
    idempotency_key uuid NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS _webhook_logs_retry_idx
    ON _webhook_logs (status, next_retry_at);

CREATE TABLE IF NOT EXISTS _users (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    email text NOT NULL UNIQUE,
    password_hash text,
    roles jsonb NOT NULL DEFAULT '[]'::jsonb,
    active boolean NOT NULL DEFAULT true,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _refresh_tokens (
    token uuid PRIMARY KEY,
    user_id uuid NOT NULL REFERENCES _users(id) ON DELETE CASCADE,
    expires_at timestamptz NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _invites (
    token uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    email text NOT NULL,
    roles jsonb NOT NULL DEFAULT '[]'::jsonb,
    expires_at timestamptz NOT NULL,
    accepted_at timestamptz,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _files (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    filename text NOT NULL,
    mime_type text NOT NULL,
    size bigint NOT NULL,
    content bytea NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _ui_configs (
    id bigserial PRIMARY KEY,
    name text NOT NULL UNIQUE,
    definition jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS _events (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    trace_id uuid NOT NULL,
    span_id uuid NOT NULL,
    parent_span_id uuid,
    source text NOT NULL,
    component text NOT NULL,
    action text NOT NULL,
    entity text,
    record_id text,
    user_id text,
    status text,
    duration_ms double precision,
    metadata jsonb NOT NULL DEFAULT '{}'::jsonb,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS _events_trace_idx ON _events (trace_id);
CREATE INDEX IF NOT EXISTS _events_created_idx ON _events (created_at);
"#;

pub async fn apply_platform_ddl(pool: &PgPool) -> Result<(), AppError> {
    apply_script(pool, PLATFORM_DDL).await
}

pub async fn apply_app_system_ddl(pool: &PgPool) -> Result<(), AppError> {
    apply_script(pool, APP_SYSTEM_DDL).await
}

async fn apply_script(pool: &PgPool, script: &str) -> Result<(), AppError> {
    // Statements are split on blank-line boundaries; each runs separately so
    // a failure names the statement that broke.
    for statement in script.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed)
            .execute(pool)
            .await
            .map_err(map_db_error)?;
    }
    Ok(())
}

fn pg_type(field_type: FieldType, precision: Option<u32>) -> &'static str {
    match field_type {
        FieldType::String => "text",
        FieldType::Text => "text",
        FieldType::Int => "integer",
        FieldType::Bigint => "bigint",
        FieldType::Float => "double precision",
        FieldType::Decimal => {
            let _ = precision;
            "numeric"
        }
        FieldType::Boolean => "boolean",
        FieldType::Uuid => "uuid",
        FieldType::Timestamp => "timestamptz",
        FieldType::Date => "date",
        FieldType::Json => "jsonb",
        // file fields persist the resolved descriptor
        FieldType::File => "jsonb",
    }
}

/// CREATE TABLE text for a freshly defined entity.
pub fn entity_table_ddl(entity: &EntityDef) -> Result<String, AppError> {
    let table = validate_identifier(&entity.table)?;
    let mut columns: Vec<String> = Vec::new();

    for field in &entity.fields {
        let name = validate_identifier(&field.name)?;
        if name == entity.pk_field() {
            let column = match (entity.primary_key.pk_type, entity.primary_key.generated) {
                (PkType::Uuid, true) => {
                    format!("{name} uuid PRIMARY KEY DEFAULT gen_random_uuid()")
                }
                (PkType::Uuid, false) => format!("{name} uuid PRIMARY KEY"),
                (PkType::Int, true) => format!("{name} serial PRIMARY KEY"),
                (PkType::Int, false) => format!("{name} integer PRIMARY KEY"),
                (PkType::Bigint, true) => format!("{name} bigserial PRIMARY KEY"),
                (PkType::Bigint, false) => format!("{name} bigint PRIMARY KEY"),
            };
            columns.push(column);
            continue;
        }

        let mut column = format!("{name} {}", pg_type(field.field_type, field.precision));
        if field.required || !field.nullable {
            column.push_str(" NOT NULL");
        }
        if field.unique {
            column.push_str(" UNIQUE");
        }
        if field.auto.is_some() {
            column.push_str(" DEFAULT now()");
        }
        columns.push(column);
    }

    if entity.soft_delete && entity.field("deleted_at").is_none() {
        columns.push("deleted_at timestamptz".to_string());
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
        columns.join(",\n    ")
    ))
}

/// CREATE TABLE text for a many_to_many relation's join table.
pub fn join_table_ddl(relation: &RelationDef) -> Result<String, AppError> {
    let (Some(join_table), Some(source_key), Some(target_key)) = (
        relation.join_table.as_deref(),
        relation.source_join_key.as_deref(),
        relation.target_join_key.as_deref(),
    ) else {
        return Err(AppError::BadRequest(format!(
            "Relation '{}' has no join table metadata.",
            relation.name
        )));
    };
    let table = validate_identifier(join_table)?;
    let source_key = validate_identifier(source_key)?;
    let target_key = validate_identifier(target_key)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {source_key} uuid NOT NULL,\n    {target_key} uuid NOT NULL,\n    created_at timestamptz NOT NULL DEFAULT now(),\n    PRIMARY KEY ({source_key}, {target_key})\n)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_entity() -> EntityDef {
        serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "soft_delete": true,
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "number", "type": "string", "required": true, "unique": true},
                {"name": "total", "type": "decimal"},
                {"name": "created_at", "type": "timestamp", "auto": "create"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn entity_ddl_shapes_columns() {
        let ddl = entity_table_ddl(&order_entity()).unwrap();
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS orders"), "got: {ddl}");
        assert!(
            ddl.contains("id uuid PRIMARY KEY DEFAULT gen_random_uuid()"),
            "got: {ddl}"
        );
        assert!(ddl.contains("number text NOT NULL UNIQUE"), "got: {ddl}");
        assert!(ddl.contains("total numeric"), "got: {ddl}");
        assert!(ddl.contains("created_at timestamptz"), "got: {ddl}");
        assert!(ddl.contains("DEFAULT now()"), "got: {ddl}");
        assert!(ddl.contains("deleted_at timestamptz"), "got: {ddl}");
    }

    #[test]
    fn join_table_ddl_requires_metadata() {
        let relation: RelationDef = serde_json::from_value(json!({
            "name": "order_tags",
            "type": "many_to_many",
            "source": "order",
            "target": "tag",
            "join_table": "order_tags",
            "source_join_key": "order_id",
            "target_join_key": "tag_id"
        }))
        .unwrap();
        let ddl = join_table_ddl(&relation).unwrap();
        assert!(ddl.contains("PRIMARY KEY (order_id, tag_id)"), "got: {ddl}");

        let broken: RelationDef = serde_json::from_value(json!({
            "name": "order_tags",
            "type": "many_to_many",
            "source": "order",
            "target": "tag"
        }))
        .unwrap();
        assert!(join_table_ddl(&broken).is_err());
    }

    #[test]
    fn ddl_scripts_name_every_system_table() {
        for table in [
            "_entities",
            "_relations",
            "_rules",
            "_state_machines",
            "_workflows",
            "_workflow_instances",
            "_permissions",
            "_webhooks",
            "_webhook_logs",
            "_users",
            "_refresh_tokens",
            "_invites",
            "_files",
            "_ui_configs",
            "_events",
        ] {
            assert!(
                APP_SYSTEM_DDL.contains(table),
                "missing system table {table}"
            );
        }
        for table in ["apps", "platform_users", "platform_refresh_tokens"] {
            assert!(PLATFORM_DDL.contains(table), "missing platform table {table}");
        }
    }
}
