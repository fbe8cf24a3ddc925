use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ValidationDetail};
use crate::registry::RegistrySnapshot;
use crate::repository::table_service::{
    get_row, get_row_tx, hard_delete_row_tx, insert_row_tx, is_uuid_formatted, list_rows_tx,
    soft_delete_row_tx, update_row_tx, FilterClause, FilterOp,
};
use crate::schemas::{
    ActionDef, AutoStamp, EntityDef, FieldDef, FieldType, PkType, RelationDef, RuleHook,
    UserContext, WebhookHook, WriteAction,
};
use crate::services::state_machines::StateChange;
use crate::services::{expression, nested, permissions, rules, slugs, state_machines, webhooks, workflows};
use crate::tenancy::AppContext;

const MAX_NESTED_DEPTH: usize = 8;

/// What a transactional write produced, carried out of the transaction for
/// post-commit dispatch. Child writes fold their state changes into the
/// parent's outcome so nested transitions trigger workflows too.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub record: Value,
    pub state_changes: Vec<(String, StateChange)>,
    pub async_log_ids: Vec<Uuid>,
    pub deferred_webhooks: Vec<ActionDef>,
}

/// Create or update one record, with nested relation writes, inside a single
/// transaction. `existing_id` selects update semantics.
pub async fn write_record(
    app: &Arc<AppContext>,
    entity_name: &str,
    body: Map<String, Value>,
    existing_id: Option<String>,
    user: &UserContext,
) -> AppResult<Value> {
    let snapshot = app.registry.snapshot();
    let entity = snapshot.entity(entity_name)?;
    let action = if existing_id.is_some() {
        WriteAction::Update
    } else {
        WriteAction::Create
    };

    // The request-root span: child spans created below (workflow triggers,
    // nested operations) parent onto it.
    let span = app
        .instrumentation
        .root_span(
            crate::services::instrumentation::TraceContext::current(),
            "orchestrator",
            action.as_str(),
        )
        .entity(entity_name)
        .user_id(&user.id);

    // The transactional work runs on a detached task: a client disconnect
    // drops this handler future, but the in-flight transaction completes.
    let ctx = crate::services::instrumentation::TraceContext::current();
    let task = {
        let app = app.clone();
        let snapshot = snapshot.clone();
        let entity = entity.clone();
        let user = user.clone();
        tokio::spawn(ctx.scope(async move {
            write_record_inner(&app, &snapshot, &entity, body, existing_id, action, &user).await
        }))
    };
    let result = match task.await {
        Ok(result) => result,
        Err(error) => Err(AppError::Internal(format!("Write task failed: {error}"))),
    };

    match &result {
        Ok(_) => span.finish("ok"),
        Err(error) => span.finish(error.code()),
    }
    result
}

async fn write_record_inner(
    app: &Arc<AppContext>,
    snapshot: &Arc<RegistrySnapshot>,
    entity: &Arc<EntityDef>,
    body: Map<String, Value>,
    existing_id: Option<String>,
    action: WriteAction,
    user: &UserContext,
) -> AppResult<Value> {
    // Phase 1: payload split
    let (mut scalars, relation_writes, unknown) = split_payload(snapshot, entity, body);
    if !unknown.is_empty() {
        return Err(AppError::UnknownField(unknown));
    }

    // Phase 2: static validation — collect everything, no short-circuit
    let static_errors = static_validate(entity, &mut scalars, action);

    // Phase 3: write permission, row conditions against the pre-image
    let existing_pk = existing_id
        .as_deref()
        .map(|id| pk_value(entity, id))
        .transpose()?;
    let pre_image = match &existing_pk {
        Some(pk) => {
            get_row(
                &app.pool,
                &entity.table,
                entity.pk_field(),
                pk,
                entity.soft_delete,
            )
            .await?
        }
        None => None,
    };
    if existing_pk.is_some() && pre_image.is_none() {
        return Err(AppError::NotFound(format!(
            "{} record not found.",
            entity.name
        )));
    }
    permissions::check(
        snapshot,
        &entity.name,
        action.perm_action(),
        user,
        pre_image.as_ref(),
    )?;

    // Phase 4: one transaction for everything below
    let mut tx = app.pool.begin().await.map_err(crate::error::map_db_error)?;

    let mut outcome = write_record_in_tx(
        app,
        snapshot,
        &mut tx,
        entity.clone(),
        scalars,
        relation_writes,
        existing_pk,
        action,
        user,
        static_errors,
        0,
    )
    .await?;

    // Enqueue after_write async webhooks inside the transaction: a rollback
    // must leave nothing queued.
    let record_map = outcome.record.as_object().cloned().unwrap_or_default();
    let write_ctx = expression::write_context(&record_map, pre_image.as_ref(), action, user);
    for webhook in snapshot.webhooks_for(&entity.name, WebhookHook::AfterWrite) {
        if let Some(log_id) = webhooks::enqueue_async(
            &mut tx,
            webhook,
            &write_ctx,
            "after_write",
            &entity.name,
            action.as_str(),
            &outcome.record,
            pre_image.as_ref(),
            user,
        )
        .await?
        {
            outcome.async_log_ids.push(log_id);
        }
    }

    // Phase 12: sync webhooks, serial in id order; failure aborts
    webhooks::dispatch_sync(
        &mut tx,
        &app.http,
        snapshot.webhooks_for(&entity.name, WebhookHook::BeforeWrite),
        &write_ctx,
        "before_write",
        &entity.name,
        action.as_str(),
        &outcome.record,
        pre_image.as_ref(),
        user,
        app.webhook_timeout,
    )
    .await?;

    // Phase 13: commit
    tx.commit().await.map_err(crate::error::map_db_error)?;

    // Phase 14: post-commit dispatch, best-effort
    let final_record = refetch(app, entity, &outcome.record).await;
    dispatch_post_commit(app, entity, outcome, &final_record, pre_image, user).await;

    Ok(final_record)
}

/// Phases 5–11, re-entered recursively by the nested writer for child
/// entities (children skip webhook phases; their state changes bubble up).
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_record_in_tx<'a>(
    app: &'a Arc<AppContext>,
    snapshot: &'a Arc<RegistrySnapshot>,
    conn: &'a mut PgConnection,
    entity: Arc<EntityDef>,
    scalars: Map<String, Value>,
    relation_writes: Vec<(Arc<RelationDef>, Value)>,
    existing_pk: Option<Value>,
    action: WriteAction,
    user: &'a UserContext,
    static_errors: Vec<ValidationDetail>,
    depth: usize,
) -> Pin<Box<dyn Future<Output = AppResult<WriteOutcome>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_NESTED_DEPTH {
            return Err(AppError::BadRequest(format!(
                "Nested writes exceed the maximum depth of {MAX_NESTED_DEPTH}."
            )));
        }

        // Phase 5: pre-image inside the transaction
        let old = match &existing_pk {
            Some(pk) => {
                let found = get_row_tx(
                    conn,
                    &entity.table,
                    entity.pk_field(),
                    pk,
                    entity.soft_delete,
                )
                .await?;
                Some(found.ok_or_else(|| {
                    AppError::NotFound(format!("{} record not found.", entity.name))
                })?)
            }
            None => None,
        };

        // The working record rules and state machines see: pre-image overlaid
        // with the incoming scalars. Only dirty keys reach the SQL write.
        let mut work: Map<String, Value> = old
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut dirty: HashSet<String> = scalars.keys().cloned().collect();
        for (key, value) in scalars {
            work.insert(key, value);
        }

        // Phase 6: slug generation
        if let Some(slug_cfg) = &entity.slug {
            let caller_supplied = dirty.contains(&slug_cfg.field)
                && work
                    .get(&slug_cfg.field)
                    .is_some_and(|value| value.as_str().is_some_and(|text| !text.is_empty()));
            let source_changed = match (&old, work.get(&slug_cfg.source)) {
                (Some(old), Some(new_source)) => old.get(&slug_cfg.source) != Some(new_source),
                (None, _) => true,
                _ => false,
            };
            let should_generate = !caller_supplied
                && (action == WriteAction::Create
                    || (slug_cfg.regenerate_on_update && source_changed));
            if should_generate {
                if let Some(source) = work.get(&slug_cfg.source).and_then(Value::as_str) {
                    let slug = slugs::unique_slug(
                        conn,
                        &entity,
                        &slug_cfg.field,
                        source,
                        existing_pk.as_ref(),
                    )
                    .await?;
                    work.insert(slug_cfg.field.clone(), Value::String(slug));
                    dirty.insert(slug_cfg.field.clone());
                }
            }
        }

        // Phase 7: rules (field → expression → computed)
        let before_rules = work.clone();
        let rule_errors = rules::run_rules(
            snapshot.rules_for(&entity.name, RuleHook::BeforeWrite),
            &mut work,
            old.as_ref(),
            action,
            user,
            static_errors.len(),
        );
        let mut errors = static_errors;
        errors.extend(rule_errors);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }
        mark_dirty(&before_rules, &work, &mut dirty);

        // Phase 8: state machines
        let before_machines = work.clone();
        let changes = state_machines::evaluate(
            snapshot.state_machines_for(&entity.name),
            &mut work,
            old.as_ref(),
            action,
            user,
        )?;
        mark_dirty(&before_machines, &work, &mut dirty);
        let mut deferred_webhooks: Vec<ActionDef> = Vec::new();
        let mut state_changes: Vec<(String, StateChange)> = Vec::new();
        for mut change in changes {
            deferred_webhooks.append(&mut change.deferred_webhooks);
            state_changes.push((entity.name.clone(), change));
        }

        // Phase 9: file-field resolution
        resolve_file_fields(conn, &entity, &mut work, &mut dirty).await?;

        // Phase 10: parent write
        let record = match (&existing_pk, action) {
            (None, _) => {
                let payload: Map<String, Value> = work
                    .iter()
                    .filter(|(key, _)| dirty.contains(*key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                insert_row_tx(conn, &entity.table, &payload).await?
            }
            (Some(pk), _) => {
                let payload: Map<String, Value> = work
                    .iter()
                    .filter(|(key, _)| dirty.contains(*key) && *key != entity.pk_field())
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if payload.is_empty() {
                    old.clone().unwrap_or(Value::Null)
                } else {
                    update_row_tx(
                        conn,
                        &entity.table,
                        entity.pk_field(),
                        pk,
                        &payload,
                        entity.soft_delete,
                    )
                    .await?
                }
            }
        };

        // Phase 11: nested child writes, payload order
        let committed_pk = record
            .get(entity.pk_field())
            .cloned()
            .or(existing_pk.clone())
            .ok_or_else(|| AppError::Internal("Write returned no primary key.".to_string()))?;
        let nested_outcome = nested::apply(
            app,
            snapshot,
            conn,
            &entity,
            &committed_pk,
            relation_writes,
            user,
            depth,
        )
        .await?;
        state_changes.extend(nested_outcome.state_changes);
        deferred_webhooks.extend(nested_outcome.deferred_webhooks);

        Ok(WriteOutcome {
            record,
            state_changes,
            async_log_ids: Vec::new(),
            deferred_webhooks,
        })
    })
}

/// Delete one record: permission → tx → rules → sync webhooks → soft/hard
/// delete → cascades → commit → async dispatch.
pub async fn delete_record(
    app: &Arc<AppContext>,
    entity_name: &str,
    id: &str,
    user: &UserContext,
) -> AppResult<Value> {
    let snapshot = app.registry.snapshot();
    let entity = snapshot.entity(entity_name)?;
    let pk = pk_value(&entity, id)?;

    let span = app
        .instrumentation
        .root_span(
            crate::services::instrumentation::TraceContext::current(),
            "orchestrator",
            "delete",
        )
        .entity(entity_name)
        .record_id(id)
        .user_id(&user.id);

    let pre_image = get_row(
        &app.pool,
        &entity.table,
        entity.pk_field(),
        &pk,
        entity.soft_delete,
    )
    .await?
    .ok_or_else(|| AppError::NotFound(format!("{entity_name} record not found.")))?;

    // Detached like the write path: the delete transaction survives a
    // client disconnect.
    let ctx = crate::services::instrumentation::TraceContext::current();
    let task = {
        let app = app.clone();
        let snapshot = snapshot.clone();
        let entity = entity.clone();
        let pk = pk.clone();
        let user = user.clone();
        let pre_image = pre_image.clone();
        tokio::spawn(ctx.scope(async move {
            permissions::check(
                &snapshot,
                &entity.name,
                WriteAction::Delete.perm_action(),
                &user,
                Some(&pre_image),
            )?;

            let mut tx = app.pool.begin().await.map_err(crate::error::map_db_error)?;
            let outcome =
                delete_record_in_tx(&app, &snapshot, &mut tx, entity.clone(), pk, &user, 0)
                    .await?;
            tx.commit().await.map_err(crate::error::map_db_error)?;

            for log_id in &outcome.async_log_ids {
                let pool = app.pool.clone();
                let client = app.http.clone();
                let backoff = app.backoff_base_seconds;
                let timeout = app.webhook_timeout;
                let log_id = *log_id;
                tokio::spawn(async move {
                    webhooks::attempt_delivery(&pool, &client, log_id, backoff, timeout).await;
                });
            }
            Ok(outcome.record)
        }))
    };
    let result = match task.await {
        Ok(result) => result,
        Err(error) => Err(AppError::Internal(format!("Delete task failed: {error}"))),
    };

    match &result {
        Ok(_) => span.finish("ok"),
        Err(error) => span.finish(error.code()),
    }
    result
}

/// Transactional half of deletion, re-entered for cascade targets. Missing
/// rows during cascade recursion are skipped; the top-level caller has
/// already 404'd on a missing root.
pub(crate) fn delete_record_in_tx<'a>(
    app: &'a Arc<AppContext>,
    snapshot: &'a Arc<RegistrySnapshot>,
    conn: &'a mut PgConnection,
    entity: Arc<EntityDef>,
    pk: Value,
    user: &'a UserContext,
    depth: usize,
) -> Pin<Box<dyn Future<Output = AppResult<WriteOutcome>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_NESTED_DEPTH {
            return Err(AppError::Conflict(format!(
                "Cascade depth exceeds {MAX_NESTED_DEPTH}; aborting delete."
            )));
        }

        let Some(old) = get_row_tx(conn, &entity.table, entity.pk_field(), &pk, entity.soft_delete)
            .await?
        else {
            if depth == 0 {
                return Err(AppError::NotFound(format!(
                    "{} record not found.",
                    entity.name
                )));
            }
            return Ok(WriteOutcome::default());
        };

        // before_delete rules
        let mut work = old.as_object().cloned().unwrap_or_default();
        let errors = rules::run_rules(
            snapshot.rules_for(&entity.name, RuleHook::BeforeDelete),
            &mut work,
            Some(&old),
            WriteAction::Delete,
            user,
            0,
        );
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        // before_delete sync webhooks abort on failure
        let delete_ctx = expression::write_context(&work, Some(&old), WriteAction::Delete, user);
        webhooks::dispatch_sync(
            conn,
            &app.http,
            snapshot.webhooks_for(&entity.name, WebhookHook::BeforeDelete),
            &delete_ctx,
            "before_delete",
            &entity.name,
            "delete",
            &old,
            Some(&old),
            user,
            app.webhook_timeout,
        )
        .await?;

        // Cascades: restrict first so the conflict surfaces before any write
        for relation in snapshot.relations_for(&entity.name) {
            cascade_relation(app, snapshot, conn, relation, &pk, user, depth).await?;
        }

        // The delete itself
        if entity.soft_delete {
            let affected = soft_delete_row_tx(conn, &entity.table, entity.pk_field(), &pk).await?;
            if affected == 0 && depth == 0 {
                return Err(AppError::NotFound(format!(
                    "{} record not found.",
                    entity.name
                )));
            }
        } else {
            hard_delete_row_tx(conn, &entity.table, entity.pk_field(), &pk).await?;
        }

        // after_delete async webhooks ride in the transaction
        let mut async_log_ids = Vec::new();
        for webhook in snapshot.webhooks_for(&entity.name, WebhookHook::AfterDelete) {
            if let Some(log_id) = webhooks::enqueue_async(
                conn,
                webhook,
                &delete_ctx,
                "after_delete",
                &entity.name,
                "delete",
                &old,
                Some(&old),
                user,
            )
            .await?
            {
                async_log_ids.push(log_id);
            }
        }

        Ok(WriteOutcome {
            record: old,
            state_changes: Vec::new(),
            async_log_ids,
            deferred_webhooks: Vec::new(),
        })
    })
}

async fn cascade_relation(
    app: &Arc<AppContext>,
    snapshot: &Arc<RegistrySnapshot>,
    conn: &mut PgConnection,
    relation: &Arc<RelationDef>,
    parent_pk: &Value,
    user: &UserContext,
    depth: usize,
) -> AppResult<()> {
    use crate::schemas::OnDelete;

    if relation.is_many_to_many() {
        // Join rows always go; target rows are independent entities.
        let join_table = relation.join_table.as_deref().unwrap_or_default();
        let source_key = relation.source_join_key.as_deref().unwrap_or_default();
        crate::repository::table_service::delete_where_tx(conn, join_table, source_key, parent_pk)
            .await?;
        return Ok(());
    }

    let target = snapshot.entity(&relation.target)?;
    let target_key = relation
        .target_key
        .as_deref()
        .ok_or_else(|| AppError::Internal(format!("Relation '{}' lacks target_key.", relation.name)))?;
    let dependent_filter = [FilterClause {
        column: target_key.to_string(),
        op: FilterOp::Eq,
        value: parent_pk.clone(),
    }];

    match relation.on_delete {
        OnDelete::Restrict => {
            let count = crate::repository::table_service::count_rows_tx(
                conn,
                &target.table,
                &dependent_filter,
                target.soft_delete,
            )
            .await?;
            if count > 0 {
                return Err(AppError::Conflict(format!(
                    "Cannot delete: {count} dependent '{}' record(s) exist.",
                    target.name
                )));
            }
        }
        OnDelete::SetNull => {
            crate::repository::table_service::set_null_tx(conn, &target.table, target_key, parent_pk)
                .await?;
        }
        OnDelete::Cascade => {
            let dependents = list_rows_tx(
                conn,
                &target.table,
                &dependent_filter,
                target.soft_delete,
                10_000,
            )
            .await?;
            for dependent in dependents {
                let Some(child_pk) = dependent.get(target.pk_field()).cloned() else {
                    continue;
                };
                delete_record_in_tx(
                    app,
                    snapshot,
                    conn,
                    target.clone(),
                    child_pk,
                    user,
                    depth + 1,
                )
                .await?;
            }
        }
        OnDelete::Detach => {
            // For row relations detach means: cut the link, keep the row.
            crate::repository::table_service::set_null_tx(conn, &target.table, target_key, parent_pk)
                .await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Phase helpers
// ---------------------------------------------------------------------------

/// Phase 1: split the body into entity scalars, relation writes (payload
/// order preserved) and unknown keys.
pub(crate) fn split_payload(
    snapshot: &RegistrySnapshot,
    entity: &EntityDef,
    body: Map<String, Value>,
) -> (
    Map<String, Value>,
    Vec<(Arc<RelationDef>, Value)>,
    Vec<String>,
) {
    let mut scalars = Map::new();
    let mut relation_writes = Vec::new();
    let mut unknown = Vec::new();

    let relations = snapshot.relations_for(&entity.name);

    for (key, value) in body {
        if key == "_delete" {
            // nested-write marker, consumed by the nested writer
            continue;
        }
        if entity.field(&key).is_some() {
            scalars.insert(key, value);
            continue;
        }
        if let Some(relation) = relations.iter().find(|relation| relation.name == key) {
            relation_writes.push((relation.clone(), value));
            continue;
        }
        unknown.push(key);
    }

    (scalars, relation_writes, unknown)
}

/// Phase 2: required-on-create, enum membership, per-type coercion, auto
/// timestamps and defaults. Returns every violation found.
pub(crate) fn static_validate(
    entity: &EntityDef,
    scalars: &mut Map<String, Value>,
    action: WriteAction,
) -> Vec<ValidationDetail> {
    let mut errors = Vec::new();
    let now = Utc::now().to_rfc3339();
    let slug_field = entity.slug.as_ref().map(|slug| slug.field.as_str());

    for field in &entity.fields {
        let is_pk = field.name == entity.pk_field();

        // Auto timestamps override the caller.
        match field.auto {
            Some(AutoStamp::Create) if action == WriteAction::Create => {
                scalars.insert(field.name.clone(), Value::String(now.clone()));
                continue;
            }
            Some(AutoStamp::Update) => {
                scalars.insert(field.name.clone(), Value::String(now.clone()));
                continue;
            }
            _ => {}
        }

        if is_pk {
            match action {
                WriteAction::Create if entity.primary_key.generated => {
                    scalars.remove(&field.name);
                    continue;
                }
                WriteAction::Update | WriteAction::Delete => {
                    scalars.remove(&field.name);
                    continue;
                }
                _ => {}
            }
        }

        let present = scalars
            .get(&field.name)
            .is_some_and(|value| !value.is_null());

        if !present {
            let explicit_null = scalars.get(&field.name).is_some_and(Value::is_null);
            if action == WriteAction::Create {
                if let Some(default) = &field.default {
                    scalars.insert(field.name.clone(), default.clone());
                    continue;
                }
                let slug_generated = slug_field == Some(field.name.as_str());
                if field.required && !slug_generated {
                    errors.push(ValidationDetail::new(
                        &field.name,
                        "required",
                        format!("'{}' is required.", field.name),
                    ));
                } else if explicit_null && !field.nullable {
                    errors.push(ValidationDetail::new(
                        &field.name,
                        "required",
                        format!("'{}' must not be null.", field.name),
                    ));
                }
            } else if explicit_null && (field.required || !field.nullable) {
                errors.push(ValidationDetail::new(
                    &field.name,
                    "required",
                    format!("'{}' must not be null.", field.name),
                ));
            }
            continue;
        }

        let value = scalars.get(&field.name).cloned().unwrap_or(Value::Null);
        match coerce_value(field, value) {
            Ok(coerced) => {
                scalars.insert(field.name.clone(), coerced);
            }
            Err(detail) => errors.push(detail),
        }
    }

    errors
}

fn coerce_value(field: &FieldDef, value: Value) -> Result<Value, ValidationDetail> {
    let type_error = |expected: &str| {
        ValidationDetail::new(
            &field.name,
            "type",
            format!("'{}' must be a {expected}.", field.name),
        )
    };

    let coerced = match field.field_type {
        FieldType::String | FieldType::Text => match value {
            Value::String(text) => Value::String(text),
            Value::Number(number) => Value::String(number.to_string()),
            Value::Bool(flag) => Value::String(flag.to_string()),
            _ => return Err(type_error("string")),
        },
        FieldType::Int | FieldType::Bigint => match &value {
            Value::Number(number) if number.is_i64() => value,
            Value::Number(number) => {
                let float = number.as_f64().unwrap_or(f64::NAN);
                if float.fract() == 0.0 {
                    json!(float as i64)
                } else {
                    return Err(type_error("whole number"));
                }
            }
            Value::String(text) => match text.trim().parse::<i64>() {
                Ok(parsed) => json!(parsed),
                Err(_) => return Err(type_error("whole number")),
            },
            _ => return Err(type_error("whole number")),
        },
        FieldType::Float | FieldType::Decimal => match &value {
            Value::Number(_) => value,
            Value::String(text) if text.trim().parse::<f64>().is_ok() => value,
            _ => return Err(type_error("number")),
        },
        FieldType::Boolean => match &value {
            Value::Bool(_) => value,
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(type_error("boolean")),
            },
            _ => return Err(type_error("boolean")),
        },
        FieldType::Uuid => match &value {
            Value::String(text) if uuid::Uuid::try_parse(text.trim()).is_ok() => value,
            _ => return Err(type_error("uuid")),
        },
        FieldType::Timestamp => match &value {
            Value::String(text) if DateTime::parse_from_rfc3339(text.trim()).is_ok() => value,
            _ => return Err(type_error("timestamp (RFC 3339)")),
        },
        FieldType::Date => match &value {
            Value::String(text)
                if NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").is_ok() =>
            {
                value
            }
            _ => return Err(type_error("date (YYYY-MM-DD)")),
        },
        FieldType::Json => value,
        FieldType::File => match &value {
            Value::String(_) | Value::Object(_) => value,
            _ => return Err(type_error("file reference")),
        },
    };

    if let Some(enum_values) = &field.enum_values {
        if let Some(text) = coerced.as_str() {
            if !enum_values.iter().any(|allowed| allowed == text) {
                return Err(ValidationDetail::new(
                    &field.name,
                    "enum",
                    format!(
                        "'{}' must be one of: {}.",
                        field.name,
                        enum_values.join(", ")
                    ),
                ));
            }
        }
    }

    Ok(coerced)
}

/// Phase 9: file-typed fields holding a bare UUID resolve to the stored
/// descriptor; an unknown UUID is a 404.
async fn resolve_file_fields(
    conn: &mut PgConnection,
    entity: &EntityDef,
    work: &mut Map<String, Value>,
    dirty: &mut HashSet<String>,
) -> AppResult<()> {
    for field in &entity.fields {
        if field.field_type != FieldType::File {
            continue;
        }
        let Some(value) = work.get(&field.name) else {
            continue;
        };
        if !is_uuid_formatted(value) {
            continue;
        }
        let file_id = value.as_str().unwrap_or_default().to_string();
        let row = sqlx::query(
            "SELECT id::text AS id, filename, mime_type, size FROM _files WHERE id = $1::uuid",
        )
        .bind(&file_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(crate::error::map_db_error)?;

        let Some(row) = row else {
            return Err(AppError::NotFound(format!(
                "File '{file_id}' referenced by '{}' not found.",
                field.name
            )));
        };
        let descriptor = json!({
            "id": row.try_get::<String, _>("id").unwrap_or_default(),
            "filename": row.try_get::<String, _>("filename").unwrap_or_default(),
            "size": row.try_get::<i64, _>("size").unwrap_or_default(),
            "mime_type": row.try_get::<String, _>("mime_type").unwrap_or_default(),
        });
        work.insert(field.name.clone(), descriptor);
        dirty.insert(field.name.clone());
    }
    Ok(())
}

fn mark_dirty(before: &Map<String, Value>, after: &Map<String, Value>, dirty: &mut HashSet<String>) {
    for (key, value) in after {
        if before.get(key) != Some(value) {
            dirty.insert(key.clone());
        }
    }
}

pub(crate) fn pk_value(entity: &EntityDef, raw: &str) -> AppResult<Value> {
    match entity.primary_key.pk_type {
        PkType::Uuid => {
            if uuid::Uuid::try_parse(raw).is_err() {
                return Err(AppError::NotFound(format!(
                    "{} record not found.",
                    entity.name
                )));
            }
            Ok(Value::String(raw.to_string()))
        }
        PkType::Int | PkType::Bigint => raw
            .parse::<i64>()
            .map(|parsed| json!(parsed))
            .map_err(|_| AppError::NotFound(format!("{} record not found.", entity.name))),
    }
}

async fn refetch(app: &Arc<AppContext>, entity: &EntityDef, record: &Value) -> Value {
    let Some(pk) = record.get(entity.pk_field()) else {
        return record.clone();
    };
    match get_row(
        &app.pool,
        &entity.table,
        entity.pk_field(),
        pk,
        entity.soft_delete,
    )
    .await
    {
        Ok(Some(fresh)) => fresh,
        _ => record.clone(),
    }
}

async fn dispatch_post_commit(
    app: &Arc<AppContext>,
    entity: &Arc<EntityDef>,
    outcome: WriteOutcome,
    final_record: &Value,
    pre_image: Option<Value>,
    user: &UserContext,
) {
    // Async webhook deliveries
    for log_id in outcome.async_log_ids {
        let pool = app.pool.clone();
        let client = app.http.clone();
        let backoff = app.backoff_base_seconds;
        let timeout = app.webhook_timeout;
        tokio::spawn(async move {
            webhooks::attempt_delivery(&pool, &client, log_id, backoff, timeout).await;
        });
    }

    // Transition webhook actions (fire-and-forget)
    for action in outcome.deferred_webhooks {
        if let ActionDef::Webhook {
            url,
            method,
            payload,
        } = action
        {
            let body = payload.unwrap_or_else(|| final_record.clone());
            webhooks::fire_and_forget(app.http.clone(), url, method, body);
        }
    }

    // Workflow triggers for every changed state field
    for (changed_entity, change) in outcome.state_changes {
        let result = workflows::dispatch_triggers(
            app,
            &changed_entity,
            &change,
            final_record,
            pre_image.as_ref(),
            user,
        )
        .await;
        if let Err(error) = result {
            tracing::warn!(
                entity = %changed_entity,
                to = %change.to,
                error = %error,
                "Workflow trigger dispatch failed"
            );
        }
    }

    let _ = entity;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistrySnapshot;
    use serde_json::json;

    fn order_entity() -> EntityDef {
        serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "soft_delete": false,
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "number", "type": "string", "required": true},
                {"name": "status", "type": "string", "enum": ["open", "held", "closed"], "default": "open"},
                {"name": "qty", "type": "int"},
                {"name": "total", "type": "decimal"},
                {"name": "active", "type": "boolean"},
                {"name": "placed_on", "type": "date"},
                {"name": "created_at", "type": "timestamp", "auto": "create"},
                {"name": "updated_at", "type": "timestamp", "auto": "update"}
            ]
        }))
        .unwrap()
    }

    fn snapshot_with_relation() -> RegistrySnapshot {
        let line_item: EntityDef = serde_json::from_value(json!({
            "name": "line_item",
            "table": "line_items",
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "order_id", "type": "uuid"},
                {"name": "qty", "type": "int"}
            ]
        }))
        .unwrap();
        let relation: RelationDef = serde_json::from_value(json!({
            "name": "line_items",
            "type": "one_to_many",
            "source": "order",
            "target": "line_item",
            "target_key": "order_id"
        }))
        .unwrap();
        RegistrySnapshot::build(
            vec![order_entity(), line_item],
            vec![relation],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn split_separates_scalars_relations_unknowns() {
        let snapshot = snapshot_with_relation();
        let entity = snapshot.entity("order").unwrap();
        let body = json!({
            "number": "SO-1",
            "line_items": [{"qty": 2}],
            "bogus": true
        })
        .as_object()
        .cloned()
        .unwrap();

        let (scalars, relations, unknown) = split_payload(&snapshot, &entity, body);
        assert_eq!(scalars.len(), 1);
        assert!(scalars.contains_key("number"));
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].0.name, "line_items");
        assert_eq!(unknown, vec!["bogus".to_string()]);
    }

    #[test]
    fn static_validation_collects_all_errors() {
        let entity = order_entity();
        let mut scalars = json!({
            "status": "nope",
            "qty": "abc"
        })
        .as_object()
        .cloned()
        .unwrap();
        let errors = static_validate(&entity, &mut scalars, WriteAction::Create);
        let rules: Vec<&str> = errors.iter().map(|error| error.rule.as_str()).collect();
        // missing required `number`, bad enum, bad int — all reported at once
        assert!(rules.contains(&"required"), "got {rules:?}");
        assert!(rules.contains(&"enum"), "got {rules:?}");
        assert!(rules.contains(&"type"), "got {rules:?}");
    }

    #[test]
    fn static_validation_applies_defaults_and_auto_stamps() {
        let entity = order_entity();
        let mut scalars = json!({"number": "SO-1"}).as_object().cloned().unwrap();
        let errors = static_validate(&entity, &mut scalars, WriteAction::Create);
        assert!(errors.is_empty(), "got {errors:?}");
        assert_eq!(scalars["status"], json!("open"));
        assert!(scalars.contains_key("created_at"));
        assert!(scalars.contains_key("updated_at"));
    }

    #[test]
    fn coercion_per_type() {
        let entity = order_entity();
        let mut scalars = json!({
            "number": 42,
            "qty": "7",
            "total": "19.95",
            "active": "true",
            "placed_on": "2026-03-01"
        })
        .as_object()
        .cloned()
        .unwrap();
        let errors = static_validate(&entity, &mut scalars, WriteAction::Update);
        assert!(errors.is_empty(), "got {errors:?}");
        assert_eq!(scalars["number"], json!("42"));
        assert_eq!(scalars["qty"], json!(7));
        assert_eq!(scalars["total"], json!("19.95"));
        assert_eq!(scalars["active"], json!(true));
    }

    #[test]
    fn update_null_on_required_field_rejected() {
        let entity = order_entity();
        let mut scalars = json!({"number": null}).as_object().cloned().unwrap();
        let errors = static_validate(&entity, &mut scalars, WriteAction::Update);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule, "required");
    }

    #[test]
    fn generated_pk_dropped_on_create_and_update() {
        let entity = order_entity();
        let mut scalars = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "number": "SO-9"
        })
        .as_object()
        .cloned()
        .unwrap();
        static_validate(&entity, &mut scalars, WriteAction::Create);
        assert!(!scalars.contains_key("id"));
    }

    #[test]
    fn pk_value_parses_by_declared_type() {
        let entity = order_entity();
        assert!(pk_value(&entity, "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(matches!(
            pk_value(&entity, "not-a-uuid"),
            Err(AppError::NotFound(_))
        ));

        let int_entity: EntityDef = serde_json::from_value(json!({
            "name": "counter",
            "table": "counters",
            "primary_key": {"field": "id", "type": "bigint"},
            "fields": [{"name": "id", "type": "bigint"}]
        }))
        .unwrap();
        assert_eq!(pk_value(&int_entity, "42").unwrap(), json!(42));
        assert!(pk_value(&int_entity, "x").is_err());
    }

    #[test]
    fn dirty_tracking_catches_rule_mutations() {
        let before = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let after = json!({"a": 1, "b": 3, "c": 4}).as_object().cloned().unwrap();
        let mut dirty = HashSet::new();
        mark_dirty(&before, &after, &mut dirty);
        assert!(dirty.contains("b"));
        assert!(dirty.contains("c"));
        assert!(!dirty.contains("a"));
    }
}
