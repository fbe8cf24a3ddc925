use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{map_db_error, AppError, AppResult};
use crate::registry::RegistrySnapshot;
use crate::repository::table_service::{
    delete_join_row_tx, list_rows_tx, render_scalar, validate_identifier, FilterClause, FilterOp,
};
use crate::schemas::{ActionDef, EntityDef, RelationDef, UserContext, WriteAction, WriteMode};
use crate::services::orchestrator;
use crate::services::state_machines::StateChange;
use crate::tenancy::AppContext;

#[derive(Debug, Default)]
pub struct NestedOutcome {
    pub state_changes: Vec<(String, StateChange)>,
    pub deferred_webhooks: Vec<ActionDef>,
}

/// Apply every relation write of one parent, in payload order. Row relations
/// re-enter the orchestrator's transactional phases per child; M2M relations
/// edit the join table only.
#[allow(clippy::too_many_arguments)]
pub async fn apply(
    app: &Arc<AppContext>,
    snapshot: &Arc<RegistrySnapshot>,
    conn: &mut PgConnection,
    parent: &EntityDef,
    parent_pk: &Value,
    relation_writes: Vec<(Arc<RelationDef>, Value)>,
    user: &UserContext,
    depth: usize,
) -> AppResult<NestedOutcome> {
    let mut outcome = NestedOutcome::default();
    for (relation, payload) in relation_writes {
        if relation.is_many_to_many() {
            apply_join_writes(conn, &relation, parent_pk, payload).await?;
        } else {
            apply_child_writes(
                app,
                snapshot,
                conn,
                &relation,
                parent_pk,
                payload,
                user,
                depth,
                &mut outcome,
            )
            .await?;
        }
    }
    let _ = parent;
    Ok(outcome)
}

/// One payload entry of a row-relation write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChildItem {
    pub pk: Option<Value>,
    pub delete: bool,
    pub body: Map<String, Value>,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ChildPlan {
    pub inserts: Vec<Map<String, Value>>,
    pub updates: Vec<(Value, Map<String, Value>)>,
    pub deletes: Vec<Value>,
}

pub(crate) fn parse_items(pk_field: &str, payload: Value) -> AppResult<Vec<ChildItem>> {
    let raw_items = match payload {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(AppError::BadRequest(format!(
                "Relation write must be an object or list, got {other}."
            )))
        }
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let Value::Object(mut body) = raw else {
            return Err(AppError::BadRequest(
                "Relation write entries must be objects.".to_string(),
            ));
        };
        let delete = body
            .remove("_delete")
            .is_some_and(|flag| flag.as_bool().unwrap_or(false));
        let pk = body.get(pk_field).filter(|value| !value.is_null()).cloned();
        items.push(ChildItem { pk, delete, body });
    }
    Ok(items)
}

/// The write_mode table: which payload entries insert, update or delete, and
/// which DB rows missing from the payload get removed.
pub(crate) fn plan_child_ops(
    mode: WriteMode,
    items: Vec<ChildItem>,
    existing_pks: &[Value],
) -> ChildPlan {
    let mut plan = ChildPlan::default();
    let mut referenced: HashSet<String> = HashSet::new();

    for item in items {
        match (&item.pk, item.delete, mode) {
            // append ignores existing rows and delete markers entirely
            (None, _, WriteMode::Append) => plan.inserts.push(item.body),
            (Some(_), _, WriteMode::Append) => {}

            (Some(pk), true, _) => {
                referenced.insert(render_scalar(pk));
                plan.deletes.push(pk.clone());
            }
            (None, true, _) => {}
            (Some(pk), false, _) => {
                referenced.insert(render_scalar(pk));
                plan.updates.push((pk.clone(), item.body));
            }
            (None, false, _) => plan.inserts.push(item.body),
        }
    }

    if mode == WriteMode::Replace {
        for existing in existing_pks {
            if !referenced.contains(&render_scalar(existing)) {
                plan.deletes.push(existing.clone());
            }
        }
    }

    plan
}

#[allow(clippy::too_many_arguments)]
async fn apply_child_writes(
    app: &Arc<AppContext>,
    snapshot: &Arc<RegistrySnapshot>,
    conn: &mut PgConnection,
    relation: &RelationDef,
    parent_pk: &Value,
    payload: Value,
    user: &UserContext,
    depth: usize,
    outcome: &mut NestedOutcome,
) -> AppResult<()> {
    let target = snapshot.entity(&relation.target)?;
    let target_key = relation.target_key.as_deref().ok_or_else(|| {
        AppError::Internal(format!("Relation '{}' lacks target_key.", relation.name))
    })?;

    let items = parse_items(target.pk_field(), payload)?;

    let existing_pks: Vec<Value> = if relation.write_mode == WriteMode::Replace {
        let rows = list_rows_tx(
            conn,
            &target.table,
            &[FilterClause {
                column: target_key.to_string(),
                op: FilterOp::Eq,
                value: parent_pk.clone(),
            }],
            target.soft_delete,
            10_000,
        )
        .await?;
        rows.iter()
            .filter_map(|row| row.get(target.pk_field()).cloned())
            .collect()
    } else {
        Vec::new()
    };

    let plan = plan_child_ops(relation.write_mode, items, &existing_pks);

    for mut body in plan.inserts {
        // FK propagation: the committed parent PK always wins.
        body.insert(target_key.to_string(), parent_pk.clone());
        let changes = write_child(app, snapshot, conn, &target, body, None, user, depth).await?;
        collect(outcome, changes);
    }
    for (pk, mut body) in plan.updates {
        body.insert(target_key.to_string(), parent_pk.clone());
        let changes = write_child(app, snapshot, conn, &target, body, Some(pk), user, depth).await?;
        collect(outcome, changes);
    }
    for pk in plan.deletes {
        orchestrator::delete_record_in_tx(
            app,
            snapshot,
            conn,
            target.clone(),
            pk,
            user,
            depth + 1,
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn write_child(
    app: &Arc<AppContext>,
    snapshot: &Arc<RegistrySnapshot>,
    conn: &mut PgConnection,
    target: &Arc<EntityDef>,
    body: Map<String, Value>,
    existing_pk: Option<Value>,
    user: &UserContext,
    depth: usize,
) -> AppResult<Option<crate::services::orchestrator::WriteOutcome>> {
    let action = if existing_pk.is_some() {
        WriteAction::Update
    } else {
        WriteAction::Create
    };

    let (mut scalars, relation_writes, unknown) =
        orchestrator::split_payload(snapshot, target, body);
    if !unknown.is_empty() {
        return Err(AppError::UnknownField(unknown));
    }
    let static_errors = orchestrator::static_validate(target, &mut scalars, action);

    let child_outcome = orchestrator::write_record_in_tx(
        app,
        snapshot,
        conn,
        target.clone(),
        scalars,
        relation_writes,
        existing_pk,
        action,
        user,
        static_errors,
        depth + 1,
    )
    .await?;
    Ok(Some(child_outcome))
}

fn collect(
    outcome: &mut NestedOutcome,
    child: Option<crate::services::orchestrator::WriteOutcome>,
) {
    if let Some(child) = child {
        outcome.state_changes.extend(child.state_changes);
        outcome.deferred_webhooks.extend(child.deferred_webhooks);
    }
}

// ---------------------------------------------------------------------------
// M2M join-table writes
// ---------------------------------------------------------------------------

/// Target ids named by one M2M payload entry: bare scalars or objects with
/// an `id` / target-pk value, plus the `_delete` marker.
pub(crate) fn parse_join_items(payload: Value) -> AppResult<Vec<(Value, bool)>> {
    let raw_items = match payload {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => {
            return Err(AppError::BadRequest(format!(
                "A many_to_many write must be a list, got {other}."
            )))
        }
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        match raw {
            Value::Object(mut body) => {
                let delete = body
                    .remove("_delete")
                    .is_some_and(|flag| flag.as_bool().unwrap_or(false));
                let id = body
                    .remove("id")
                    .filter(|value| !value.is_null())
                    .ok_or_else(|| {
                        AppError::BadRequest(
                            "A many_to_many entry object needs an 'id'.".to_string(),
                        )
                    })?;
                items.push((id, delete));
            }
            scalar @ (Value::String(_) | Value::Number(_)) => items.push((scalar, false)),
            other => {
                return Err(AppError::BadRequest(format!(
                    "Invalid many_to_many entry: {other}."
                )))
            }
        }
    }
    Ok(items)
}

async fn apply_join_writes(
    conn: &mut PgConnection,
    relation: &RelationDef,
    parent_pk: &Value,
    payload: Value,
) -> AppResult<()> {
    let (Some(join_table), Some(source_key), Some(target_key)) = (
        relation.join_table.as_deref(),
        relation.source_join_key.as_deref(),
        relation.target_join_key.as_deref(),
    ) else {
        return Err(AppError::Internal(format!(
            "Relation '{}' lacks join table metadata.",
            relation.name
        )));
    };

    let items = parse_join_items(payload)?;
    let desired: Vec<&Value> = items
        .iter()
        .filter(|(_, delete)| !delete)
        .map(|(id, _)| id)
        .collect();

    match relation.write_mode {
        WriteMode::Diff => {
            for (id, delete) in &items {
                if *delete {
                    delete_join_row_tx(conn, join_table, source_key, parent_pk, target_key, id)
                        .await?;
                } else {
                    insert_join_row(conn, join_table, source_key, parent_pk, target_key, id)
                        .await?;
                }
            }
        }
        WriteMode::Replace => {
            let existing = select_join_targets(conn, join_table, source_key, parent_pk, target_key)
                .await?;
            let desired_set: HashSet<String> =
                desired.iter().map(|id| render_scalar(id)).collect();
            for stale in existing
                .iter()
                .filter(|value| !desired_set.contains(&render_scalar(value)))
            {
                delete_join_row_tx(conn, join_table, source_key, parent_pk, target_key, stale)
                    .await?;
            }
            for id in desired {
                insert_join_row(conn, join_table, source_key, parent_pk, target_key, id).await?;
            }
        }
        WriteMode::Append => {
            for id in desired {
                insert_join_row(conn, join_table, source_key, parent_pk, target_key, id).await?;
            }
        }
    }
    Ok(())
}

async fn insert_join_row(
    conn: &mut PgConnection,
    table: &str,
    source_column: &str,
    source_value: &Value,
    target_column: &str,
    target_value: &Value,
) -> AppResult<()> {
    let table = validate_identifier(table)?.to_string();
    let source_column = validate_identifier(source_column)?.to_string();
    let target_column = validate_identifier(target_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query
        .push(&table)
        .push(" (")
        .push(&source_column)
        .push(", ")
        .push(&target_column)
        .push(") VALUES (");
    push_key_bind(&mut query, source_value);
    query.push(", ");
    push_key_bind(&mut query, target_value);
    query.push(") ON CONFLICT DO NOTHING");

    query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

async fn select_join_targets(
    conn: &mut PgConnection,
    table: &str,
    source_column: &str,
    source_value: &Value,
    target_column: &str,
) -> AppResult<Vec<Value>> {
    let table = validate_identifier(table)?.to_string();
    let source_column = validate_identifier(source_column)?.to_string();
    let target_column = validate_identifier(target_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("SELECT ");
    query
        .push(&target_column)
        .push("::text AS target FROM ")
        .push(&table)
        .push(" WHERE ")
        .push(&source_column)
        .push("::text = ")
        .push_bind(render_scalar(source_value));

    let rows = query
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("target").ok())
        .map(Value::String)
        .collect())
}

/// Join keys are uuid columns in generated join tables, but keys of int-pk
/// entities bind as integers.
fn push_key_bind(query: &mut QueryBuilder<Postgres>, value: &Value) {
    match value {
        Value::String(text) => {
            if let Ok(parsed) = Uuid::parse_str(text.trim()) {
                query.push_bind(parsed);
            } else {
                query.push_bind(text.clone());
            }
        }
        Value::Number(number) => {
            query.push_bind(number.as_i64().unwrap_or_default());
        }
        other => {
            query.push_bind(render_scalar(other));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: Value) -> Vec<ChildItem> {
        parse_items("id", value).unwrap()
    }

    #[test]
    fn parse_items_accepts_object_list_and_single_object() {
        let items = item(json!([{"id": "a", "qty": 1}, {"qty": 2}]));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].pk, Some(json!("a")));
        assert!(!items[0].delete);
        assert_eq!(items[1].pk, None);

        let single = item(json!({"qty": 5}));
        assert_eq!(single.len(), 1);

        assert!(item(json!(null)).is_empty());
        assert!(parse_items("id", json!("nope")).is_err());
        assert!(parse_items("id", json!([42])).is_err());
    }

    #[test]
    fn parse_items_strips_delete_marker() {
        let items = item(json!([{"id": "a", "_delete": true}]));
        assert!(items[0].delete);
        assert!(!items[0].body.contains_key("_delete"));

        // _delete: false is not a delete
        let items = item(json!([{"id": "a", "_delete": false}]));
        assert!(!items[0].delete);
    }

    #[test]
    fn diff_mode_leaves_missing_rows_untouched() {
        let items = item(json!([
            {"qty": 1},
            {"id": "a", "qty": 3},
            {"id": "b", "_delete": true}
        ]));
        let existing = vec![json!("a"), json!("b"), json!("c")];
        let plan = plan_child_ops(WriteMode::Diff, items, &existing);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].0, json!("a"));
        // only the explicit _delete; "c" stays untouched
        assert_eq!(plan.deletes, vec![json!("b")]);
    }

    #[test]
    fn replace_mode_deletes_rows_missing_from_payload() {
        let items = item(json!([{"id": "a", "qty": 3}]));
        let existing = vec![json!("a"), json!("b")];
        let plan = plan_child_ops(WriteMode::Replace, items, &existing);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.deletes, vec![json!("b")]);
    }

    #[test]
    fn append_mode_only_inserts() {
        let items = item(json!([
            {"qty": 1},
            {"id": "a", "qty": 3},
            {"id": "b", "_delete": true}
        ]));
        let existing = vec![json!("x")];
        let plan = plan_child_ops(WriteMode::Append, items, &existing);
        assert_eq!(plan.inserts.len(), 1);
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn join_items_accept_scalars_and_objects() {
        let items = parse_join_items(json!([
            "550e8400-e29b-41d4-a716-446655440000",
            {"id": "tag-2"},
            {"id": "tag-3", "_delete": true}
        ]))
        .unwrap();
        assert_eq!(items.len(), 3);
        assert!(!items[0].1);
        assert!(items[2].1);
        assert!(parse_join_items(json!([{"name": "no-id"}])).is_err());
        assert!(parse_join_items(json!("x")).is_err());
    }
}
