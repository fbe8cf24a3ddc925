use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::auth::require_user;
use crate::error::{AppError, AppResult};
use crate::registry::RegistrySnapshot;
use crate::repository::table_service::{
    count_rows, get_row, list_rows, render_scalar, FilterClause, FilterOp,
};
use crate::schemas::{EntityDef, PermAction, RelationKind};
use crate::services::orchestrator::pk_value;
use crate::services::{expression, orchestrator, permissions};
use crate::state::PlatformState;
use crate::tenancy::AppContext;

const DEFAULT_PER_PAGE: i64 = 25;
const MAX_PER_PAGE: i64 = 100;

pub fn router() -> Router<PlatformState> {
    Router::new()
        .route("/{app}/{entity}", get(list_records))
        .route("/{app}/{entity}", post(create_record))
        .route("/{app}/{entity}/{id}", get(get_record))
        .route("/{app}/{entity}/{id}", put(update_record))
        .route("/{app}/{entity}/{id}", delete(delete_record))
}

async fn list_records(
    State(state): State<PlatformState>,
    Path((app_name, entity_name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let snapshot = app.registry.snapshot();
    let entity = snapshot.entity(&entity_name)?;

    permissions::check(&snapshot, &entity.name, PermAction::Read, &user, None)?;
    let row_filters = permissions::read_filters(&snapshot, &entity.name, &user)?;

    let query = ListQuery::parse(&entity, &params)?;

    let rows = list_rows(
        &app.pool,
        &entity.table,
        &query.filters,
        entity.soft_delete,
        &query.order,
        query.per_page,
        (query.page - 1) * query.per_page,
    )
    .await?;
    let total = count_rows(&app.pool, &entity.table, &query.filters, entity.soft_delete).await?;

    // Row-level read conditions are sandbox expressions; they apply to the
    // fetched page.
    let mut data: Vec<Value> = rows
        .into_iter()
        .filter(|row| {
            row_filters.iter().all(|condition| {
                let ctx = json!({
                    "record": row,
                    "user": {"id": user.id, "email": user.email, "roles": user.roles},
                });
                expression::eval_bool(condition, &ctx).unwrap_or(false)
            })
        })
        .collect();

    if !query.include.is_empty() {
        load_includes(&app, &snapshot, &entity, &query.include, &mut data).await?;
    }

    let total_pages = if total == 0 {
        0
    } else {
        (total + query.per_page - 1) / query.per_page
    };
    Ok(Json(json!({
        "data": data,
        "meta": {
            "page": query.page,
            "per_page": query.per_page,
            "total": total,
            "total_pages": total_pages,
        },
    })))
}

async fn get_record(
    State(state): State<PlatformState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let snapshot = app.registry.snapshot();
    let entity = snapshot.entity(&entity_name)?;

    permissions::check(&snapshot, &entity.name, PermAction::Read, &user, None)?;

    let record = fetch_by_id_or_slug(&app, &entity, &id).await?;

    for condition in permissions::read_filters(&snapshot, &entity.name, &user)? {
        let ctx = json!({
            "record": record,
            "user": {"id": user.id, "email": user.email, "roles": user.roles},
        });
        if !expression::eval_bool(&condition, &ctx).unwrap_or(false) {
            return Err(AppError::NotFound(format!(
                "{entity_name} record not found."
            )));
        }
    }

    let mut data = vec![record];
    let include = parse_include(&params);
    if !include.is_empty() {
        load_includes(&app, &snapshot, &entity, &include, &mut data).await?;
    }
    Ok(Json(json!({ "data": data.remove(0) })))
}

async fn create_record(
    State(state): State<PlatformState>,
    Path((app_name, entity_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let body = as_object(body)?;

    let record = orchestrator::write_record(&app, &entity_name, body, None, &user).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": record }))))
}

async fn update_record(
    State(state): State<PlatformState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;
    let body = as_object(body)?;

    let record = orchestrator::write_record(&app, &entity_name, body, Some(id), &user).await?;
    Ok(Json(json!({ "data": record })))
}

async fn delete_record(
    State(state): State<PlatformState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let app = state.apps.get(&app_name)?;
    let user = require_user(&app, &headers)?;

    orchestrator::delete_record(&app, &entity_name, &id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn as_object(body: Value) -> AppResult<Map<String, Value>> {
    body.as_object()
        .cloned()
        .ok_or_else(|| AppError::BadRequest("Request body must be a JSON object.".to_string()))
}

async fn fetch_by_id_or_slug(
    app: &AppContext,
    entity: &EntityDef,
    id: &str,
) -> AppResult<Value> {
    if let Ok(pk) = pk_value(entity, id) {
        if let Some(record) = get_row(
            &app.pool,
            &entity.table,
            entity.pk_field(),
            &pk,
            entity.soft_delete,
        )
        .await?
        {
            return Ok(record);
        }
    }
    if let Some(slug) = &entity.slug {
        let rows = list_rows(
            &app.pool,
            &entity.table,
            &[FilterClause {
                column: slug.field.clone(),
                op: FilterOp::Eq,
                value: json!(id),
            }],
            entity.soft_delete,
            &[],
            1,
            0,
        )
        .await?;
        if let Some(record) = rows.into_iter().next() {
            return Ok(record);
        }
    }
    Err(AppError::NotFound(format!(
        "{} record not found.",
        entity.name
    )))
}

// ---------------------------------------------------------------------------
// Query grammar: filter[field.op]=value, sort=-a,b, page, per_page, include
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ListQuery {
    filters: Vec<FilterClause>,
    order: Vec<(String, bool)>,
    page: i64,
    per_page: i64,
    include: Vec<String>,
}

impl ListQuery {
    fn parse(entity: &EntityDef, params: &HashMap<String, String>) -> AppResult<Self> {
        let mut query = ListQuery {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            ..Default::default()
        };

        for (key, raw) in params {
            if let Some(inner) = key
                .strip_prefix("filter[")
                .and_then(|rest| rest.strip_suffix(']'))
            {
                let (field, op) = match inner.rsplit_once('.') {
                    Some((field, op_name)) => {
                        let Some(op) = FilterOp::parse(op_name) else {
                            return Err(AppError::BadRequest(format!(
                                "Unknown filter operator '{op_name}'."
                            )));
                        };
                        (field, op)
                    }
                    None => (inner, FilterOp::Eq),
                };
                if entity.field(field).is_none() {
                    return Err(AppError::UnknownField(vec![field.to_string()]));
                }
                let value = match op {
                    FilterOp::In | FilterOp::NotIn => json!(raw
                        .split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .collect::<Vec<_>>()),
                    _ => parse_filter_value(raw),
                };
                query.filters.push(FilterClause {
                    column: field.to_string(),
                    op,
                    value,
                });
                continue;
            }

            match key.as_str() {
                "sort" => {
                    for term in raw.split(',').map(str::trim).filter(|term| !term.is_empty()) {
                        let (field, ascending) = match term.strip_prefix('-') {
                            Some(field) => (field, false),
                            None => (term, true),
                        };
                        if entity.field(field).is_none() {
                            return Err(AppError::UnknownField(vec![field.to_string()]));
                        }
                        query.order.push((field.to_string(), ascending));
                    }
                }
                "page" => {
                    query.page = raw.parse::<i64>().unwrap_or(1).max(1);
                }
                "per_page" => {
                    query.per_page = raw
                        .parse::<i64>()
                        .unwrap_or(DEFAULT_PER_PAGE)
                        .clamp(1, MAX_PER_PAGE);
                }
                "include" => {
                    query.include = raw
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(ToOwned::to_owned)
                        .collect();
                }
                _ => {}
            }
        }

        Ok(query)
    }
}

fn parse_filter_value(raw: &str) -> Value {
    if let Ok(number) = raw.parse::<i64>() {
        return json!(number);
    }
    if let Ok(number) = raw.parse::<f64>() {
        return json!(number);
    }
    match raw {
        "true" => json!(true),
        "false" => json!(false),
        "null" => Value::Null,
        other => json!(other),
    }
}

fn parse_include(params: &HashMap<String, String>) -> Vec<String> {
    params
        .get("include")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Single-level include loader over declared relations: children grouped by
/// the parent key, M2M resolved through the join table.
async fn load_includes(
    app: &AppContext,
    snapshot: &Arc<RegistrySnapshot>,
    entity: &EntityDef,
    include: &[String],
    data: &mut [Value],
) -> AppResult<()> {
    let parent_pks: Vec<Value> = data
        .iter()
        .filter_map(|row| row.get(entity.pk_field()).cloned())
        .collect();
    if parent_pks.is_empty() {
        return Ok(());
    }

    for relation_name in include {
        let Some(relation) = snapshot
            .relations_for(&entity.name)
            .iter()
            .find(|relation| &relation.name == relation_name)
            .cloned()
        else {
            return Err(AppError::UnknownField(vec![relation_name.clone()]));
        };
        let target = snapshot.entity(&relation.target)?;

        if relation.kind == RelationKind::ManyToMany {
            let (Some(join_table), Some(source_key), Some(target_key)) = (
                relation.join_table.as_deref(),
                relation.source_join_key.as_deref(),
                relation.target_join_key.as_deref(),
            ) else {
                continue;
            };
            let join_rows = list_rows(
                &app.pool,
                join_table,
                &[FilterClause {
                    column: source_key.to_string(),
                    op: FilterOp::In,
                    value: json!(parent_pks),
                }],
                false,
                &[],
                1000,
                0,
            )
            .await?;
            let target_ids: Vec<Value> = join_rows
                .iter()
                .filter_map(|row| row.get(target_key).cloned())
                .collect();
            let targets = if target_ids.is_empty() {
                Vec::new()
            } else {
                list_rows(
                    &app.pool,
                    &target.table,
                    &[FilterClause {
                        column: target.pk_field().to_string(),
                        op: FilterOp::In,
                        value: json!(target_ids),
                    }],
                    target.soft_delete,
                    &[],
                    1000,
                    0,
                )
                .await?
            };
            let by_pk: HashMap<String, &Value> = targets
                .iter()
                .filter_map(|row| {
                    row.get(target.pk_field())
                        .map(|pk| (render_scalar(pk), row))
                })
                .collect();

            for row in data.iter_mut() {
                let parent_pk = row.get(entity.pk_field()).map(render_scalar).unwrap_or_default();
                let related: Vec<Value> = join_rows
                    .iter()
                    .filter(|join| {
                        join.get(source_key).map(render_scalar).unwrap_or_default() == parent_pk
                    })
                    .filter_map(|join| join.get(target_key).map(render_scalar))
                    .filter_map(|target_pk| by_pk.get(&target_pk).map(|&value| value.clone()))
                    .collect();
                row[relation_name.as_str()] = json!(related);
            }
        } else {
            let target_key = relation.target_key.as_deref().unwrap_or_default();
            let children = list_rows(
                &app.pool,
                &target.table,
                &[FilterClause {
                    column: target_key.to_string(),
                    op: FilterOp::In,
                    value: json!(parent_pks),
                }],
                target.soft_delete,
                &[],
                1000,
                0,
            )
            .await?;

            for row in data.iter_mut() {
                let parent_pk = row.get(entity.pk_field()).map(render_scalar).unwrap_or_default();
                let related: Vec<Value> = children
                    .iter()
                    .filter(|child| {
                        child.get(target_key).map(render_scalar).unwrap_or_default() == parent_pk
                    })
                    .cloned()
                    .collect();
                if relation.kind == RelationKind::OneToOne {
                    row[relation_name.as_str()] =
                        related.into_iter().next().unwrap_or(Value::Null);
                } else {
                    row[relation_name.as_str()] = json!(related);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> EntityDef {
        serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "status", "type": "string"},
                {"name": "total", "type": "decimal"},
                {"name": "created_at", "type": "timestamp"}
            ]
        }))
        .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn parses_filters_sort_and_pagination() {
        let query = ListQuery::parse(
            &entity(),
            &params(&[
                ("filter[total.gte]", "100"),
                ("filter[status]", "open"),
                ("sort", "-created_at,status"),
                ("page", "3"),
                ("per_page", "10"),
                ("include", "line_items"),
            ]),
        )
        .unwrap();

        assert_eq!(query.filters.len(), 2);
        let total = query
            .filters
            .iter()
            .find(|clause| clause.column == "total")
            .unwrap();
        assert_eq!(total.op, FilterOp::Gte);
        assert_eq!(total.value, json!(100));

        assert_eq!(query.order[0], ("created_at".to_string(), false));
        assert_eq!(query.order[1], ("status".to_string(), true));
        assert_eq!(query.page, 3);
        assert_eq!(query.per_page, 10);
        assert_eq!(query.include, vec!["line_items".to_string()]);
    }

    #[test]
    fn in_filter_splits_csv() {
        let query = ListQuery::parse(
            &entity(),
            &params(&[("filter[status.in]", "open, held")]),
        )
        .unwrap();
        assert_eq!(query.filters[0].op, FilterOp::In);
        assert_eq!(query.filters[0].value, json!(["open", "held"]));
    }

    #[test]
    fn unknown_filter_field_is_422() {
        let result = ListQuery::parse(&entity(), &params(&[("filter[bogus]", "1")]));
        assert!(matches!(result, Err(AppError::UnknownField(_))));
        let result = ListQuery::parse(&entity(), &params(&[("sort", "bogus")]));
        assert!(matches!(result, Err(AppError::UnknownField(_))));
    }

    #[test]
    fn unknown_operator_is_400() {
        let result = ListQuery::parse(&entity(), &params(&[("filter[total.between]", "1")]));
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn per_page_clamped_to_limit() {
        let query =
            ListQuery::parse(&entity(), &params(&[("per_page", "5000"), ("page", "0")])).unwrap();
        assert_eq!(query.per_page, MAX_PER_PAGE);
        assert_eq!(query.page, 1);
    }
}
