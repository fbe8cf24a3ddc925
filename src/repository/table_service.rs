use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgConnection, Postgres, QueryBuilder, Row};

use crate::error::{map_db_error, AppError};

/// One WHERE clause of a dynamic query.
#[derive(Debug, Clone)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
}

impl FilterOp {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            "not_in" => FilterOp::NotIn,
            "like" => FilterOp::Like,
            _ => return None,
        })
    }
}

pub fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: &[FilterClause],
    soft_delete: bool,
    order: &[(String, bool)],
    limit: i64,
    offset: i64,
) -> Result<Vec<Value>, AppError> {
    let mut query = select_query(table, filters, soft_delete)?;
    push_order(&mut query, order)?;
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: &[FilterClause],
    soft_delete: bool,
) -> Result<i64, AppError> {
    let table_name = validate_identifier(table)?;
    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if soft_delete {
        query.push(" AND t.deleted_at IS NULL");
    }
    for clause in filters {
        push_filter_clause(&mut query, clause)?;
    }
    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    pk_column: &str,
    pk_value: &Value,
    soft_delete: bool,
) -> Result<Option<Value>, AppError> {
    let mut query = select_query(
        table,
        &[FilterClause {
            column: pk_column.to_string(),
            op: FilterOp::Eq,
            value: pk_value.clone(),
        }],
        soft_delete,
    )?;
    query.push(" LIMIT 1");
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    Ok(row.and_then(read_row))
}

pub async fn get_row_tx(
    conn: &mut PgConnection,
    table: &str,
    pk_column: &str,
    pk_value: &Value,
    soft_delete: bool,
) -> Result<Option<Value>, AppError> {
    let mut query = select_query(
        table,
        &[FilterClause {
            column: pk_column.to_string(),
            op: FilterOp::Eq,
            value: pk_value.clone(),
        }],
        soft_delete,
    )?;
    query.push(" LIMIT 1");
    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(row.and_then(read_row))
}

pub async fn list_rows_tx(
    conn: &mut PgConnection,
    table: &str,
    filters: &[FilterClause],
    soft_delete: bool,
    limit: i64,
) -> Result<Vec<Value>, AppError> {
    let mut query = select_query(table, filters, soft_delete)?;
    query.push(" LIMIT ").push_bind(limit.clamp(1, 10_000));
    let rows = query
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

fn select_query<'a>(
    table: &str,
    filters: &[FilterClause],
    soft_delete: bool,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if soft_delete {
        query.push(" AND t.deleted_at IS NULL");
    }
    for clause in filters {
        push_filter_clause(&mut query, clause)?;
    }
    Ok(query)
}

// ---------------------------------------------------------------------------
// Writes (transactional)
// ---------------------------------------------------------------------------

/// INSERT through `jsonb_populate_record` so PostgreSQL resolves column types
/// (uuid, enum, boolean, numeric, timestamptz) from the table definition.
pub async fn insert_row_tx(
    conn: &mut PgConnection,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(&table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(&table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(&table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    row.and_then(read_row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row_tx(
    conn: &mut PgConnection,
    table: &str,
    pk_column: &str,
    pk_value: &Value,
    payload: &Map<String, Value>,
    soft_delete: bool,
) -> Result<Value, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let pk_name = validate_identifier(pk_column)?.to_string();
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(&table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(&table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_comparison(&mut query, &pk_name, " = ", pk_value);
    if soft_delete {
        query.push(" AND t.deleted_at IS NULL");
    }
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    row.and_then(read_row)
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn soft_delete_row_tx(
    conn: &mut PgConnection,
    table: &str,
    pk_column: &str,
    pk_value: &Value,
) -> Result<u64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let pk_name = validate_identifier(pk_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query
        .push(&table_name)
        .push(" t SET deleted_at = now() WHERE ");
    push_scalar_comparison(&mut query, &pk_name, " = ", pk_value);
    query.push(" AND t.deleted_at IS NULL");

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn hard_delete_row_tx(
    conn: &mut PgConnection,
    table: &str,
    pk_column: &str,
    pk_value: &Value,
) -> Result<u64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let pk_name = validate_identifier(pk_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(&table_name).push(" t WHERE ");
    push_scalar_comparison(&mut query, &pk_name, " = ", pk_value);

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

/// NULL out a foreign key on every dependent row (set_null cascade).
pub async fn set_null_tx(
    conn: &mut PgConnection,
    table: &str,
    fk_column: &str,
    fk_value: &Value,
) -> Result<u64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let fk_name = validate_identifier(fk_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query
        .push(&table_name)
        .push(" t SET ")
        .push(&fk_name)
        .push(" = NULL WHERE ");
    push_scalar_comparison(&mut query, &fk_name, " = ", fk_value);

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

/// Delete every row matching one column (join-table detach).
pub async fn delete_where_tx(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    value: &Value,
) -> Result<u64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let column_name = validate_identifier(column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(&table_name).push(" t WHERE ");
    push_scalar_comparison(&mut query, &column_name, " = ", value);

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn delete_join_row_tx(
    conn: &mut PgConnection,
    table: &str,
    source_column: &str,
    source_value: &Value,
    target_column: &str,
    target_value: &Value,
) -> Result<u64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let source_name = validate_identifier(source_column)?.to_string();
    let target_name = validate_identifier(target_column)?.to_string();

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(&table_name).push(" t WHERE ");
    push_scalar_comparison(&mut query, &source_name, " = ", source_value);
    query.push(" AND ");
    push_scalar_comparison(&mut query, &target_name, " = ", target_value);

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn count_rows_tx(
    conn: &mut PgConnection,
    table: &str,
    filters: &[FilterClause],
    soft_delete: bool,
) -> Result<i64, AppError> {
    let table_name = validate_identifier(table)?.to_string();
    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(&table_name).push(" t WHERE 1=1");
    if soft_delete {
        query.push(" AND t.deleted_at IS NULL");
    }
    for clause in filters {
        push_filter_clause(&mut query, clause)?;
    }
    let row = query
        .build()
        .fetch_one(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Clause rendering
// ---------------------------------------------------------------------------

fn push_order(
    query: &mut QueryBuilder<Postgres>,
    order: &[(String, bool)],
) -> Result<(), AppError> {
    if order.is_empty() {
        return Ok(());
    }
    query.push(" ORDER BY ");
    for (index, (column, ascending)) in order.iter().enumerate() {
        if index > 0 {
            query.push(", ");
        }
        query.push("t.").push(validate_identifier(column)?.to_string());
        query.push(if *ascending { " ASC" } else { " DESC" });
    }
    Ok(())
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    clause: &FilterClause,
) -> Result<(), AppError> {
    let column = validate_identifier(&clause.column)?.to_string();

    match clause.op {
        FilterOp::In | FilterOp::NotIn => {
            let items = match &clause.value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            if items.is_empty() {
                // `in []` can never match; `not_in []` always does.
                if clause.op == FilterOp::In {
                    query.push(" AND 1=0");
                }
                return Ok(());
            }
            query.push(" AND ");
            if clause.op == FilterOp::NotIn {
                query.push("NOT (");
            }
            push_array_membership(query, &column, &items);
            if clause.op == FilterOp::NotIn {
                query.push(")");
            }
        }
        FilterOp::Like => {
            query
                .push(" AND t.")
                .push(&column)
                .push("::text ILIKE ")
                .push_bind(render_scalar(&clause.value));
        }
        FilterOp::Eq if clause.value.is_null() => {
            query.push(" AND t.").push(&column).push(" IS NULL");
        }
        FilterOp::Neq if clause.value.is_null() => {
            query.push(" AND t.").push(&column).push(" IS NOT NULL");
        }
        op => {
            let sql_operator = match op {
                FilterOp::Eq => " = ",
                FilterOp::Neq => " <> ",
                FilterOp::Gt => " > ",
                FilterOp::Gte => " >= ",
                FilterOp::Lt => " < ",
                FilterOp::Lte => " <= ",
                _ => unreachable!(),
            };
            query.push(" AND ");
            push_scalar_comparison(query, &column, sql_operator, &clause.value);
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

fn push_scalar_comparison(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    sql_operator: &str,
    value: &Value,
) {
    let filter = infer_scalar_filter(column, value);
    query.push("t.").push(column.to_string());
    match filter {
        ScalarFilter::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text);
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(date);
        }
        ScalarFilter::Timestamp(ts) => {
            query.push(sql_operator).push_bind(ts);
        }
    }
}

fn push_array_membership(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    // Uuid-typed columns need uuid binds; everything else compares as text.
    if is_uuid_identifier(column) {
        let parsed = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if parsed.len() == items.len() {
            query
                .push("t.")
                .push(column.to_string())
                .push(" = ANY(")
                .push_bind(parsed)
                .push(")");
            return;
        }
    }
    let texts = items.iter().map(render_scalar).collect::<Vec<_>>();
    query
        .push("t.")
        .push(column.to_string())
        .push("::text = ANY(")
        .push_bind(texts)
        .push(")");
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => {
            if let Some(as_i64) = number.as_i64() {
                return ScalarFilter::I64(as_i64);
            }
            if let Some(as_f64) = number.as_f64() {
                return ScalarFilter::F64(as_f64);
            }
            ScalarFilter::Text(number.to_string())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(render_scalar(value)),
    }
}

pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id") || normalized.ends_with("_key")
}

fn is_date_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized.ends_with("_date") || normalized.ends_with("_on")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

pub fn is_uuid_formatted(value: &Value) -> bool {
    if let Value::String(text) = value {
        uuid::Uuid::try_parse(text).is_ok()
    } else {
        false
    }
}

fn read_row(row: PgRow) -> Option<Value> {
    row.try_get::<Option<Value>, _>("row").ok().flatten()
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter().filter_map(read_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("line_items").is_ok());
        assert!(validate_identifier("Line").is_err());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("drop table;").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn filter_op_parse() {
        assert_eq!(FilterOp::parse("eq"), Some(FilterOp::Eq));
        assert_eq!(FilterOp::parse("not_in"), Some(FilterOp::NotIn));
        assert_eq!(FilterOp::parse("ilike"), None);
    }

    #[test]
    fn select_applies_soft_delete_and_filters() {
        let clauses = vec![FilterClause {
            column: "status".into(),
            op: FilterOp::Eq,
            value: json!("open"),
        }];
        let query = select_query("orders", &clauses, true).unwrap();
        let sql = query.sql();
        assert!(sql.contains("FROM orders t WHERE 1=1"), "got: {sql}");
        assert!(sql.contains("t.deleted_at IS NULL"), "got: {sql}");
        assert!(sql.contains("t.status::text = "), "got: {sql}");
    }

    #[test]
    fn null_filters_render_is_null() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM t WHERE 1=1");
        push_filter_clause(
            &mut query,
            &FilterClause {
                column: "deleted_at".into(),
                op: FilterOp::Eq,
                value: Value::Null,
            },
        )
        .unwrap();
        assert!(query.sql().contains("t.deleted_at IS NULL"));

        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM t WHERE 1=1");
        push_filter_clause(
            &mut query,
            &FilterClause {
                column: "deleted_at".into(),
                op: FilterOp::Neq,
                value: Value::Null,
            },
        )
        .unwrap();
        assert!(query.sql().contains("t.deleted_at IS NOT NULL"));
    }

    #[test]
    fn empty_in_filter_matches_nothing() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM t WHERE 1=1");
        push_filter_clause(
            &mut query,
            &FilterClause {
                column: "status".into(),
                op: FilterOp::In,
                value: json!([]),
            },
        )
        .unwrap();
        assert!(query.sql().contains("AND 1=0"));
    }

    #[test]
    fn uuid_in_filter_binds_uuid_array() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM t WHERE 1=1");
        push_filter_clause(
            &mut query,
            &FilterClause {
                column: "order_id".into(),
                op: FilterOp::In,
                value: json!(["550e8400-e29b-41d4-a716-446655440000"]),
            },
        )
        .unwrap();
        let sql = query.sql();
        assert!(sql.contains("t.order_id = ANY("), "got: {sql}");
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("qty".to_string(), json!(3));
        payload.insert(
            "order_id".to_string(),
            json!("550e8400-e29b-41d4-a716-446655440000"),
        );

        let mut keys = payload.keys().cloned().collect::<Vec<_>>();
        keys.sort_unstable();

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO line_items (");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push(key.as_str());
            }
        }
        query.push(") SELECT ");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push("r.");
                separated.push_unseparated(key.as_str());
            }
        }
        query.push(" FROM jsonb_populate_record(NULL::line_items, ");
        query.push_bind(Value::Object(payload));
        query.push(") r");

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::line_items"),
            "got: {sql}"
        );
        assert!(sql.contains("SELECT r.order_id, r.qty"), "got: {sql}");
    }

    #[test]
    fn scalar_inference_covers_declared_shapes() {
        assert!(matches!(
            infer_scalar_filter("order_id", &json!("550e8400-e29b-41d4-a716-446655440000")),
            ScalarFilter::Uuid(_)
        ));
        assert!(matches!(
            infer_scalar_filter("created_at", &json!("2026-01-01T00:00:00Z")),
            ScalarFilter::Timestamp(_)
        ));
        assert!(matches!(
            infer_scalar_filter("due_date", &json!("2026-01-01")),
            ScalarFilter::Date(_)
        ));
        assert!(matches!(
            infer_scalar_filter("qty", &json!(3)),
            ScalarFilter::I64(3)
        ));
        assert!(matches!(
            infer_scalar_filter("name", &json!("Ada")),
            ScalarFilter::Text(_)
        ));
    }

    #[test]
    fn uuid_detection() {
        assert!(is_uuid_formatted(&json!(
            "550e8400-e29b-41d4-a716-446655440000"
        )));
        assert!(!is_uuid_formatted(&json!("not-a-uuid")));
        assert!(!is_uuid_formatted(&json!(42)));
    }
}
