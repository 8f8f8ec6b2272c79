//! Low-level SQL helpers shared by the query planner, write pipeline,
//! bootstrap, and migrator.
//!
//! Two rules keep dynamic SQL safe here: every identifier pushed into a
//! statement goes through [`validate_identifier`] (and the caller has
//! already checked it against the entity's field set), and every value
//! goes through a `push_bind`. Table names come only from
//! `entity.table` / `relation.join_table`, which the metadata layer has
//! validated on parse.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::error::AppError;
use crate::metadata::model::{Field, FieldType};

pub fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("Identifier cannot be empty.".to_string()));
    }
    if !trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        return Err(AppError::BadRequest(format!("Invalid identifier '{trimmed}'.")));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::BadRequest(format!("Invalid identifier '{trimmed}'.")));
    }
    Ok(trimmed)
}

/// The small slice of dialect the upper layers depend on. Postgres is the
/// only implementation in practice; the seam keeps DDL and time handling
/// out of the planner and pipeline.
pub trait Dialect: Send + Sync {
    fn now_expr(&self) -> &'static str;
    fn column_type(&self, field: &Field) -> String;
    fn primary_key_column(&self, field_name: &str, key_type: FieldType, generated: bool) -> String;
}

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn now_expr(&self) -> &'static str {
        "now()"
    }

    fn column_type(&self, field: &Field) -> String {
        match field.field_type {
            FieldType::String => "text".to_string(),
            FieldType::Text => "text".to_string(),
            FieldType::Int => "integer".to_string(),
            FieldType::Bigint => "bigint".to_string(),
            FieldType::Float => "double precision".to_string(),
            FieldType::Decimal => {
                let precision = field.precision.unwrap_or(2);
                format!("numeric(18, {precision})")
            }
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Uuid => "uuid".to_string(),
            FieldType::Timestamp => "timestamptz".to_string(),
            FieldType::Date => "date".to_string(),
            FieldType::Json => "jsonb".to_string(),
            // File fields store the `_files` row id.
            FieldType::File => "uuid".to_string(),
        }
    }

    fn primary_key_column(&self, field_name: &str, key_type: FieldType, generated: bool) -> String {
        match (key_type, generated) {
            (FieldType::Uuid, true) => {
                format!("{field_name} uuid PRIMARY KEY DEFAULT gen_random_uuid()")
            }
            (FieldType::Uuid, false) => format!("{field_name} uuid PRIMARY KEY"),
            (FieldType::Int, true) => format!("{field_name} serial PRIMARY KEY"),
            (FieldType::Bigint, true) => format!("{field_name} bigserial PRIMARY KEY"),
            (FieldType::Int, false) => format!("{field_name} integer PRIMARY KEY"),
            (FieldType::Bigint, false) => format!("{field_name} bigint PRIMARY KEY"),
            _ => format!("{field_name} text PRIMARY KEY"),
        }
    }
}

pub fn dialect() -> &'static PostgresDialect {
    &PostgresDialect
}

/// Push `alias.column <op> $n` with a bind typed from the declared field
/// type. Values that fail to parse into the declared type fall back to a
/// text comparison, which Postgres resolves or rejects at execution.
pub fn push_typed_comparison(
    query: &mut QueryBuilder<Postgres>,
    alias: &str,
    column: &str,
    sql_operator: &str,
    field_type: FieldType,
    value: &Value,
) {
    query.push(alias).push(".").push(column);
    match typed_bind(field_type, value) {
        TypedBind::Uuid(id) => {
            query.push(sql_operator).push_bind(id);
        }
        TypedBind::I64(number) => {
            query.push(sql_operator).push_bind(number);
        }
        TypedBind::F64(number) => {
            query.push(sql_operator).push_bind(number);
        }
        TypedBind::Bool(flag) => {
            query.push(sql_operator).push_bind(flag);
        }
        TypedBind::Timestamp(at) => {
            query.push(sql_operator).push_bind(at);
        }
        TypedBind::Date(on) => {
            query.push(sql_operator).push_bind(on);
        }
        TypedBind::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text);
        }
    }
}

/// Push `alias.column = ANY($n)` with an array bind typed from the field.
pub fn push_typed_any(
    query: &mut QueryBuilder<Postgres>,
    alias: &str,
    column: &str,
    negated: bool,
    field_type: FieldType,
    values: &[Value],
) {
    query.push(alias).push(".").push(column);
    let operator = if negated { " <> ALL(" } else { " = ANY(" };

    match field_type {
        FieldType::Uuid | FieldType::File => {
            let parsed: Vec<uuid::Uuid> = values
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
                .collect();
            if parsed.len() == values.len() {
                query.push(operator).push_bind(parsed).push(")");
                return;
            }
        }
        FieldType::Int | FieldType::Bigint => {
            let parsed: Vec<i64> = values.iter().filter_map(coerce_i64).collect();
            if parsed.len() == values.len() {
                query.push(operator).push_bind(parsed).push(")");
                return;
            }
        }
        FieldType::Float | FieldType::Decimal => {
            let parsed: Vec<f64> = values.iter().filter_map(coerce_f64).collect();
            if parsed.len() == values.len() {
                query.push(operator).push_bind(parsed).push(")");
                return;
            }
        }
        _ => {}
    }

    let texts: Vec<String> = values.iter().map(render_scalar).collect();
    query.push("::text").push(operator).push_bind(texts).push(")");
}

/// Push a bare bind (no column reference) typed from the declared field
/// type. Used for VALUES lists, e.g. join-table pair inserts.
pub fn push_typed_value(query: &mut QueryBuilder<Postgres>, field_type: FieldType, value: &Value) {
    match typed_bind(field_type, value) {
        TypedBind::Uuid(id) => {
            query.push_bind(id);
        }
        TypedBind::I64(number) => {
            query.push_bind(number);
        }
        TypedBind::F64(number) => {
            query.push_bind(number);
        }
        TypedBind::Bool(flag) => {
            query.push_bind(flag);
        }
        TypedBind::Timestamp(at) => {
            query.push_bind(at);
        }
        TypedBind::Date(on) => {
            query.push_bind(on);
        }
        TypedBind::Text(text) => {
            query.push_bind(text);
        }
    }
}

enum TypedBind {
    Uuid(uuid::Uuid),
    I64(i64),
    F64(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Text(String),
}

fn typed_bind(field_type: FieldType, value: &Value) -> TypedBind {
    match field_type {
        FieldType::Uuid | FieldType::File => {
            if let Some(text) = value.as_str() {
                if let Ok(id) = uuid::Uuid::parse_str(text.trim()) {
                    return TypedBind::Uuid(id);
                }
            }
            TypedBind::Text(render_scalar(value))
        }
        FieldType::Int | FieldType::Bigint => match coerce_i64(value) {
            Some(number) => TypedBind::I64(number),
            None => TypedBind::Text(render_scalar(value)),
        },
        FieldType::Float | FieldType::Decimal => match coerce_f64(value) {
            Some(number) => TypedBind::F64(number),
            None => TypedBind::Text(render_scalar(value)),
        },
        FieldType::Boolean => match value {
            Value::Bool(flag) => TypedBind::Bool(*flag),
            Value::String(text) => TypedBind::Bool(matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "true" | "t" | "1" | "yes"
            )),
            _ => TypedBind::Text(render_scalar(value)),
        },
        FieldType::Timestamp => {
            if let Some(text) = value.as_str() {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text.trim()) {
                    return TypedBind::Timestamp(parsed.with_timezone(&Utc));
                }
            }
            TypedBind::Text(render_scalar(value))
        }
        FieldType::Date => {
            if let Some(text) = value.as_str() {
                if let Ok(parsed) = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
                    return TypedBind::Date(parsed);
                }
            }
            TypedBind::Text(render_scalar(value))
        }
        FieldType::String | FieldType::Text | FieldType::Json => {
            TypedBind::Text(render_scalar(value))
        }
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
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

/// INSERT a JSON payload through `jsonb_populate_record`, so Postgres
/// resolves column types (uuid, numeric, enum, timestamptz) from the
/// table definition. Returns the inserted row as JSON.
pub async fn insert_json_row<'e, E>(
    executor: E,
    table: &str,
    payload: &serde_json::Map<String, Value>,
) -> Result<Value, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let table = validate_identifier(table)?.to_string();
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table} record: empty payload."
        )));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(&table).push(" (");
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
        .push(&table)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(&table)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.as_ref()
        .and_then(read_row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table} record.")))
}

/// UPDATE a row by key through `jsonb_populate_record`. Returns the
/// updated row, or NotFound when the key matches nothing.
pub async fn update_json_row<'e, E>(
    executor: E,
    table: &str,
    key_column: &str,
    key_type: FieldType,
    key_value: &Value,
    payload: &serde_json::Map<String, Value>,
) -> Result<Value, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let table = validate_identifier(table)?.to_string();
    let key_column = validate_identifier(key_column)?.to_string();
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(&table).push(" t SET ");
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
        .push(&table)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_typed_comparison(&mut query, "t", &key_column, " = ", key_type, key_value);
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.as_ref()
        .and_then(read_row)
        .ok_or_else(|| AppError::NotFound(format!("{table} record not found.")))
}

pub fn read_row(row: &PgRow) -> Option<Value> {
    row.try_get::<Option<Value>, _>("row").ok().flatten()
}

pub fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.iter().filter_map(read_row).collect()
}

pub fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, field_type: FieldType) -> Field {
        serde_json::from_value(json!({
            "name": name,
            "type": serde_json::to_value(field_type).unwrap(),
            "precision": 2,
        }))
        .unwrap()
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("status").is_ok());
        assert!(validate_identifier("a1_b2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("drop table; --").is_err());
        assert!(validate_identifier("Status").is_err());
    }

    #[test]
    fn column_types_for_ddl() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.column_type(&field("a", FieldType::String)), "text");
        assert_eq!(
            dialect.column_type(&field("a", FieldType::Decimal)),
            "numeric(18, 2)"
        );
        assert_eq!(dialect.column_type(&field("a", FieldType::File)), "uuid");
        assert_eq!(
            dialect.primary_key_column("id", FieldType::Uuid, true),
            "id uuid PRIMARY KEY DEFAULT gen_random_uuid()"
        );
        assert_eq!(
            dialect.primary_key_column("id", FieldType::Bigint, true),
            "id bigserial PRIMARY KEY"
        );
    }

    #[test]
    fn typed_comparison_binds_by_declared_type() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_typed_comparison(
            &mut query,
            "t",
            "total",
            " > ",
            FieldType::Decimal,
            &json!("100.5"),
        );
        assert_eq!(query.sql(), "SELECT 1 WHERE t.total > $1");

        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_typed_comparison(
            &mut query,
            "t",
            "status",
            " = ",
            FieldType::String,
            &json!("draft"),
        );
        assert_eq!(query.sql(), "SELECT 1 WHERE t.status::text = $1");
    }

    #[test]
    fn any_filter_falls_back_to_text_on_mixed_values() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_typed_any(
            &mut query,
            "t",
            "id",
            false,
            FieldType::Uuid,
            &[json!("550e8400-e29b-41d4-a716-446655440000"), json!("oops")],
        );
        assert_eq!(query.sql(), "SELECT 1 WHERE t.id::text = ANY($1)");
    }

    #[test]
    fn not_in_uses_all() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_typed_any(
            &mut query,
            "t",
            "status",
            true,
            FieldType::String,
            &[json!("void"), json!("draft")],
        );
        assert_eq!(query.sql(), "SELECT 1 WHERE t.status::text <> ALL($1)");
    }
}
