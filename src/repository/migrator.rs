//! Additive schema migration for business tables.
//!
//! The migrator only ever creates: tables for new entities, missing
//! columns, unique indexes, soft-delete columns and their partial
//! indexes, and join tables for many-to-many relations. It never drops
//! anything, and it refuses type changes that could lose data.

use std::collections::HashMap;

use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::metadata::model::{Entity, Field, FieldType, Relation};
use crate::repository::sql::{dialect, validate_identifier, Dialect};

/// Bring `entity.table` in line with the entity definition.
pub async fn migrate_entity(pool: &PgPool, entity: &Entity) -> AppResult<()> {
    let table = validate_identifier(&entity.table)?;
    let existing = table_columns(pool, table).await?;

    if existing.is_empty() {
        create_table(pool, entity).await?;
    } else {
        add_missing_columns(pool, entity, &existing).await?;
    }

    ensure_unique_indexes(pool, entity).await?;
    if entity.soft_delete {
        ensure_soft_delete(pool, entity, &existing).await?;
    }

    Ok(())
}

/// Create the join table for a many-to-many relation. Key column types
/// follow the primary keys of the two endpoint entities.
pub async fn migrate_join_table(
    pool: &PgPool,
    relation: &Relation,
    source: &Entity,
    target: &Entity,
) -> AppResult<()> {
    let (Some(join_table), Some(source_key), Some(target_key)) = (
        relation.join_table.as_deref(),
        relation.source_join_key.as_deref(),
        relation.target_join_key.as_deref(),
    ) else {
        return Err(AppError::BadRequest(format!(
            "Relation '{}' is not many-to-many.",
            relation.name
        )));
    };

    let join_table = validate_identifier(join_table)?;
    let source_key = validate_identifier(source_key)?;
    let target_key = validate_identifier(target_key)?;

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {join_table} (
            {source_key} {source_type} NOT NULL,
            {target_key} {target_type} NOT NULL,
            PRIMARY KEY ({source_key}, {target_key})
        )",
        source_type = key_column_type(source),
        target_type = key_column_type(target),
    );
    sqlx::query(&ddl).execute(pool).await.map_err(|error| {
        tracing::error!(error = %error, join_table, "Join table migration failed");
        AppError::Dependency("Join table migration failed.".to_string())
    })?;
    Ok(())
}

fn key_column_type(entity: &Entity) -> &'static str {
    match entity.primary_key.key_type {
        FieldType::Int => "integer",
        FieldType::Bigint => "bigint",
        FieldType::Uuid => "uuid",
        _ => "text",
    }
}

async fn table_columns(pool: &PgPool, table: &str) -> AppResult<HashMap<String, String>> {
    let rows = sqlx::query(
        "SELECT column_name, data_type
         FROM information_schema.columns
         WHERE table_name = $1 AND table_schema = current_schema()",
    )
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|error| {
        tracing::error!(error = %error, table, "Failed to read information_schema");
        AppError::Dependency("Failed to inspect table columns.".to_string())
    })?;

    let mut columns = HashMap::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("column_name").unwrap_or_default();
        let data_type: String = row.try_get("data_type").unwrap_or_default();
        columns.insert(name, data_type.to_ascii_lowercase());
    }
    Ok(columns)
}

async fn create_table(pool: &PgPool, entity: &Entity) -> AppResult<()> {
    let table = validate_identifier(&entity.table)?;
    let pk = &entity.primary_key;
    let mut columns = vec![dialect().primary_key_column(
        validate_identifier(&pk.field)?,
        pk.key_type,
        pk.generated,
    )];

    for field in &entity.fields {
        if field.name == pk.field {
            continue;
        }
        columns.push(column_ddl(field)?);
    }
    if entity.soft_delete {
        columns.push("deleted_at timestamptz".to_string());
    }

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
        columns.join(",\n    ")
    );
    sqlx::query(&ddl).execute(pool).await.map_err(|error| {
        tracing::error!(error = %error, table, "Table creation failed");
        AppError::Dependency("Table creation failed.".to_string())
    })?;

    tracing::info!(table, entity = %entity.name, "Created table");
    Ok(())
}

async fn add_missing_columns(
    pool: &PgPool,
    entity: &Entity,
    existing: &HashMap<String, String>,
) -> AppResult<()> {
    let table = validate_identifier(&entity.table)?;

    for field in &entity.fields {
        match existing.get(field.name.as_str()) {
            None => {
                let ddl = format!(
                    "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {}",
                    column_ddl(field)?
                );
                sqlx::query(&ddl).execute(pool).await.map_err(|error| {
                    tracing::error!(error = %error, table, column = %field.name, "Column migration failed");
                    AppError::Dependency("Column migration failed.".to_string())
                })?;
                tracing::info!(table, column = %field.name, "Added column");
            }
            Some(current_type) => {
                check_type_compatible(entity, field, current_type)?;
            }
        }
    }
    Ok(())
}

/// Existing columns keep their type. Declared changes are only accepted
/// when they cannot lose data; everything else is refused.
fn check_type_compatible(entity: &Entity, field: &Field, current_type: &str) -> AppResult<()> {
    let desired = declared_data_type(field);
    if desired == current_type {
        return Ok(());
    }
    let widening = matches!(
        (current_type, desired),
        ("integer", "bigint")
            | ("integer", "numeric")
            | ("bigint", "numeric")
            | ("double precision", "numeric")
            | ("character varying", "text")
    );
    if widening {
        return Ok(());
    }
    Err(AppError::Conflict(format!(
        "Refusing type change for {}.{}: {} -> {}.",
        entity.table, field.name, current_type, desired
    )))
}

/// The `data_type` value information_schema reports for a declared field.
fn declared_data_type(field: &Field) -> &'static str {
    match field.field_type {
        FieldType::String | FieldType::Text => "text",
        FieldType::Int => "integer",
        FieldType::Bigint => "bigint",
        FieldType::Float => "double precision",
        FieldType::Decimal => "numeric",
        FieldType::Boolean => "boolean",
        FieldType::Uuid | FieldType::File => "uuid",
        FieldType::Timestamp => "timestamp with time zone",
        FieldType::Date => "date",
        FieldType::Json => "jsonb",
    }
}

fn column_ddl(field: &Field) -> AppResult<String> {
    let name = validate_identifier(&field.name)?;
    let mut ddl = format!("{name} {}", dialect().column_type(field));
    if field.required && !field.nullable {
        // NOT NULL only on creation; existing rows may hold nulls.
        ddl.push_str(" NOT NULL");
    }
    Ok(ddl)
}

async fn ensure_unique_indexes(pool: &PgPool, entity: &Entity) -> AppResult<()> {
    let table = validate_identifier(&entity.table)?;
    for field in entity.fields.iter().filter(|f| f.unique) {
        let column = validate_identifier(&field.name)?;
        let predicate = if entity.soft_delete {
            " WHERE deleted_at IS NULL"
        } else {
            ""
        };
        let ddl = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_{column}_uq ON {table} ({column}){predicate}"
        );
        sqlx::query(&ddl).execute(pool).await.map_err(|error| {
            tracing::error!(error = %error, table, column, "Unique index migration failed");
            AppError::Dependency("Unique index migration failed.".to_string())
        })?;
    }
    Ok(())
}

async fn ensure_soft_delete(
    pool: &PgPool,
    entity: &Entity,
    existing: &HashMap<String, String>,
) -> AppResult<()> {
    let table = validate_identifier(&entity.table)?;
    if !existing.is_empty() && !existing.contains_key("deleted_at") {
        let ddl = format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS deleted_at timestamptz");
        sqlx::query(&ddl).execute(pool).await.map_err(|error| {
            tracing::error!(error = %error, table, "Soft-delete column migration failed");
            AppError::Dependency("Soft-delete column migration failed.".to_string())
        })?;
    }
    let index = format!(
        "CREATE INDEX IF NOT EXISTS {table}_deleted_at_idx ON {table} (deleted_at) WHERE deleted_at IS NOT NULL"
    );
    sqlx::query(&index).execute(pool).await.map_err(|error| {
        tracing::error!(error = %error, table, "Soft-delete index migration failed");
        AppError::Dependency("Soft-delete index migration failed.".to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> Entity {
        Entity::parse(&json!({
            "name": "invoice",
            "table": "invoices",
            "primary_key": {"field": "id", "type": "uuid", "generated": true},
            "soft_delete": true,
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "number", "type": "string", "required": true, "nullable": false, "unique": true},
                {"name": "total", "type": "decimal", "precision": 2},
            ],
        }))
        .unwrap()
    }

    #[test]
    fn column_ddl_includes_not_null_only_when_required() {
        let entity = entity();
        let number = entity.field("number").unwrap();
        assert_eq!(column_ddl(number).unwrap(), "number text NOT NULL");
        let total = entity.field("total").unwrap();
        assert_eq!(column_ddl(total).unwrap(), "total numeric(18, 2)");
    }

    #[test]
    fn narrowing_is_refused_widening_is_allowed() {
        let entity = entity();
        let total = entity.field("total").unwrap();
        assert!(check_type_compatible(&entity, total, "numeric").is_ok());
        assert!(check_type_compatible(&entity, total, "integer").is_ok());
        assert!(check_type_compatible(&entity, total, "text").is_err());

        let number = entity.field("number").unwrap();
        assert!(check_type_compatible(&entity, number, "text").is_ok());
        assert!(check_type_compatible(&entity, number, "integer").is_err());
    }

    #[test]
    fn join_key_types_follow_entity_pks() {
        let entity = entity();
        assert_eq!(key_column_type(&entity), "uuid");
    }
}
