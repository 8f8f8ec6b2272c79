//! Read-path planner: URL query → validated plan → SQL + include queries.
//!
//! Every field name is checked against the entity's field set before it
//! reaches SQL. Related records are always loaded with separate queries
//! and stitched in memory, never with JOINs, so combining several
//! includes cannot multiply rows.

use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::{AppError, AppResult};
use crate::metadata::model::{
    ConditionOperator, Entity, PermissionCondition, Relation, RelationKind,
};
use crate::metadata::registry::Snapshot;
use crate::repository::sql::{
    map_db_error, push_typed_any, push_typed_comparison, read_row, read_rows, validate_identifier,
};

pub const DEFAULT_PER_PAGE: i64 = 25;
pub const MAX_PER_PAGE: i64 = 100;

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
    pub fn parse(raw: &str) -> Option<FilterOp> {
        match raw {
            "eq" => Some(FilterOp::Eq),
            "neq" => Some(FilterOp::Neq),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "in" => Some(FilterOp::In),
            "not_in" => Some(FilterOp::NotIn),
            "like" => Some(FilterOp::Like),
            _ => None,
        }
    }

    pub fn from_condition(operator: ConditionOperator) -> FilterOp {
        match operator {
            ConditionOperator::Eq => FilterOp::Eq,
            ConditionOperator::Neq => FilterOp::Neq,
            ConditionOperator::Gt => FilterOp::Gt,
            ConditionOperator::Gte => FilterOp::Gte,
            ConditionOperator::Lt => FilterOp::Lt,
            ConditionOperator::Lte => FilterOp::Lte,
            ConditionOperator::In => FilterOp::In,
            ConditionOperator::NotIn => FilterOp::NotIn,
            ConditionOperator::Like => FilterOp::Like,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn from_permission(condition: &PermissionCondition) -> Filter {
        Filter {
            field: condition.field.clone(),
            op: FilterOp::from_condition(condition.operator),
            value: condition.value.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    pub includes: Vec<String>,
    pub page: i64,
    pub per_page: i64,
}

/// Parse and validate the recognized URL parameters against the entity.
pub fn parse_list_query(
    entity: &Entity,
    snapshot: &Snapshot,
    params: &HashMap<String, String>,
) -> AppResult<ListQuery> {
    let mut query = ListQuery {
        page: 1,
        per_page: DEFAULT_PER_PAGE,
        ..Default::default()
    };

    for (key, raw_value) in params {
        if let Some(filter_key) = key.strip_prefix("filter[").and_then(|k| k.strip_suffix(']')) {
            let (field, op_name) = filter_key.rsplit_once('.').ok_or_else(|| {
                AppError::BadRequest(format!(
                    "Filter '{filter_key}' must use the form filter[field.op]."
                ))
            })?;
            let op = FilterOp::parse(op_name).ok_or_else(|| {
                AppError::BadRequest(format!("Unknown filter operator '{op_name}'."))
            })?;
            require_field(entity, field)?;
            let value = match op {
                FilterOp::In | FilterOp::NotIn => Value::Array(
                    raw_value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(|v| Value::String(v.to_string()))
                        .collect(),
                ),
                _ => Value::String(raw_value.clone()),
            };
            query.filters.push(Filter {
                field: field.to_string(),
                op,
                value,
            });
            continue;
        }

        match key.as_str() {
            "sort" => {
                for part in raw_value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    let (field, descending) = match part.strip_prefix('-') {
                        Some(field) => (field, true),
                        None => (part, false),
                    };
                    require_field(entity, field)?;
                    query.sorts.push(Sort {
                        field: field.to_string(),
                        descending,
                    });
                }
            }
            "page" => {
                query.page = raw_value.parse::<i64>().ok().filter(|p| *p >= 1).ok_or_else(
                    || AppError::BadRequest("page must be a positive integer.".to_string()),
                )?;
            }
            "per_page" => {
                let per_page = raw_value.parse::<i64>().ok().filter(|p| *p >= 1).ok_or_else(
                    || AppError::BadRequest("per_page must be a positive integer.".to_string()),
                )?;
                query.per_page = per_page.min(MAX_PER_PAGE);
            }
            "include" => {
                for name in raw_value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    let relation = snapshot.relation(name).ok_or_else(|| {
                        AppError::BadRequest(format!("Unknown relation '{name}'."))
                    })?;
                    if relation.source != entity.name && relation.target != entity.name {
                        return Err(AppError::BadRequest(format!(
                            "Relation '{name}' does not touch entity '{}'.",
                            entity.name
                        )));
                    }
                    query.includes.push(name.to_string());
                }
            }
            _ => {
                return Err(AppError::BadRequest(format!(
                    "Unrecognized query parameter '{key}'."
                )))
            }
        }
    }

    Ok(query)
}

fn require_field<'e>(entity: &'e Entity, name: &str) -> AppResult<&'e crate::metadata::model::Field> {
    entity.field(name).ok_or_else(|| {
        AppError::UnknownField(format!(
            "Unknown field '{name}' on entity '{}'.",
            entity.name
        ))
    })
}

/// Append `AND ...` clauses for the given filters. Fields must already be
/// known to exist on the entity; this re-checks as a last line of defense.
pub fn push_filters(
    query: &mut QueryBuilder<Postgres>,
    entity: &Entity,
    alias: &str,
    filters: &[Filter],
) -> AppResult<()> {
    for filter in filters {
        let field = require_field(entity, &filter.field)?;
        let column = validate_identifier(&filter.field)?;
        query.push(" AND ");
        match filter.op {
            FilterOp::In | FilterOp::NotIn => {
                let values = match &filter.value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                if values.is_empty() {
                    // IN () matches nothing; NOT IN () matches everything.
                    query.push(if filter.op == FilterOp::In { "false" } else { "true" });
                    continue;
                }
                push_typed_any(
                    query,
                    alias,
                    column,
                    filter.op == FilterOp::NotIn,
                    field.field_type,
                    &values,
                );
            }
            FilterOp::Like => {
                query
                    .push(alias)
                    .push(".")
                    .push(column)
                    .push("::text LIKE ")
                    .push_bind(crate::repository::sql::render_scalar(&filter.value));
            }
            scalar_op => {
                let sql_operator = match scalar_op {
                    FilterOp::Eq => " = ",
                    FilterOp::Neq => " <> ",
                    FilterOp::Gt => " > ",
                    FilterOp::Gte => " >= ",
                    FilterOp::Lt => " < ",
                    FilterOp::Lte => " <= ",
                    _ => unreachable!(),
                };
                push_typed_comparison(
                    query,
                    alias,
                    column,
                    sql_operator,
                    field.field_type,
                    &filter.value,
                );
            }
        }
    }
    Ok(())
}

fn push_soft_delete(query: &mut QueryBuilder<Postgres>, entity: &Entity, alias: &str) {
    if entity.soft_delete {
        query.push(" AND ").push(alias).push(".deleted_at IS NULL");
    }
}

/// Run the projected list query plus its COUNT twin.
/// `injected` carries permission read-filters; they are AND-ed in, never
/// used to reject.
pub async fn run_list(
    pool: &PgPool,
    entity: &Entity,
    list: &ListQuery,
    injected: &[Filter],
) -> AppResult<(Vec<Value>, i64)> {
    let table = validate_identifier(&entity.table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table).push(" t WHERE 1=1");
    push_soft_delete(&mut query, entity, "t");
    push_filters(&mut query, entity, "t", &list.filters)?;
    push_filters(&mut query, entity, "t", injected)?;

    query.push(" ORDER BY ");
    if list.sorts.is_empty() {
        query.push("t.").push(validate_identifier(&entity.primary_key.field)?).push(" ASC");
    } else {
        let mut first = true;
        for sort in &list.sorts {
            if !first {
                query.push(", ");
            }
            first = false;
            query
                .push("t.")
                .push(validate_identifier(&sort.field)?)
                .push(if sort.descending { " DESC" } else { " ASC" });
        }
    }
    query
        .push(" LIMIT ")
        .push_bind(list.per_page)
        .push(" OFFSET ")
        .push_bind((list.page - 1) * list.per_page);

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    let data = read_rows(rows);

    let mut count_query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    count_query.push(table).push(" t WHERE 1=1");
    push_soft_delete(&mut count_query, entity, "t");
    push_filters(&mut count_query, entity, "t", &list.filters)?;
    push_filters(&mut count_query, entity, "t", injected)?;
    let total_row = count_query
        .build()
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    let total: i64 = total_row.try_get("total").unwrap_or(0);

    Ok((data, total))
}

/// Fetch one record by primary key, honoring soft delete and injected
/// permission filters.
pub async fn fetch_one(
    pool: &PgPool,
    entity: &Entity,
    key_field: &str,
    key_value: &Value,
    injected: &[Filter],
) -> AppResult<Option<Value>> {
    let table = validate_identifier(&entity.table)?;
    let field = require_field(entity, key_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table).push(" t WHERE ");
    push_typed_comparison(
        &mut query,
        "t",
        validate_identifier(key_field)?,
        " = ",
        field.field_type,
        key_value,
    );
    push_soft_delete(&mut query, entity, "t");
    push_filters(&mut query, entity, "t", injected)?;
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    Ok(row.as_ref().and_then(read_row))
}

/// Attach included relations to a page of parent rows, one relation at a
/// time, each with its own queries.
pub async fn attach_includes(
    pool: &PgPool,
    snapshot: &Snapshot,
    entity: &Entity,
    rows: &mut [Value],
    includes: &[String],
) -> AppResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    for name in includes {
        let relation = snapshot
            .relation(name)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown relation '{name}'.")))?;
        if relation.source == entity.name {
            attach_forward(pool, snapshot, entity, &relation, rows).await?;
        } else {
            attach_reverse(pool, snapshot, &relation, rows).await?;
        }
    }
    Ok(())
}

async fn attach_forward(
    pool: &PgPool,
    snapshot: &Snapshot,
    entity: &Entity,
    relation: &Relation,
    rows: &mut [Value],
) -> AppResult<()> {
    let target = snapshot.entity(&relation.target).ok_or_else(|| {
        AppError::UnknownEntity(format!("Unknown entity '{}'.", relation.target))
    })?;

    let source_key = relation.source_key.as_str();
    require_field(entity, source_key)?;
    let parent_ids: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(source_key))
        .filter(|v| !v.is_null())
        .cloned()
        .collect();
    if parent_ids.is_empty() {
        return Ok(());
    }

    match relation.kind {
        RelationKind::OneToOne | RelationKind::OneToMany => {
            let target_key = relation.target_key.as_deref().ok_or_else(|| {
                AppError::Internal(format!("Relation '{}' lacks target_key.", relation.name))
            })?;
            let key_field = require_field(&target, target_key)?;

            let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
            query
                .push(validate_identifier(&target.table)?)
                .push(" t WHERE ");
            push_typed_any(
                &mut query,
                "t",
                validate_identifier(target_key)?,
                false,
                key_field.field_type,
                &parent_ids,
            );
            push_soft_delete(&mut query, &target, "t");

            let children = read_rows(query.build().fetch_all(pool).await.map_err(map_db_error)?);

            let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
            for child in children {
                let key = child
                    .get(target_key)
                    .map(crate::repository::sql::render_scalar)
                    .unwrap_or_default();
                grouped.entry(key).or_default().push(child);
            }

            for row in rows.iter_mut() {
                let key = row
                    .get(source_key)
                    .map(crate::repository::sql::render_scalar)
                    .unwrap_or_default();
                let children = grouped.remove(&key).unwrap_or_default();
                let attached = match relation.kind {
                    RelationKind::OneToOne => {
                        children.into_iter().next().unwrap_or(Value::Null)
                    }
                    _ => Value::Array(children),
                };
                if let Some(object) = row.as_object_mut() {
                    object.insert(relation.name.clone(), attached);
                }
            }
        }
        RelationKind::ManyToMany => {
            attach_many_to_many(pool, snapshot, entity, relation, rows, source_key).await?;
        }
    }
    Ok(())
}

async fn attach_many_to_many(
    pool: &PgPool,
    snapshot: &Snapshot,
    entity: &Entity,
    relation: &Relation,
    rows: &mut [Value],
    source_key: &str,
) -> AppResult<()> {
    let target = snapshot.entity(&relation.target).ok_or_else(|| {
        AppError::UnknownEntity(format!("Unknown entity '{}'.", relation.target))
    })?;
    let (Some(join_table), Some(source_join_key), Some(target_join_key)) = (
        relation.join_table.as_deref(),
        relation.source_join_key.as_deref(),
        relation.target_join_key.as_deref(),
    ) else {
        return Err(AppError::Internal(format!(
            "Relation '{}' lacks join metadata.",
            relation.name
        )));
    };

    let parent_ids: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(source_key))
        .filter(|v| !v.is_null())
        .cloned()
        .collect();
    if parent_ids.is_empty() {
        return Ok(());
    }

    // First query: join pairs for this page of parents.
    let mut pair_query = QueryBuilder::<Postgres>::new("SELECT ");
    pair_query
        .push(validate_identifier(source_join_key)?)
        .push("::text AS source_id, ")
        .push(validate_identifier(target_join_key)?)
        .push("::text AS target_id FROM ")
        .push(validate_identifier(join_table)?)
        .push(" j WHERE ");
    let source_key_type = entity
        .field(source_key)
        .map(|field| field.field_type)
        .unwrap_or(entity.primary_key.key_type);
    push_typed_any(
        &mut pair_query,
        "j",
        validate_identifier(source_join_key)?,
        false,
        source_key_type,
        &parent_ids,
    );
    let pair_rows = pair_query
        .build()
        .fetch_all(pool)
        .await
        .map_err(map_db_error)?;

    let mut pairs: Vec<(String, String)> = Vec::with_capacity(pair_rows.len());
    for row in &pair_rows {
        let source_id: String = row.try_get("source_id").unwrap_or_default();
        let target_id: String = row.try_get("target_id").unwrap_or_default();
        pairs.push((source_id, target_id));
    }

    if pairs.is_empty() {
        for row in rows.iter_mut() {
            if let Some(object) = row.as_object_mut() {
                object.insert(relation.name.clone(), Value::Array(vec![]));
            }
        }
        return Ok(());
    }

    // Second query: the target records themselves.
    let target_ids: Vec<Value> = pairs
        .iter()
        .map(|(_, target_id)| Value::String(target_id.clone()))
        .collect();
    let pk_field = require_field(&target, &target.primary_key.field)?;
    let mut target_query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    target_query
        .push(validate_identifier(&target.table)?)
        .push(" t WHERE ");
    push_typed_any(
        &mut target_query,
        "t",
        validate_identifier(&target.primary_key.field)?,
        false,
        pk_field.field_type,
        &target_ids,
    );
    push_soft_delete(&mut target_query, &target, "t");
    let targets = read_rows(
        target_query
            .build()
            .fetch_all(pool)
            .await
            .map_err(map_db_error)?,
    );

    let by_id: HashMap<String, &Value> = targets
        .iter()
        .filter_map(|t| {
            t.get(target.primary_key.field.as_str())
                .map(|id| (crate::repository::sql::render_scalar(id), t))
        })
        .collect();

    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    for (source_id, target_id) in &pairs {
        if let Some(target_row) = by_id.get(target_id.as_str()) {
            grouped
                .entry(source_id.clone())
                .or_default()
                .push((*target_row).clone());
        }
    }

    for row in rows.iter_mut() {
        let key = row
            .get(source_key)
            .map(crate::repository::sql::render_scalar)
            .unwrap_or_default();
        let attached = grouped.remove(&key).unwrap_or_default();
        if let Some(object) = row.as_object_mut() {
            object.insert(relation.name.clone(), Value::Array(attached));
        }
    }
    Ok(())
}

/// Reverse include: parent rows hold the FK; fetch the records it points
/// at and attach each as a single object.
async fn attach_reverse(
    pool: &PgPool,
    snapshot: &Snapshot,
    relation: &Relation,
    rows: &mut [Value],
) -> AppResult<()> {
    if relation.kind == RelationKind::ManyToMany {
        return Err(AppError::BadRequest(format!(
            "Relation '{}' cannot be included from its target side.",
            relation.name
        )));
    }
    let source = snapshot.entity(&relation.source).ok_or_else(|| {
        AppError::UnknownEntity(format!("Unknown entity '{}'.", relation.source))
    })?;
    let target_key = relation.target_key.as_deref().ok_or_else(|| {
        AppError::Internal(format!("Relation '{}' lacks target_key.", relation.name))
    })?;

    let fk_values: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(target_key))
        .filter(|v| !v.is_null())
        .cloned()
        .collect();
    if fk_values.is_empty() {
        return Ok(());
    }

    let source_key_field = require_field(&source, &relation.source_key)?;
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query
        .push(validate_identifier(&source.table)?)
        .push(" t WHERE ");
    push_typed_any(
        &mut query,
        "t",
        validate_identifier(&relation.source_key)?,
        false,
        source_key_field.field_type,
        &fk_values,
    );
    push_soft_delete(&mut query, &source, "t");
    let parents = read_rows(query.build().fetch_all(pool).await.map_err(map_db_error)?);

    let by_key: HashMap<String, &Value> = parents
        .iter()
        .filter_map(|p| {
            p.get(relation.source_key.as_str())
                .map(|key| (crate::repository::sql::render_scalar(key), p))
        })
        .collect();

    for row in rows.iter_mut() {
        let fk = row
            .get(target_key)
            .map(crate::repository::sql::render_scalar)
            .unwrap_or_default();
        let attached = by_key
            .get(fk.as_str())
            .map(|p| (*p).clone())
            .unwrap_or(Value::Null);
        if let Some(object) = row.as_object_mut() {
            object.insert(relation.name.clone(), attached);
        }
    }
    Ok(())
}

/// Build the `{data, meta}` list envelope.
pub fn list_envelope(data: Vec<Value>, page: i64, per_page: i64, total: i64) -> Value {
    serde_json::json!({
        "data": data,
        "meta": {"page": page, "per_page": per_page, "total": total},
    })
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
                {"name": "number", "type": "string"},
                {"name": "status", "type": "string"},
                {"name": "total", "type": "decimal", "precision": 2},
                {"name": "created_at", "type": "timestamp", "auto": "create"},
            ],
        }))
        .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_filters_sorts_and_paging() {
        let entity = entity();
        let snapshot = Snapshot::default();
        let query = parse_list_query(
            &entity,
            &snapshot,
            &params(&[
                ("filter[status.in]", "draft,sent"),
                ("filter[total.gte]", "100"),
                ("sort", "-created_at,number"),
                ("page", "2"),
                ("per_page", "500"),
            ]),
        )
        .unwrap();

        assert_eq!(query.filters.len(), 2);
        let status = query.filters.iter().find(|f| f.field == "status").unwrap();
        assert_eq!(status.op, FilterOp::In);
        assert_eq!(status.value, json!(["draft", "sent"]));
        assert_eq!(query.sorts.len(), 2);
        assert!(query.sorts[0].descending);
        assert_eq!(query.page, 2);
        assert_eq!(query.per_page, MAX_PER_PAGE);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let entity = entity();
        let snapshot = Snapshot::default();
        let error = parse_list_query(
            &entity,
            &snapshot,
            &params(&[("filter[nope.eq]", "x")]),
        )
        .unwrap_err();
        assert!(matches!(error, AppError::UnknownField(_)));

        let error = parse_list_query(&entity, &snapshot, &params(&[("sort", "-secret")]))
            .unwrap_err();
        assert!(matches!(error, AppError::UnknownField(_)));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let entity = entity();
        let snapshot = Snapshot::default();
        assert!(parse_list_query(&entity, &snapshot, &params(&[("limit", "5")])).is_err());
    }

    #[test]
    fn unknown_include_is_rejected() {
        let entity = entity();
        let snapshot = Snapshot::default();
        assert!(
            parse_list_query(&entity, &snapshot, &params(&[("include", "items")])).is_err()
        );
    }

    #[test]
    fn where_clause_contains_soft_delete_and_typed_binds() {
        let entity = entity();
        let filters = vec![
            Filter {
                field: "status".to_string(),
                op: FilterOp::Eq,
                value: json!("draft"),
            },
            Filter {
                field: "total".to_string(),
                op: FilterOp::Gt,
                value: json!("100"),
            },
        ];
        let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
        query.push("invoices").push(" t WHERE 1=1");
        push_soft_delete(&mut query, &entity, "t");
        push_filters(&mut query, &entity, "t", &filters).unwrap();
        let sql = query.sql();
        assert!(sql.contains("t.deleted_at IS NULL"), "sql: {sql}");
        assert!(sql.contains("t.status::text = $1"), "sql: {sql}");
        assert!(sql.contains("t.total > $2"), "sql: {sql}");
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let entity = entity();
        let filters = vec![Filter {
            field: "status".to_string(),
            op: FilterOp::In,
            value: json!([]),
        }];
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filters(&mut query, &entity, "t", &filters).unwrap();
        assert!(query.sql().ends_with(" AND false"));
    }

    #[test]
    fn permission_conditions_become_filters() {
        let condition: PermissionCondition = serde_json::from_value(json!({
            "field": "status",
            "operator": "in",
            "value": ["draft", "sent"],
        }))
        .unwrap();
        let filter = Filter::from_permission(&condition);
        assert_eq!(filter.op, FilterOp::In);
        assert_eq!(filter.value, json!(["draft", "sent"]));
    }

    #[test]
    fn include_validation_accepts_touching_relations() {
        let entity = entity();
        let mut snapshot = Snapshot::default();
        let relation = Relation::parse(&json!({
            "name": "items",
            "type": "one_to_many",
            "source": "invoice",
            "target": "invoice_item",
            "source_key": "id",
            "target_key": "invoice_id",
            "ownership": "source",
        }))
        .unwrap();
        snapshot.insert_relation(relation);

        let query = parse_list_query(&entity, &snapshot, &params(&[("include", "items")]))
            .unwrap();
        assert_eq!(query.includes, vec!["items".to_string()]);
    }
}
