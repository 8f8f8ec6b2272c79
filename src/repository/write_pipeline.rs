//! Transactional write pipeline: validation → rules → state machines →
//! parent SQL → nested child writes → sync webhooks → audit → commit.
//!
//! Planning never touches SQL beyond read-only lookups; execution runs
//! entirely inside one transaction, so a failure at any depth rolls the
//! whole write back. Child collections are written with the diff /
//! replace / append semantics declared on the relation (or overridden
//! per request with `_write_mode`), and each child row passes through
//! the same planner recursively with the parent key injected as its FK.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use crate::repository::sql::Dialect;

use crate::error::{AppError, AppResult, ValidationDetail};
use crate::metadata::model::{
    AutoMode, Entity, Field, FieldType, HookKind, OnDelete, Relation, RelationKind, RuleHook,
    UserContext, WriteMode,
};
use crate::metadata::registry::Snapshot;
use crate::repository::query_planner::fetch_one;
use crate::repository::sql::{
    dialect, insert_json_row, map_db_error, push_typed_comparison, push_typed_value, read_rows,
    update_json_row, validate_identifier,
};
use crate::services::audit;
use crate::services::rules::run_rules;
use crate::services::state_machine::{
    apply_state_machines, AppliedTransition, DeferredAction, TransitionOutcome,
};
use crate::services::webhooks::{fire_sync_hooks, DeliveryConfig};

pub struct WriteContext<'a> {
    pub pool: &'a PgPool,
    pub snapshot: &'a Snapshot,
    pub webhooks: &'a DeliveryConfig,
}

#[derive(Debug, Clone)]
pub struct RelationWrite {
    pub relation: Arc<Relation>,
    pub mode: WriteMode,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug)]
pub struct WritePlan {
    pub fields: Map<String, Value>,
    pub relation_writes: Vec<RelationWrite>,
    pub machine_outcome: TransitionOutcome,
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub record: Value,
    pub old: Option<Value>,
    pub transitions: Vec<AppliedTransition>,
    pub deferred: Vec<DeferredAction>,
}

/// Plan a write without executing any mutation. Splits relation payloads
/// from parent fields, validates field values, runs the rule engine, and
/// applies state machines to the pending field map.
pub async fn plan_write(
    ctx: &WriteContext<'_>,
    entity: &Entity,
    user: &UserContext,
    action: &str,
    payload: Map<String, Value>,
    old: Option<&Value>,
) -> AppResult<WritePlan> {
    let (mut fields, relation_writes) = split_payload(ctx.snapshot, entity, action, payload)?;

    let mut details = validate_fields(ctx.pool, entity, action, &mut fields).await?;
    if !details.is_empty() {
        return Err(AppError::Validation(details));
    }

    details = run_rules(
        ctx.pool,
        ctx.snapshot,
        entity,
        RuleHook::BeforeWrite,
        &mut fields,
        old,
        action,
        user,
    )
    .await?;
    if !details.is_empty() {
        return Err(AppError::Validation(details));
    }

    let machine_outcome =
        apply_state_machines(ctx.snapshot, entity, &mut fields, old, action, user)?;

    Ok(WritePlan {
        fields,
        relation_writes,
        machine_outcome,
    })
}

/// Separate parent fields from relation writes. Unknown top-level keys
/// are rejected; auto-managed fields are silently dropped.
fn split_payload(
    snapshot: &Snapshot,
    entity: &Entity,
    action: &str,
    payload: Map<String, Value>,
) -> AppResult<(Map<String, Value>, Vec<RelationWrite>)> {
    let mut fields = Map::new();
    let mut relation_writes = Vec::new();

    for (key, value) in payload {
        if let Some(relation) = snapshot.relation(&key) {
            if relation.source == entity.name {
                relation_writes.push(parse_relation_write(relation, &key, value)?);
                continue;
            }
        }
        if key == "_write_mode" || key == "_delete" {
            // Row-level markers consumed by the parent collection writer.
            continue;
        }
        let Some(field) = entity.field(&key) else {
            return Err(AppError::BadRequest(format!(
                "Unknown key '{key}' for entity '{}'.",
                entity.name
            )));
        };
        if field.auto.is_some() {
            continue;
        }
        if action == "update" && key == entity.primary_key.field {
            continue;
        }
        fields.insert(key, value);
    }

    Ok((fields, relation_writes))
}

fn parse_relation_write(
    relation: Arc<Relation>,
    key: &str,
    value: Value,
) -> AppResult<RelationWrite> {
    let Value::Object(mut body) = value else {
        return Err(AppError::BadRequest(format!(
            "Relation '{key}' expects an object with a 'data' array."
        )));
    };

    let mode = match body.remove("_write_mode") {
        Some(Value::String(raw)) => WriteMode::parse(&raw).ok_or_else(|| {
            AppError::BadRequest(format!("Unknown _write_mode '{raw}' on relation '{key}'."))
        })?,
        Some(_) => {
            return Err(AppError::BadRequest(format!(
                "_write_mode on relation '{key}' must be a string."
            )))
        }
        None => relation.write_mode,
    };

    let rows = match body.remove("data") {
        Some(Value::Array(items)) => {
            let mut rows = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(map) => rows.push(map),
                    _ => {
                        return Err(AppError::BadRequest(format!(
                            "Relation '{key}' row {index} must be an object."
                        )))
                    }
                }
            }
            rows
        }
        Some(_) => {
            return Err(AppError::BadRequest(format!(
                "Relation '{key}' expects 'data' to be an array."
            )))
        }
        None => Vec::new(),
    };

    Ok(RelationWrite {
        relation,
        mode,
        rows,
    })
}

/// Field-level validation: defaults, required, enum membership, scalar
/// shape, and `_files` resolution for file fields.
async fn validate_fields(
    pool: &PgPool,
    entity: &Entity,
    action: &str,
    fields: &mut Map<String, Value>,
) -> AppResult<Vec<ValidationDetail>> {
    let mut details = Vec::new();

    if action == "create" {
        for field in &entity.fields {
            if fields.contains_key(&field.name) || field.auto.is_some() {
                continue;
            }
            if let Some(default) = &field.default {
                fields.insert(field.name.clone(), default.clone());
                continue;
            }
            let generated_pk = field.name == entity.primary_key.field && entity.primary_key.generated;
            if field.required && !generated_pk {
                details.push(ValidationDetail::field(
                    &field.name,
                    "required",
                    format!("Field '{}' is required.", field.name),
                ));
            }
        }
    }

    let mut file_refs: Vec<(String, String)> = Vec::new();
    for (name, value) in fields.iter() {
        let Some(field) = entity.field(name) else {
            continue;
        };
        if value.is_null() {
            if field.required && !field.nullable {
                details.push(ValidationDetail::field(
                    name,
                    "required",
                    format!("Field '{name}' must not be null."),
                ));
            }
            continue;
        }
        if let Some(enum_values) = &field.enum_values {
            if !enum_values.contains(value) {
                details.push(ValidationDetail::field(
                    name,
                    "enum",
                    format!("Field '{name}' must be one of the declared values."),
                ));
                continue;
            }
        }
        if let Err(message) = check_scalar_shape(field, value) {
            details.push(ValidationDetail::field(name, "type", message));
            continue;
        }
        if field.field_type == FieldType::File {
            if let Some(id) = value.as_str() {
                file_refs.push((name.clone(), id.to_string()));
            }
        }
    }

    for (name, file_id) in file_refs {
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1::bigint FROM _files WHERE id = $1::uuid")
                .bind(&file_id)
                .fetch_optional(pool)
                .await
                .map_err(map_db_error)?;
        if found.is_none() {
            details.push(ValidationDetail::field(
                &name,
                "file",
                format!("File '{file_id}' does not exist."),
            ));
        }
    }

    Ok(details)
}

fn check_scalar_shape(field: &Field, value: &Value) -> Result<(), String> {
    let ok = match field.field_type {
        FieldType::String | FieldType::Text => value.is_string(),
        FieldType::Int | FieldType::Bigint => value.as_i64().is_some(),
        FieldType::Float | FieldType::Decimal => value.as_f64().is_some(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Uuid | FieldType::File => value
            .as_str()
            .is_some_and(|text| uuid::Uuid::parse_str(text.trim()).is_ok()),
        FieldType::Timestamp => value
            .as_str()
            .is_some_and(|text| chrono::DateTime::parse_from_rfc3339(text.trim()).is_ok()),
        FieldType::Date => value
            .as_str()
            .is_some_and(|text| chrono::NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").is_ok()),
        FieldType::Json => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "Field '{}' has the wrong type for {:?}.",
            field.name, field.field_type
        ))
    }
}

fn stamp_auto_fields(entity: &Entity, action: &str, fields: &mut Map<String, Value>) {
    let now = Utc::now().to_rfc3339();
    for field in entity.auto_fields() {
        match field.auto {
            Some(AutoMode::Create) if action == "create" => {
                fields.insert(field.name.clone(), Value::String(now.clone()));
            }
            Some(AutoMode::Update) => {
                fields.insert(field.name.clone(), Value::String(now.clone()));
            }
            _ => {}
        }
    }
}

/// Create a record and its nested children in one transaction.
pub async fn run_create(
    ctx: &WriteContext<'_>,
    entity: &Entity,
    user: &UserContext,
    payload: Map<String, Value>,
) -> AppResult<WriteOutcome> {
    let mut plan = plan_write(ctx, entity, user, "create", payload, None).await?;
    stamp_auto_fields(entity, "create", &mut plan.fields);

    let mut tx = ctx.pool.begin().await.map_err(map_db_error)?;
    let record = insert_json_row(&mut *tx, &entity.table, &plan.fields).await?;

    execute_machine_creates(&mut *tx, ctx, &plan.machine_outcome).await?;
    execute_relation_writes(&mut *tx, ctx, entity, user, &record, &plan.relation_writes).await?;

    fire_sync_hooks(
        &mut *tx,
        ctx.webhooks,
        ctx.snapshot,
        &entity.name,
        HookKind::BeforeWrite,
        "create",
        &record,
        None,
        user,
    )
    .await?;

    let record_id = record
        .get(entity.primary_key.field.as_str())
        .map(crate::repository::sql::render_scalar)
        .unwrap_or_default();
    audit::record(&mut *tx, &entity.name, &record_id, "create", user, None, Some(&record)).await?;
    tx.commit().await.map_err(map_db_error)?;

    Ok(WriteOutcome {
        record,
        old: None,
        transitions: plan.machine_outcome.transitions,
        deferred: plan.machine_outcome.deferred,
    })
}

/// Update a record (previously fetched as `old`) and its children.
pub async fn run_update(
    ctx: &WriteContext<'_>,
    entity: &Entity,
    user: &UserContext,
    old: Value,
    payload: Map<String, Value>,
) -> AppResult<WriteOutcome> {
    let mut plan = plan_write(ctx, entity, user, "update", payload, Some(&old)).await?;
    stamp_auto_fields(entity, "update", &mut plan.fields);

    let pk_field = entity.primary_key.field.as_str();
    let pk_value = old
        .get(pk_field)
        .cloned()
        .ok_or_else(|| AppError::Internal("Existing record has no primary key.".to_string()))?;

    let mut tx = ctx.pool.begin().await.map_err(map_db_error)?;

    let record = if plan.fields.is_empty() {
        old.clone()
    } else {
        update_json_row(
            &mut *tx,
            &entity.table,
            pk_field,
            entity.primary_key.key_type,
            &pk_value,
            &plan.fields,
        )
        .await?
    };

    execute_machine_creates(&mut *tx, ctx, &plan.machine_outcome).await?;
    execute_relation_writes(&mut *tx, ctx, entity, user, &record, &plan.relation_writes).await?;

    fire_sync_hooks(
        &mut *tx,
        ctx.webhooks,
        ctx.snapshot,
        &entity.name,
        HookKind::BeforeWrite,
        "update",
        &record,
        Some(&old),
        user,
    )
    .await?;

    let record_id = crate::repository::sql::render_scalar(&pk_value);
    audit::record(
        &mut *tx,
        &entity.name,
        &record_id,
        "update",
        user,
        Some(&old),
        Some(&record),
    )
    .await?;
    tx.commit().await.map_err(map_db_error)?;

    Ok(WriteOutcome {
        record,
        old: Some(old),
        transitions: plan.machine_outcome.transitions,
        deferred: plan.machine_outcome.deferred,
    })
}

/// Delete a record: before_delete rules, relation on_delete handling,
/// sync webhooks, soft or hard delete, audit, commit.
pub async fn run_delete(
    ctx: &WriteContext<'_>,
    entity: &Entity,
    user: &UserContext,
    old: Value,
) -> AppResult<WriteOutcome> {
    let mut no_fields = Map::new();
    let details = run_rules(
        ctx.pool,
        ctx.snapshot,
        entity,
        RuleHook::BeforeDelete,
        &mut no_fields,
        Some(&old),
        "delete",
        user,
    )
    .await?;
    if !details.is_empty() {
        return Err(AppError::Validation(details));
    }

    let pk_field = entity.primary_key.field.as_str();
    let pk_value = old
        .get(pk_field)
        .cloned()
        .ok_or_else(|| AppError::Internal("Existing record has no primary key.".to_string()))?;

    let mut tx = ctx.pool.begin().await.map_err(map_db_error)?;

    fire_sync_hooks(
        &mut *tx,
        ctx.webhooks,
        ctx.snapshot,
        &entity.name,
        HookKind::BeforeDelete,
        "delete",
        &old,
        Some(&old),
        user,
    )
    .await?;

    apply_on_delete(&mut *tx, ctx, entity, &old).await?;

    let table = validate_identifier(&entity.table)?;
    let mut query = if entity.soft_delete {
        let mut q = QueryBuilder::<Postgres>::new("UPDATE ");
        q.push(table)
            .push(" t SET deleted_at = ")
            .push(dialect().now_expr())
            .push(" WHERE ");
        q
    } else {
        let mut q = QueryBuilder::<Postgres>::new("DELETE FROM ");
        q.push(table).push(" t WHERE ");
        q
    };
    push_typed_comparison(
        &mut query,
        "t",
        validate_identifier(pk_field)?,
        " = ",
        entity.primary_key.key_type,
        &pk_value,
    );
    query
        .build()
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

    let record_id = crate::repository::sql::render_scalar(&pk_value);
    audit::record(&mut *tx, &entity.name, &record_id, "delete", user, Some(&old), None).await?;
    tx.commit().await.map_err(map_db_error)?;

    Ok(WriteOutcome {
        record: old.clone(),
        old: Some(old),
        transitions: Vec::new(),
        deferred: Vec::new(),
    })
}

/// Enforce the declared on_delete behavior of each owned relation.
async fn apply_on_delete(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    entity: &Entity,
    record: &Value,
) -> AppResult<()> {
    for relation in ctx.snapshot.relations_of(&entity.name) {
        let Some(parent_key) = record.get(relation.source_key.as_str()).filter(|v| !v.is_null())
        else {
            continue;
        };

        match relation.kind {
            RelationKind::ManyToMany => {
                // Join rows carry no business data; detach always.
                let (Some(join_table), Some(source_join_key)) =
                    (relation.join_table.as_deref(), relation.source_join_key.as_deref())
                else {
                    continue;
                };
                let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
                query
                    .push(validate_identifier(join_table)?)
                    .push(" j WHERE ");
                push_typed_comparison(
                    &mut query,
                    "j",
                    validate_identifier(source_join_key)?,
                    " = ",
                    entity.primary_key.key_type,
                    parent_key,
                );
                query.build().execute(&mut *tx).await.map_err(map_db_error)?;
            }
            RelationKind::OneToOne | RelationKind::OneToMany => {
                let Some(target) = ctx.snapshot.entity(&relation.target) else {
                    continue;
                };
                let Some(target_key) = relation.target_key.as_deref() else {
                    continue;
                };
                let target_table = validate_identifier(&target.table)?.to_string();
                let fk_type = target
                    .field(target_key)
                    .map(|f| f.field_type)
                    .unwrap_or(FieldType::Uuid);

                match relation.on_delete {
                    OnDelete::Restrict => {
                        let mut query =
                            QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
                        query.push(&target_table).push(" t WHERE ");
                        push_typed_comparison(
                            &mut query,
                            "t",
                            validate_identifier(target_key)?,
                            " = ",
                            fk_type,
                            parent_key,
                        );
                        if target.soft_delete {
                            query.push(" AND t.deleted_at IS NULL");
                        }
                        let row = query.build().fetch_one(&mut *tx).await.map_err(map_db_error)?;
                        let total: i64 = sqlx::Row::try_get(&row, "total").unwrap_or(0);
                        if total > 0 {
                            return Err(AppError::Conflict(format!(
                                "Cannot delete: {total} related '{}' record(s) exist.",
                                relation.target
                            )));
                        }
                    }
                    OnDelete::Cascade => {
                        let mut query = if target.soft_delete {
                            let mut q = QueryBuilder::<Postgres>::new("UPDATE ");
                            q.push(&target_table)
                                .push(" t SET deleted_at = ")
                                .push(dialect().now_expr())
                                .push(" WHERE ");
                            q
                        } else {
                            let mut q = QueryBuilder::<Postgres>::new("DELETE FROM ");
                            q.push(&target_table).push(" t WHERE ");
                            q
                        };
                        push_typed_comparison(
                            &mut query,
                            "t",
                            validate_identifier(target_key)?,
                            " = ",
                            fk_type,
                            parent_key,
                        );
                        query.build().execute(&mut *tx).await.map_err(map_db_error)?;
                    }
                    OnDelete::SetNull | OnDelete::Detach => {
                        let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
                        query
                            .push(&target_table)
                            .push(" t SET ")
                            .push(validate_identifier(target_key)?)
                            .push(" = NULL WHERE ");
                        push_typed_comparison(
                            &mut query,
                            "t",
                            validate_identifier(target_key)?,
                            " = ",
                            fk_type,
                            parent_key,
                        );
                        query.build().execute(&mut *tx).await.map_err(map_db_error)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Insert rows requested by state-machine `create_record` actions.
async fn execute_machine_creates(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    outcome: &TransitionOutcome,
) -> AppResult<()> {
    for create in &outcome.record_creates {
        let Some(target) = ctx.snapshot.entity(&create.entity) else {
            tracing::warn!(entity = %create.entity, "create_record action names an unknown entity");
            continue;
        };
        let mut fields: Map<String, Value> = create
            .fields
            .iter()
            .filter(|(name, _)| target.has_field(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        stamp_auto_fields(&target, "create", &mut fields);
        if fields.is_empty() {
            continue;
        }
        insert_json_row(&mut *tx, &target.table, &fields).await?;
    }
    Ok(())
}

async fn execute_relation_writes(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    entity: &Entity,
    user: &UserContext,
    parent_record: &Value,
    writes: &[RelationWrite],
) -> AppResult<()> {
    for write in writes {
        let result = match write.relation.kind {
            RelationKind::ManyToMany => {
                execute_join_write(tx, ctx, entity, parent_record, write).await
            }
            RelationKind::OneToOne | RelationKind::OneToMany => {
                execute_child_write(tx, ctx, user, parent_record, write).await
            }
        };
        if let Err(error) = result {
            return Err(wrap_relation_error(&write.relation.name, error));
        }
    }
    Ok(())
}

fn wrap_relation_error(relation: &str, error: AppError) -> AppError {
    match error {
        AppError::NestedWriteFailed(details) | AppError::Validation(details) => {
            AppError::NestedWriteFailed(
                details
                    .into_iter()
                    .map(|mut detail| {
                        detail.relation.get_or_insert_with(|| relation.to_string());
                        detail
                    })
                    .collect(),
            )
        }
        AppError::BadRequest(message) | AppError::NotFound(message) => {
            AppError::NestedWriteFailed(vec![ValidationDetail {
                field: None,
                relation: Some(relation.to_string()),
                rule: None,
                index: None,
                message,
            }])
        }
        other => other,
    }
}

/// Diff/replace/append against a one-to-one or one-to-many child set.
async fn execute_child_write(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    user: &UserContext,
    parent_record: &Value,
    write: &RelationWrite,
) -> AppResult<()> {
    let relation = &write.relation;
    let target = ctx.snapshot.entity(&relation.target).ok_or_else(|| {
        AppError::UnknownEntity(format!("Unknown entity '{}'.", relation.target))
    })?;
    let target_key = relation.target_key.as_deref().ok_or_else(|| {
        AppError::Internal(format!("Relation '{}' lacks target_key.", relation.name))
    })?;
    let parent_key = parent_record
        .get(relation.source_key.as_str())
        .cloned()
        .filter(|v| !v.is_null())
        .ok_or_else(|| {
            AppError::Internal(format!(
                "Parent record lacks source key '{}'.",
                relation.source_key
            ))
        })?;

    let existing = fetch_children(tx, &target, target_key, &parent_key).await?;
    let pk_field = target.primary_key.field.as_str();
    let existing_keys: Vec<String> = existing
        .iter()
        .filter_map(|row| row.get(pk_field))
        .map(crate::repository::sql::render_scalar)
        .collect();

    let mut seen_keys: Vec<String> = Vec::new();

    for (index, row) in write.rows.iter().enumerate() {
        let mut row = row.clone();
        let wants_delete = row
            .remove("_delete")
            .map(|flag| crate::expr::truthy(&flag))
            .unwrap_or(false);
        let child_pk = row.get(pk_field).cloned().filter(|v| !v.is_null());

        match (&child_pk, wants_delete, write.mode) {
            (Some(pk), true, WriteMode::Diff | WriteMode::Replace) => {
                let pk_text = crate::repository::sql::render_scalar(pk);
                if !existing_keys.contains(&pk_text) {
                    return Err(at_index(
                        AppError::NotFound(format!(
                            "Child record '{pk_text}' does not belong to this parent."
                        )),
                        index,
                    ));
                }
                seen_keys.push(pk_text);
                delete_child(tx, &target, pk).await.map_err(|e| at_index(e, index))?;
            }
            (None, true, _) | (Some(_), true, WriteMode::Append) => {
                // Nothing to delete, or deletes are not allowed in append.
            }
            (Some(pk), false, WriteMode::Diff | WriteMode::Replace) => {
                let pk_text = crate::repository::sql::render_scalar(pk);
                if !existing_keys.contains(&pk_text) {
                    return Err(at_index(
                        AppError::NotFound(format!(
                            "Child record '{pk_text}' does not belong to this parent."
                        )),
                        index,
                    ));
                }
                seen_keys.push(pk_text);
                let old = existing
                    .iter()
                    .find(|candidate| {
                        candidate.get(pk_field).map(crate::repository::sql::render_scalar)
                            == Some(crate::repository::sql::render_scalar(pk))
                    })
                    .cloned();
                update_child(tx, ctx, &target, user, old, row)
                    .await
                    .map_err(|e| at_index(e, index))?;
            }
            (Some(_), false, WriteMode::Append) => {
                // Rows with a PK are ignored in append mode.
            }
            (None, false, _) => {
                row.insert(target_key.to_string(), parent_key.clone());
                insert_child(tx, ctx, &target, user, row)
                    .await
                    .map_err(|e| at_index(e, index))?;
            }
        }
    }

    if write.mode == WriteMode::Replace {
        for key in existing_keys {
            if seen_keys.contains(&key) {
                continue;
            }
            let pk_value = Value::String(key);
            delete_child(tx, &target, &pk_value).await?;
        }
    }

    Ok(())
}

fn at_index(error: AppError, index: usize) -> AppError {
    match error {
        AppError::Validation(details) | AppError::NestedWriteFailed(details) => {
            AppError::NestedWriteFailed(
                details
                    .into_iter()
                    .map(|mut detail| {
                        detail.index.get_or_insert(index);
                        detail
                    })
                    .collect(),
            )
        }
        AppError::BadRequest(message) | AppError::NotFound(message) => {
            AppError::NestedWriteFailed(vec![ValidationDetail {
                field: None,
                relation: None,
                rule: None,
                index: Some(index),
                message,
            }])
        }
        other => other,
    }
}

async fn fetch_children(
    tx: &mut PgConnection,
    target: &Entity,
    target_key: &str,
    parent_key: &Value,
) -> AppResult<Vec<Value>> {
    let fk_type = target
        .field(target_key)
        .map(|f| f.field_type)
        .unwrap_or(FieldType::Uuid);
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query
        .push(validate_identifier(&target.table)?)
        .push(" t WHERE ");
    push_typed_comparison(
        &mut query,
        "t",
        validate_identifier(target_key)?,
        " = ",
        fk_type,
        parent_key,
    );
    if target.soft_delete {
        query.push(" AND t.deleted_at IS NULL");
    }
    let rows = query.build().fetch_all(&mut *tx).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

async fn delete_child(tx: &mut PgConnection, target: &Entity, pk: &Value) -> AppResult<()> {
    let table = validate_identifier(&target.table)?;
    let mut query = if target.soft_delete {
        let mut q = QueryBuilder::<Postgres>::new("UPDATE ");
        q.push(table)
            .push(" t SET deleted_at = ")
            .push(dialect().now_expr())
            .push(" WHERE ");
        q
    } else {
        let mut q = QueryBuilder::<Postgres>::new("DELETE FROM ");
        q.push(table).push(" t WHERE ");
        q
    };
    push_typed_comparison(
        &mut query,
        "t",
        validate_identifier(&target.primary_key.field)?,
        " = ",
        target.primary_key.key_type,
        pk,
    );
    query.build().execute(&mut *tx).await.map_err(map_db_error)?;
    Ok(())
}

/// A new child row runs through the full planner for its own entity, so
/// child rules, state machines, and grandchild relations all apply.
async fn insert_child(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    target: &Entity,
    user: &UserContext,
    row: Map<String, Value>,
) -> AppResult<()> {
    let mut plan =
        Box::pin(plan_write(ctx, target, user, "create", row, None)).await?;
    stamp_auto_fields(target, "create", &mut plan.fields);
    let record = insert_json_row(&mut *tx, &target.table, &plan.fields).await?;
    Box::pin(execute_relation_writes(
        tx,
        ctx,
        target,
        user,
        &record,
        &plan.relation_writes,
    ))
    .await
}

async fn update_child(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    target: &Entity,
    user: &UserContext,
    old: Option<Value>,
    row: Map<String, Value>,
) -> AppResult<()> {
    let old = old.ok_or_else(|| AppError::NotFound("Child record not found.".to_string()))?;
    let mut plan =
        Box::pin(plan_write(ctx, target, user, "update", row, Some(&old))).await?;
    stamp_auto_fields(target, "update", &mut plan.fields);

    let pk_field = target.primary_key.field.as_str();
    let pk_value = old
        .get(pk_field)
        .cloned()
        .ok_or_else(|| AppError::Internal("Child record has no primary key.".to_string()))?;

    let record = if plan.fields.is_empty() {
        old
    } else {
        update_json_row(
            &mut *tx,
            &target.table,
            pk_field,
            target.primary_key.key_type,
            &pk_value,
            &plan.fields,
        )
        .await?
    };

    Box::pin(execute_relation_writes(
        tx,
        ctx,
        target,
        user,
        &record,
        &plan.relation_writes,
    ))
    .await
}

/// Join-table writes for many-to-many relations. Join rows carry no
/// business data, so removal is always a hard DELETE.
async fn execute_join_write(
    tx: &mut PgConnection,
    ctx: &WriteContext<'_>,
    entity: &Entity,
    parent_record: &Value,
    write: &RelationWrite,
) -> AppResult<()> {
    let relation = &write.relation;
    let target = ctx.snapshot.entity(&relation.target).ok_or_else(|| {
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
    let parent_key = parent_record
        .get(relation.source_key.as_str())
        .cloned()
        .filter(|v| !v.is_null())
        .ok_or_else(|| {
            AppError::Internal(format!(
                "Parent record lacks source key '{}'.",
                relation.source_key
            ))
        })?;

    let join_table = validate_identifier(join_table)?.to_string();
    let source_join_key = validate_identifier(source_join_key)?.to_string();
    let target_join_key = validate_identifier(target_join_key)?.to_string();
    let pk_field = target.primary_key.field.as_str();

    if write.mode == WriteMode::Replace {
        let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
        query.push(&join_table).push(" j WHERE ");
        push_typed_comparison(
            &mut query,
            "j",
            &source_join_key,
            " = ",
            entity.primary_key.key_type,
            &parent_key,
        );
        query.build().execute(&mut *tx).await.map_err(map_db_error)?;
    }

    for (index, row) in write.rows.iter().enumerate() {
        let target_pk = row
            .get(pk_field)
            .or_else(|| row.get("id"))
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                at_index(
                    AppError::BadRequest(format!(
                        "Join row must reference the target '{pk_field}'."
                    )),
                    index,
                )
            })?;
        let wants_delete = row
            .get("_delete")
            .map(crate::expr::truthy)
            .unwrap_or(false);

        if wants_delete && write.mode == WriteMode::Diff {
            let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
            query.push(&join_table).push(" j WHERE ");
            push_typed_comparison(
                &mut query,
                "j",
                &source_join_key,
                " = ",
                entity.primary_key.key_type,
                &parent_key,
            );
            query.push(" AND ");
            push_typed_comparison(
                &mut query,
                "j",
                &target_join_key,
                " = ",
                target.primary_key.key_type,
                &target_pk,
            );
            query.build().execute(&mut *tx).await.map_err(map_db_error)?;
            continue;
        }
        if wants_delete {
            continue;
        }

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
        query
            .push(&join_table)
            .push(" (")
            .push(&source_join_key)
            .push(", ")
            .push(&target_join_key)
            .push(") VALUES (");
        push_typed_value(&mut query, entity.primary_key.key_type, &parent_key);
        query.push(", ");
        push_typed_value(&mut query, target.primary_key.key_type, &target_pk);
        query.push(") ON CONFLICT DO NOTHING");
        query.build().execute(&mut *tx).await.map_err(map_db_error)?;
    }

    Ok(())
}

/// Fetch a record for the write path (update/delete handlers).
pub async fn load_existing(
    ctx: &WriteContext<'_>,
    entity: &Entity,
    id: &str,
) -> AppResult<Value> {
    let record = fetch_one(
        ctx.pool,
        entity,
        &entity.primary_key.field,
        &Value::String(id.to_string()),
        &[],
    )
    .await?;
    record.ok_or_else(|| {
        AppError::NotFound(format!("{} '{id}' not found.", entity.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoice() -> Entity {
        Entity::parse(&json!({
            "name": "invoice",
            "table": "invoices",
            "primary_key": {"field": "id", "type": "uuid", "generated": true},
            "soft_delete": true,
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "number", "type": "string", "required": true},
                {"name": "status", "type": "string", "default": "draft"},
                {"name": "kind", "type": "string", "enum": ["standard", "credit"]},
                {"name": "total", "type": "decimal", "precision": 2},
                {"name": "issued_on", "type": "date"},
                {"name": "created_at", "type": "timestamp", "auto": "create"},
                {"name": "updated_at", "type": "timestamp", "auto": "update"},
            ],
        }))
        .unwrap()
    }

    fn items_relation() -> Relation {
        Relation::parse(&json!({
            "name": "items",
            "type": "one_to_many",
            "source": "invoice",
            "target": "invoice_item",
            "source_key": "id",
            "target_key": "invoice_id",
            "ownership": "source",
            "write_mode": "diff",
        }))
        .unwrap()
    }

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.insert_entity(invoice());
        snapshot.insert_relation(items_relation());
        snapshot
    }

    #[test]
    fn split_separates_fields_from_relations() {
        let snapshot = snapshot();
        let entity = invoice();
        let payload = json!({
            "number": "INV-1",
            "created_at": "2020-01-01T00:00:00Z",
            "items": {"_write_mode": "replace", "data": [{"description": "W"}]},
        })
        .as_object()
        .cloned()
        .unwrap();

        let (fields, writes) = split_payload(&snapshot, &entity, "create", payload).unwrap();
        assert_eq!(fields.get("number"), Some(&json!("INV-1")));
        // Auto-managed fields are silently ignored.
        assert!(!fields.contains_key("created_at"));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].mode, WriteMode::Replace);
        assert_eq!(writes[0].rows.len(), 1);
    }

    #[test]
    fn split_rejects_unknown_keys() {
        let snapshot = snapshot();
        let entity = invoice();
        let payload = json!({"number": "INV-1", "nope": 1})
            .as_object()
            .cloned()
            .unwrap();
        let error = split_payload(&snapshot, &entity, "create", payload).unwrap_err();
        assert!(matches!(error, AppError::BadRequest(_)));
    }

    #[test]
    fn relation_write_mode_defaults_to_relation_metadata() {
        let snapshot = snapshot();
        let entity = invoice();
        let payload = json!({"items": {"data": []}}).as_object().cloned().unwrap();
        let (_, writes) = split_payload(&snapshot, &entity, "update", payload).unwrap();
        assert_eq!(writes[0].mode, WriteMode::Diff);

        let payload = json!({"items": {"_write_mode": "bogus", "data": []}})
            .as_object()
            .cloned()
            .unwrap();
        assert!(split_payload(&snapshot, &entity, "update", payload).is_err());
    }

    #[test]
    fn scalar_shape_checks() {
        let entity = invoice();
        let number = entity.field("number").unwrap();
        assert!(check_scalar_shape(number, &json!("INV-1")).is_ok());
        assert!(check_scalar_shape(number, &json!(5)).is_err());

        let total = entity.field("total").unwrap();
        assert!(check_scalar_shape(total, &json!(10.5)).is_ok());
        assert!(check_scalar_shape(total, &json!("10.5")).is_err());

        let issued = entity.field("issued_on").unwrap();
        assert!(check_scalar_shape(issued, &json!("2026-02-01")).is_ok());
        assert!(check_scalar_shape(issued, &json!("02/01/2026")).is_err());

        let id = entity.field("id").unwrap();
        assert!(check_scalar_shape(id, &json!("550e8400-e29b-41d4-a716-446655440000")).is_ok());
        assert!(check_scalar_shape(id, &json!("xyz")).is_err());
    }

    #[test]
    fn auto_fields_are_stamped_by_action() {
        let entity = invoice();
        let mut fields = Map::new();
        stamp_auto_fields(&entity, "create", &mut fields);
        assert!(fields.contains_key("created_at"));
        assert!(fields.contains_key("updated_at"));

        let mut fields = Map::new();
        stamp_auto_fields(&entity, "update", &mut fields);
        assert!(!fields.contains_key("created_at"));
        assert!(fields.contains_key("updated_at"));
    }

    #[test]
    fn nested_errors_carry_relation_and_index() {
        let error = wrap_relation_error(
            "items",
            at_index(AppError::BadRequest("bad row".to_string()), 2),
        );
        match error {
            AppError::NestedWriteFailed(details) => {
                assert_eq!(details.len(), 1);
                assert_eq!(details[0].relation.as_deref(), Some("items"));
                assert_eq!(details[0].index, Some(2));
                assert_eq!(details[0].message, "bad row");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
