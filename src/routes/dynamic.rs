//! The five dynamic handlers behind every business entity: List,
//! Get-by-id-or-slug, Create, Update, Delete. Each resolves the entity
//! from the registry snapshot, checks permissions, and hands reads to
//! the query planner and writes to the write pipeline. Post-commit
//! effects (workflow triggers, async webhooks) run after the response
//! body is final but before it is sent.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::apps::AppContext;
use crate::auth::authenticate;
use crate::error::{AppError, AppResult};
use crate::metadata::model::{Entity, FetchMode, HookKind, PermissionAction, UserContext};
use crate::metadata::registry::Snapshot;
use crate::repository::query_planner::{
    attach_includes, fetch_one, list_envelope, parse_list_query, run_list,
};
use crate::repository::write_pipeline::{
    load_existing, run_create, run_delete, run_update, WriteContext, WriteOutcome,
};
use crate::services::permissions::{check_read, check_write};
use crate::services::state_machine::DeferredAction;
use crate::services::webhooks::enqueue_async_hooks;
use crate::services::workflows::{start_for_transitions, WorkflowContext};
use crate::state::AppState;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/{entity}",
            axum::routing::get(list_records).post(create_record),
        )
        .route(
            "/{entity}/{id}",
            axum::routing::get(get_record)
                .put(update_record)
                .delete(delete_record),
        )
}

struct RequestScope {
    app: Arc<AppContext>,
    snapshot: Arc<Snapshot>,
    entity: Arc<Entity>,
    user: UserContext,
}

async fn resolve_scope(
    state: &AppState,
    app_name: &str,
    entity_name: &str,
    headers: &HeaderMap,
) -> AppResult<RequestScope> {
    let app = state.manager.get(app_name).await?;
    let user = authenticate(state, &app, headers)?;
    let snapshot = app.registry.get();
    let entity = snapshot.entity(entity_name).ok_or_else(|| {
        AppError::UnknownEntity(format!("Unknown entity '{entity_name}'."))
    })?;
    Ok(RequestScope {
        app,
        snapshot,
        entity,
        user,
    })
}

async fn list_records(
    State(state): State<AppState>,
    Path((app_name, entity_name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let scope = resolve_scope(&state, &app_name, &entity_name, &headers).await?;
    let injected = check_read(&scope.snapshot, &scope.entity.name, &scope.user)?;

    let list = parse_list_query(&scope.entity, &scope.snapshot, &params)?;
    let includes = with_eager_includes(&scope.snapshot, &scope.entity, list.includes.clone());
    let (mut rows, total) = run_list(&scope.app.pool, &scope.entity, &list, &injected).await?;
    attach_includes(
        &scope.app.pool,
        &scope.snapshot,
        &scope.entity,
        &mut rows,
        &includes,
    )
    .await?;

    Ok(Json(list_envelope(rows, list.page, list.per_page, total)))
}

async fn get_record(
    State(state): State<AppState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let scope = resolve_scope(&state, &app_name, &entity_name, &headers).await?;
    let injected = check_read(&scope.snapshot, &scope.entity.name, &scope.user)?;

    // The path segment is the primary key, or the slug when the entity
    // declares one and the value does not look like its key type.
    let key_field = resolve_key_field(&scope.entity, &id);
    let mut record = fetch_one(
        &scope.app.pool,
        &scope.entity,
        key_field,
        &Value::String(id.clone()),
        &injected,
    )
    .await?
    .ok_or_else(|| AppError::NotFound(format!("{entity_name} '{id}' not found.")))?;

    let requested: Vec<String> = params
        .get("include")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let includes = with_eager_includes(&scope.snapshot, &scope.entity, requested);
    if !includes.is_empty() {
        let mut rows = vec![record];
        attach_includes(
            &scope.app.pool,
            &scope.snapshot,
            &scope.entity,
            &mut rows,
            &includes,
        )
        .await?;
        record = rows.remove(0);
    }

    Ok(Json(json!({ "data": record })))
}

/// Relations declared `fetch: eager` attach on every read of their
/// source entity, on top of whatever `include=` asked for.
fn with_eager_includes(
    snapshot: &Snapshot,
    entity: &Entity,
    mut includes: Vec<String>,
) -> Vec<String> {
    for relation in snapshot.relations_of(&entity.name) {
        if relation.fetch == FetchMode::Eager && !includes.contains(&relation.name) {
            includes.push(relation.name.clone());
        }
    }
    includes
}

fn resolve_key_field<'e>(entity: &'e Entity, id: &str) -> &'e str {
    if let Some(slug) = entity.slug_field() {
        let looks_like_pk = match entity.primary_key.key_type {
            crate::metadata::model::FieldType::Uuid => uuid::Uuid::parse_str(id).is_ok(),
            crate::metadata::model::FieldType::Int
            | crate::metadata::model::FieldType::Bigint => id.parse::<i64>().is_ok(),
            _ => true,
        };
        if !looks_like_pk {
            return &slug.name;
        }
    }
    &entity.primary_key.field
}

async fn create_record(
    State(state): State<AppState>,
    Path((app_name, entity_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let scope = resolve_scope(&state, &app_name, &entity_name, &headers).await?;
    let payload = as_object(payload)?;
    check_write(
        &scope.snapshot,
        &scope.entity.name,
        PermissionAction::Create,
        &scope.user,
        &Value::Object(payload.clone()),
    )?;

    let delivery = state.delivery_config(&scope.app);
    let ctx = WriteContext {
        pool: &scope.app.pool,
        snapshot: &scope.snapshot,
        webhooks: &delivery,
    };
    let outcome = run_create(&ctx, &scope.entity, &scope.user, payload).await?;

    post_commit(&state, &scope, &outcome, "create", HookKind::AfterWrite).await;

    Ok((StatusCode::CREATED, Json(json!({ "data": outcome.record }))))
}

async fn update_record(
    State(state): State<AppState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    let scope = resolve_scope(&state, &app_name, &entity_name, &headers).await?;
    let payload = as_object(payload)?;

    let delivery = state.delivery_config(&scope.app);
    let ctx = WriteContext {
        pool: &scope.app.pool,
        snapshot: &scope.snapshot,
        webhooks: &delivery,
    };
    let old = load_existing(&ctx, &scope.entity, &id).await?;
    check_write(
        &scope.snapshot,
        &scope.entity.name,
        PermissionAction::Update,
        &scope.user,
        &old,
    )?;

    let outcome = run_update(&ctx, &scope.entity, &scope.user, old, payload).await?;

    post_commit(&state, &scope, &outcome, "update", HookKind::AfterWrite).await;

    Ok(Json(json!({ "data": outcome.record })))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((app_name, entity_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let scope = resolve_scope(&state, &app_name, &entity_name, &headers).await?;

    let delivery = state.delivery_config(&scope.app);
    let ctx = WriteContext {
        pool: &scope.app.pool,
        snapshot: &scope.snapshot,
        webhooks: &delivery,
    };
    let old = load_existing(&ctx, &scope.entity, &id).await?;
    check_write(
        &scope.snapshot,
        &scope.entity.name,
        PermissionAction::Delete,
        &scope.user,
        &old,
    )?;

    let outcome = run_delete(&ctx, &scope.entity, &scope.user, old).await?;

    post_commit(&state, &scope, &outcome, "delete", HookKind::AfterDelete).await;

    Ok(Json(json!({ "data": outcome.record })))
}

fn as_object(payload: Value) -> AppResult<Map<String, Value>> {
    match payload {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::BadRequest(
            "Request body must be a JSON object.".to_string(),
        )),
    }
}

/// Post-commit effects, in source order: workflow triggers for accepted
/// state transitions, deferred state-machine actions, then async
/// webhook enqueues. All fire-and-forget with their own retry state.
async fn post_commit(
    state: &AppState,
    scope: &RequestScope,
    outcome: &WriteOutcome,
    action: &str,
    hook: HookKind,
) {
    let delivery = state.delivery_config(&scope.app);

    if !outcome.transitions.is_empty() {
        let record_id = outcome
            .record
            .get(scope.entity.primary_key.field.as_str())
            .map(crate::repository::sql::render_scalar)
            .unwrap_or_default();
        let ctx = WorkflowContext {
            pool: &scope.app.pool,
            snapshot: &scope.snapshot,
            webhooks: &delivery,
        };
        start_for_transitions(
            &ctx,
            &scope.entity.name,
            &outcome.transitions,
            &outcome.record,
            &record_id,
        )
        .await;
    }

    for deferred in &outcome.deferred {
        match deferred {
            DeferredAction::Webhook(action_config) => {
                let Some(url) = action_config.get("url").and_then(Value::as_str) else {
                    continue;
                };
                let request = delivery
                    .client
                    .post(url)
                    .timeout(delivery.timeout)
                    .json(&json!({
                        "event": "transition_action",
                        "entity": scope.entity.name,
                        "record": outcome.record,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }));
                tokio::spawn(async move {
                    if let Err(error) = request.send().await {
                        tracing::warn!(error = %error, "Transition webhook action failed");
                    }
                });
            }
            DeferredAction::SendEvent(event) => {
                tracing::info!(
                    entity = %scope.entity.name,
                    event = %event.get("name").and_then(serde_json::Value::as_str).unwrap_or("event"),
                    "Transition event emitted"
                );
            }
        }
    }

    enqueue_async_hooks(
        &scope.app.pool,
        &delivery,
        &scope.snapshot,
        &scope.entity.name,
        hook,
        action,
        &outcome.record,
        outcome.old.as_ref(),
        &scope.user,
    )
    .await;
}
