//! Admin write operations under `/api/:app/_admin`: CRUD for every kind
//! of metadata, user and invite management, webhook delivery logs, the
//! audit trail, and export/import.
//!
//! Every metadata mutation validates the definition (including compiling
//! its expressions), persists it, runs the migrator when the shape of a
//! business table is affected, and reloads the registry so the change is
//! live for the next request.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::Arc;

use crate::apps::AppContext;
use crate::auth::{authenticate, hash_password};
use crate::error::{AppError, AppResult};
use crate::metadata::model::{
    Entity, Permission, Relation, RelationKind, Rule, StateMachine, UserContext, Webhook, Workflow,
};
use crate::repository::migrator::{migrate_entity, migrate_join_table};
use crate::repository::sql::{map_db_error, read_row, read_rows, validate_identifier};
use crate::schemas::{validate_input, CreateInviteInput, CreateUserInput, UpdateUserInput};
use crate::state::AppState;

pub fn router() -> axum::Router<AppState> {
    use axum::routing::{delete, get, post, put};
    axum::Router::new()
        .route("/_admin/entities", get(list_entities).post(create_entity))
        .route(
            "/_admin/entities/{name}",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
        .route("/_admin/relations", get(list_relations).post(create_relation))
        .route("/_admin/relations/{name}", delete(delete_relation))
        .route("/_admin/rules", get(list_rules).post(create_rule))
        .route("/_admin/rules/{id}", put(update_rule).delete(delete_rule))
        .route(
            "/_admin/state-machines",
            get(list_state_machines).post(create_state_machine),
        )
        .route(
            "/_admin/state-machines/{id}",
            put(update_state_machine).delete(delete_state_machine),
        )
        .route("/_admin/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/_admin/workflows/{id}",
            put(update_workflow).delete(delete_workflow),
        )
        .route(
            "/_admin/permissions",
            get(list_permissions).post(create_permission),
        )
        .route(
            "/_admin/permissions/{id}",
            put(update_permission).delete(delete_permission),
        )
        .route("/_admin/webhooks", get(list_webhooks).post(create_webhook))
        .route(
            "/_admin/webhooks/{id}",
            put(update_webhook).delete(delete_webhook),
        )
        .route("/_admin/ui-configs", get(list_ui_configs).post(upsert_ui_config))
        .route("/_admin/ui-configs/{name}", delete(delete_ui_config))
        .route("/_admin/users", get(list_users).post(create_user))
        .route("/_admin/users/{id}", put(update_user).delete(delete_user))
        .route("/_admin/invites", get(list_invites).post(create_invite))
        .route("/_admin/invites/{id}", delete(delete_invite))
        .route("/_admin/webhook-logs", get(list_webhook_logs))
        .route("/_admin/webhook-logs/{id}/retry", post(retry_webhook_log))
        .route("/_admin/audit-log", get(list_audit_log))
        .route("/_admin/export", get(export_metadata))
        .route("/_admin/import", post(import_metadata))
}

async fn admin_scope(
    state: &AppState,
    app_name: &str,
    headers: &HeaderMap,
) -> AppResult<(Arc<AppContext>, UserContext)> {
    let app = state.manager.get(app_name).await?;
    let user = authenticate(state, &app, headers)?;
    if !user.is_admin() {
        return Err(AppError::Forbidden(
            "Admin operations require the admin role.".to_string(),
        ));
    }
    Ok((app, user))
}

// ---------------------------------------------------------------------
// Shared helpers for the metadata tables
// ---------------------------------------------------------------------

async fn list_definition_rows(pool: &PgPool, table: &str) -> AppResult<Vec<Value>> {
    let sql = format!("SELECT row_to_json(t) AS row FROM {table} t ORDER BY created_at ASC");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

async fn insert_definition(pool: &PgPool, table: &str, definition: &Value) -> AppResult<Value> {
    let sql = format!(
        "INSERT INTO {table} (definition) VALUES ($1)
         RETURNING row_to_json({table}.*) AS row"
    );
    let row = sqlx::query(&sql)
        .bind(definition)
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    read_row(&row).ok_or_else(|| AppError::Internal("Metadata insert readback failed.".to_string()))
}

async fn update_definition(
    pool: &PgPool,
    table: &str,
    id: &str,
    definition: &Value,
) -> AppResult<Value> {
    let sql = format!(
        "UPDATE {table} SET definition = $1, updated_at = now()
         WHERE id = $2::uuid
         RETURNING row_to_json({table}.*) AS row"
    );
    let row = sqlx::query(&sql)
        .bind(definition)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    row.as_ref()
        .and_then(read_row)
        .ok_or_else(|| AppError::NotFound("Metadata record not found.".to_string()))
}

async fn delete_definition(pool: &PgPool, table: &str, id: &str) -> AppResult<()> {
    let sql = format!("DELETE FROM {table} WHERE id = $1::uuid");
    let result = sqlx::query(&sql)
        .bind(id)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Metadata record not found.".to_string()));
    }
    Ok(())
}

fn unprocessable(error: String) -> AppError {
    AppError::UnprocessableEntity(error)
}

// ---------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------

async fn list_entities(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    Ok(Json(json!({ "data": list_definition_rows(&app.pool, "_entities").await? })))
}

async fn get_entity(
    State(state): State<AppState>,
    Path((app_name, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let row = sqlx::query("SELECT row_to_json(t) AS row FROM _entities t WHERE name = $1")
        .bind(&name)
        .fetch_optional(&app.pool)
        .await
        .map_err(map_db_error)?;
    let entity = row
        .as_ref()
        .and_then(read_row)
        .ok_or_else(|| AppError::NotFound(format!("Entity '{name}' not found.")))?;
    Ok(Json(json!({ "data": entity })))
}

async fn create_entity(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(definition): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let entity = Entity::parse(&definition).map_err(unprocessable)?;

    upsert_entity_row(&app.pool, &entity.name, &definition).await?;
    migrate_entity(&app.pool, &entity).await?;
    app.registry.reload(&app.pool).await?;

    Ok((StatusCode::CREATED, Json(json!({ "data": definition }))))
}

async fn update_entity(
    State(state): State<AppState>,
    Path((app_name, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(definition): Json<Value>,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let entity = Entity::parse(&definition).map_err(unprocessable)?;
    if entity.name != name {
        return Err(AppError::BadRequest(
            "Entity name in the body must match the path.".to_string(),
        ));
    }

    upsert_entity_row(&app.pool, &name, &definition).await?;
    migrate_entity(&app.pool, &entity).await?;
    app.registry.reload(&app.pool).await?;

    Ok(Json(json!({ "data": definition })))
}

async fn upsert_entity_row(pool: &PgPool, name: &str, definition: &Value) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO _entities (name, definition)
         VALUES ($1, $2)
         ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = now()",
    )
    .bind(name)
    .bind(definition)
    .execute(pool)
    .await
    .map_err(map_db_error)?;
    Ok(())
}

async fn delete_entity(
    State(state): State<AppState>,
    Path((app_name, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let result = sqlx::query("DELETE FROM _entities WHERE name = $1")
        .bind(&name)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Entity '{name}' not found.")));
    }
    // The table itself is left in place; the migrator never drops.
    app.registry.reload(&app.pool).await?;
    Ok(Json(json!({ "data": { "name": name, "deleted": true } })))
}

// ---------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------

async fn list_relations(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    Ok(Json(json!({ "data": list_definition_rows(&app.pool, "_relations").await? })))
}

async fn create_relation(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(definition): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let relation = Relation::parse(&definition).map_err(unprocessable)?;

    let snapshot = app.registry.get();
    let source = snapshot.entity(&relation.source).ok_or_else(|| {
        AppError::UnprocessableEntity(format!("Source entity '{}' does not exist.", relation.source))
    })?;
    let target = snapshot.entity(&relation.target).ok_or_else(|| {
        AppError::UnprocessableEntity(format!("Target entity '{}' does not exist.", relation.target))
    })?;

    sqlx::query(
        "INSERT INTO _relations (name, definition)
         VALUES ($1, $2)
         ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = now()",
    )
    .bind(&relation.name)
    .bind(&definition)
    .execute(&app.pool)
    .await
    .map_err(map_db_error)?;

    if relation.kind == RelationKind::ManyToMany {
        migrate_join_table(&app.pool, &relation, &source, &target).await?;
    }
    app.registry.reload(&app.pool).await?;

    Ok((StatusCode::CREATED, Json(json!({ "data": definition }))))
}

async fn delete_relation(
    State(state): State<AppState>,
    Path((app_name, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let result = sqlx::query("DELETE FROM _relations WHERE name = $1")
        .bind(&name)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Relation '{name}' not found.")));
    }
    app.registry.reload(&app.pool).await?;
    Ok(Json(json!({ "data": { "name": name, "deleted": true } })))
}

// ---------------------------------------------------------------------
// Rules / state machines / workflows / permissions / webhooks
// ---------------------------------------------------------------------

macro_rules! definition_crud {
    ($table:literal, $parse:expr,
     $list:ident, $create:ident, $update:ident, $delete:ident) => {
        async fn $list(
            State(state): State<AppState>,
            Path(app_name): Path<String>,
            headers: HeaderMap,
        ) -> AppResult<Json<Value>> {
            let (app, _) = admin_scope(&state, &app_name, &headers).await?;
            Ok(Json(json!({ "data": list_definition_rows(&app.pool, $table).await? })))
        }

        async fn $create(
            State(state): State<AppState>,
            Path(app_name): Path<String>,
            headers: HeaderMap,
            Json(definition): Json<Value>,
        ) -> AppResult<(StatusCode, Json<Value>)> {
            let (app, _) = admin_scope(&state, &app_name, &headers).await?;
            #[allow(clippy::redundant_closure_call)]
            ($parse)("pending", &definition).map_err(unprocessable)?;
            let row = insert_definition(&app.pool, $table, &definition).await?;
            app.registry.reload(&app.pool).await?;
            Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
        }

        async fn $update(
            State(state): State<AppState>,
            Path((app_name, id)): Path<(String, String)>,
            headers: HeaderMap,
            Json(definition): Json<Value>,
        ) -> AppResult<Json<Value>> {
            let (app, _) = admin_scope(&state, &app_name, &headers).await?;
            #[allow(clippy::redundant_closure_call)]
            ($parse)(id.as_str(), &definition).map_err(unprocessable)?;
            let row = update_definition(&app.pool, $table, &id, &definition).await?;
            app.registry.reload(&app.pool).await?;
            Ok(Json(json!({ "data": row })))
        }

        async fn $delete(
            State(state): State<AppState>,
            Path((app_name, id)): Path<(String, String)>,
            headers: HeaderMap,
        ) -> AppResult<Json<Value>> {
            let (app, _) = admin_scope(&state, &app_name, &headers).await?;
            delete_definition(&app.pool, $table, &id).await?;
            app.registry.reload(&app.pool).await?;
            Ok(Json(json!({ "data": { "id": id, "deleted": true } })))
        }
    };
}

definition_crud!(
    "_rules",
    |id: &str, v: &Value| Rule::parse(id, v).map(|_| ()),
    list_rules,
    create_rule,
    update_rule,
    delete_rule
);
definition_crud!(
    "_state_machines",
    |id: &str, v: &Value| StateMachine::parse(id, v).map(|_| ()),
    list_state_machines,
    create_state_machine,
    update_state_machine,
    delete_state_machine
);
definition_crud!(
    "_workflows",
    |id: &str, v: &Value| Workflow::parse(id, v).map(|_| ()),
    list_workflows,
    create_workflow,
    update_workflow,
    delete_workflow
);
definition_crud!(
    "_permissions",
    |id: &str, v: &Value| Permission::parse(id, v).map(|_| ()),
    list_permissions,
    create_permission,
    update_permission,
    delete_permission
);
definition_crud!(
    "_webhooks",
    |id: &str, v: &Value| Webhook::parse(id, v).map(|_| ()),
    list_webhooks,
    create_webhook,
    update_webhook,
    delete_webhook
);

// ---------------------------------------------------------------------
// UI configs
// ---------------------------------------------------------------------

async fn list_ui_configs(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let rows = sqlx::query("SELECT row_to_json(t) AS row FROM _ui_configs t ORDER BY name ASC")
        .fetch_all(&app.pool)
        .await
        .map_err(map_db_error)?;
    Ok(Json(json!({ "data": read_rows(rows) })))
}

async fn upsert_ui_config(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("UI config requires a name.".to_string()))?;

    let row = sqlx::query(
        "INSERT INTO _ui_configs (name, definition)
         VALUES ($1, $2)
         ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = now()
         RETURNING row_to_json(_ui_configs.*) AS row",
    )
    .bind(name)
    .bind(&body)
    .fetch_one(&app.pool)
    .await
    .map_err(map_db_error)?;

    let config = read_row(&row)
        .ok_or_else(|| AppError::Internal("UI config readback failed.".to_string()))?;
    Ok(Json(json!({ "data": config })))
}

async fn delete_ui_config(
    State(state): State<AppState>,
    Path((app_name, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let result = sqlx::query("DELETE FROM _ui_configs WHERE name = $1")
        .bind(&name)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("UI config '{name}' not found.")));
    }
    Ok(Json(json!({ "data": { "name": name, "deleted": true } })))
}

// ---------------------------------------------------------------------
// Users & invites
// ---------------------------------------------------------------------

async fn list_users(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let rows = sqlx::query(
        "SELECT json_build_object(
            'id', id, 'email', email, 'roles', roles, 'active', active,
            'created_at', created_at
         ) AS row
         FROM _users ORDER BY created_at ASC",
    )
    .fetch_all(&app.pool)
    .await
    .map_err(map_db_error)?;
    Ok(Json(json!({ "data": read_rows(rows) })))
}

async fn create_user(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    validate_input(&payload)?;

    let password_hash = hash_password(&payload.password)?;
    let row = sqlx::query(
        "INSERT INTO _users (email, password_hash, roles)
         VALUES ($1, $2, $3)
         ON CONFLICT (email) DO NOTHING
         RETURNING json_build_object('id', id, 'email', email, 'roles', roles) AS row",
    )
    .bind(&payload.email)
    .bind(&password_hash)
    .bind(serde_json::to_value(&payload.roles).unwrap_or_default())
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?;

    let user = row.as_ref().and_then(read_row).ok_or_else(|| {
        AppError::Conflict(format!("A user with email '{}' already exists.", payload.email))
    })?;
    Ok((StatusCode::CREATED, Json(json!({ "data": user }))))
}

async fn update_user(
    State(state): State<AppState>,
    Path((app_name, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUserInput>,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;

    let password_hash = match payload.password.as_deref() {
        Some(password) if password.len() >= 8 => Some(hash_password(password)?),
        Some(_) => {
            return Err(AppError::BadRequest(
                "Password must be at least 8 characters.".to_string(),
            ))
        }
        None => None,
    };

    let row = sqlx::query(
        "UPDATE _users
         SET roles = COALESCE($1, roles),
             active = COALESCE($2, active),
             password_hash = COALESCE($3, password_hash),
             updated_at = now()
         WHERE id = $4::uuid
         RETURNING json_build_object('id', id, 'email', email, 'roles', roles, 'active', active) AS row",
    )
    .bind(payload.roles.map(|roles| serde_json::to_value(roles).unwrap_or_default()))
    .bind(payload.active)
    .bind(password_hash)
    .bind(&user_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?;

    let user = row
        .as_ref()
        .and_then(read_row)
        .ok_or_else(|| AppError::NotFound("User not found.".to_string()))?;
    Ok(Json(json!({ "data": user })))
}

async fn delete_user(
    State(state): State<AppState>,
    Path((app_name, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, user) = admin_scope(&state, &app_name, &headers).await?;
    if user.id == user_id {
        return Err(AppError::BadRequest(
            "You cannot delete your own account.".to_string(),
        ));
    }
    let result = sqlx::query("UPDATE _users SET active = false, updated_at = now() WHERE id = $1::uuid")
        .bind(&user_id)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("User not found.".to_string()));
    }
    Ok(Json(json!({ "data": { "id": user_id, "deactivated": true } })))
}

async fn list_invites(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _invites t
         WHERE accepted_at IS NULL
         ORDER BY created_at DESC LIMIT 200",
    )
    .fetch_all(&app.pool)
    .await
    .map_err(map_db_error)?;
    Ok(Json(json!({ "data": read_rows(rows) })))
}

async fn create_invite(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CreateInviteInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    validate_input(&payload)?;

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT 1::bigint FROM _users WHERE lower(email) = lower($1)")
            .bind(&payload.email)
            .fetch_optional(&app.pool)
            .await
            .map_err(map_db_error)?;
    if existing.is_some() {
        return Err(AppError::Conflict(format!(
            "A user with email '{}' already exists.",
            payload.email
        )));
    }

    let token = uuid::Uuid::new_v4().to_string();
    let expires_at = chrono::Utc::now() + chrono::Duration::days(payload.expires_in_days.max(1));
    let row = sqlx::query(
        "INSERT INTO _invites (email, roles, token, expires_at)
         VALUES ($1, $2, $3, $4)
         RETURNING row_to_json(_invites.*) AS row",
    )
    .bind(&payload.email)
    .bind(serde_json::to_value(&payload.roles).unwrap_or_default())
    .bind(&token)
    .bind(expires_at)
    .fetch_one(&app.pool)
    .await
    .map_err(map_db_error)?;

    let invite = read_row(&row)
        .ok_or_else(|| AppError::Internal("Invite readback failed.".to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "data": invite }))))
}

async fn delete_invite(
    State(state): State<AppState>,
    Path((app_name, invite_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let result = sqlx::query("DELETE FROM _invites WHERE id = $1::uuid")
        .bind(&invite_id)
        .execute(&app.pool)
        .await
        .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Invite not found.".to_string()));
    }
    Ok(Json(json!({ "data": { "id": invite_id, "deleted": true } })))
}

// ---------------------------------------------------------------------
// Webhook logs & audit log
// ---------------------------------------------------------------------

async fn list_webhook_logs(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;

    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT row_to_json(t) AS row FROM _webhook_logs t WHERE 1=1",
    );
    if let Some(status) = params.get("status").filter(|s| !s.is_empty()) {
        query.push(" AND t.status = ").push_bind(status.clone());
    }
    if let Some(entity) = params.get("entity").filter(|s| !s.is_empty()) {
        query.push(" AND t.entity = ").push_bind(entity.clone());
    }
    query.push(" ORDER BY t.created_at DESC LIMIT 200");

    let rows = query
        .build()
        .fetch_all(&app.pool)
        .await
        .map_err(map_db_error)?;
    Ok(Json(json!({ "data": read_rows(rows) })))
}

async fn retry_webhook_log(
    State(state): State<AppState>,
    Path((app_name, log_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;
    let row = crate::services::webhooks::retry_now(&app.pool, &log_id).await?;
    Ok(Json(json!({ "data": row })))
}

async fn list_audit_log(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;

    let mut query =
        QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM _audit_log t WHERE 1=1");
    if let Some(entity) = params.get("entity").filter(|s| !s.is_empty()) {
        query.push(" AND t.entity = ").push_bind(entity.clone());
    }
    if let Some(record_id) = params.get("record_id").filter(|s| !s.is_empty()) {
        query.push(" AND t.record_id = ").push_bind(record_id.clone());
    }
    query.push(" ORDER BY t.created_at DESC LIMIT 200");

    let rows = query
        .build()
        .fetch_all(&app.pool)
        .await
        .map_err(map_db_error)?;
    Ok(Json(json!({ "data": read_rows(rows) })))
}

// ---------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------

const EXPORT_SECTIONS: &[(&str, &str)] = &[
    ("entities", "_entities"),
    ("relations", "_relations"),
    ("rules", "_rules"),
    ("state_machines", "_state_machines"),
    ("workflows", "_workflows"),
    ("permissions", "_permissions"),
    ("webhooks", "_webhooks"),
    ("ui_configs", "_ui_configs"),
];

async fn export_metadata(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;

    let mut document = Map::new();
    document.insert("version".to_string(), json!(1));
    document.insert(
        "exported_at".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    for (section, table) in EXPORT_SECTIONS {
        let sql = format!("SELECT definition FROM {table} ORDER BY created_at ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&app.pool)
            .await
            .map_err(map_db_error)?;
        let definitions: Vec<Value> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<Value, _>("definition").ok())
            .collect();
        document.insert(section.to_string(), Value::Array(definitions));
    }

    Ok(Json(Value::Object(document)))
}

/// Import a version-1 export document. Inserts run in dependency order;
/// per-record failures are collected and reported, not fatal.
async fn import_metadata(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    Json(document): Json<Value>,
) -> AppResult<Json<Value>> {
    let (app, _) = admin_scope(&state, &app_name, &headers).await?;

    if document.get("version").and_then(Value::as_i64) != Some(1) {
        return Err(AppError::BadRequest(
            "Unsupported export version; expected 1.".to_string(),
        ));
    }

    let mut errors: Vec<Value> = Vec::new();
    let mut imported: Map<String, Value> = Map::new();

    for (section, table) in EXPORT_SECTIONS {
        let items = document
            .get(*section)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut count = 0u32;
        for definition in &items {
            match import_one(&app, section, table, definition).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(error) => {
                    errors.push(json!({
                        "section": section,
                        "error": error.detail_message(),
                    }));
                }
            }
        }
        imported.insert(section.to_string(), json!(count));

        // Entities must be live (tables migrated, registry aware) before
        // relations and the rest can validate against them.
        if *section == "entities" || *section == "relations" {
            if let Err(error) = app.registry.reload(&app.pool).await {
                errors.push(json!({ "section": section, "error": error.detail_message() }));
            }
        }
    }

    if let Err(error) = app.registry.reload(&app.pool).await {
        errors.push(json!({ "section": "reload", "error": error.detail_message() }));
    }

    let mut sample_count = 0u32;
    if let Some(sample_data) = document.get("sample_data").and_then(Value::as_object) {
        let snapshot = app.registry.get();
        for (table, rows) in sample_data {
            match import_sample_rows(&app.pool, &snapshot, table, rows).await {
                Ok(count) => sample_count += count,
                Err(error) => errors.push(json!({
                    "section": "sample_data",
                    "table": table,
                    "error": error.detail_message(),
                })),
            }
        }
    }

    Ok(Json(json!({
        "data": {
            "imported": imported,
            "sample_rows": sample_count,
            "errors": errors,
        }
    })))
}

/// Insert one metadata record if its dedupe key is not present yet.
/// Returns Ok(false) for deduplicated records.
async fn import_one(
    app: &AppContext,
    section: &str,
    table: &str,
    definition: &Value,
) -> AppResult<bool> {
    match section {
        "entities" => {
            let entity = Entity::parse(definition).map_err(unprocessable)?;
            let inserted = sqlx::query(
                "INSERT INTO _entities (name, definition) VALUES ($1, $2)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&entity.name)
            .bind(definition)
            .execute(&app.pool)
            .await
            .map_err(map_db_error)?;
            migrate_entity(&app.pool, &entity).await?;
            Ok(inserted.rows_affected() > 0)
        }
        "relations" => {
            let relation = Relation::parse(definition).map_err(unprocessable)?;
            let snapshot = app.registry.get();
            let inserted = sqlx::query(
                "INSERT INTO _relations (name, definition) VALUES ($1, $2)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&relation.name)
            .bind(definition)
            .execute(&app.pool)
            .await
            .map_err(map_db_error)?;
            if relation.kind == RelationKind::ManyToMany {
                if let (Some(source), Some(target)) = (
                    snapshot.entity(&relation.source),
                    snapshot.entity(&relation.target),
                ) {
                    migrate_join_table(&app.pool, &relation, &source, &target).await?;
                }
            }
            Ok(inserted.rows_affected() > 0)
        }
        "ui_configs" => {
            let name = definition
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::BadRequest("UI config requires a name.".to_string()))?;
            let inserted = sqlx::query(
                "INSERT INTO _ui_configs (name, definition) VALUES ($1, $2)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(name)
            .bind(definition)
            .execute(&app.pool)
            .await
            .map_err(map_db_error)?;
            Ok(inserted.rows_affected() > 0)
        }
        _ => {
            validate_section_definition(section, definition)?;
            // Dedupe by definition equality for id-keyed tables.
            let exists_sql = format!("SELECT 1 FROM {table} WHERE definition = $1 LIMIT 1");
            let exists = sqlx::query(&exists_sql)
                .bind(definition)
                .fetch_optional(&app.pool)
                .await
                .map_err(map_db_error)?;
            if exists.is_some() {
                return Ok(false);
            }
            insert_definition(&app.pool, table, definition).await?;
            Ok(true)
        }
    }
}

fn validate_section_definition(section: &str, definition: &Value) -> AppResult<()> {
    let result = match section {
        "rules" => Rule::parse("import", definition).map(|_| ()),
        "state_machines" => StateMachine::parse("import", definition).map(|_| ()),
        "workflows" => Workflow::parse("import", definition).map(|_| ()),
        "permissions" => Permission::parse("import", definition).map(|_| ()),
        "webhooks" => Webhook::parse("import", definition).map(|_| ()),
        _ => Ok(()),
    };
    result.map_err(unprocessable)
}

/// Populate business tables from `sample_data`, additively.
async fn import_sample_rows(
    pool: &PgPool,
    snapshot: &crate::metadata::registry::Snapshot,
    table: &str,
    rows: &Value,
) -> AppResult<u32> {
    let table = validate_identifier(table)?.to_string();
    let known = snapshot.entities().any(|entity| entity.table == table)
        || snapshot
            .relations()
            .any(|relation| relation.join_table.as_deref() == Some(table.as_str()));
    if !known {
        return Err(AppError::BadRequest(format!(
            "Table '{table}' is not a known entity or join table."
        )));
    }

    let Some(items) = rows.as_array() else {
        return Err(AppError::BadRequest(format!(
            "sample_data for '{table}' must be an array."
        )));
    };

    let mut count = 0;
    for item in items {
        let Some(payload) = item.as_object() else {
            continue;
        };
        if payload.is_empty() {
            continue;
        }
        let mut keys: Vec<&String> = payload.keys().collect();
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
        query.push(") r ON CONFLICT DO NOTHING");

        query.build().execute(pool).await.map_err(map_db_error)?;
        count += 1;
    }
    Ok(count)
}
