//! Workflow runtime endpoints: list pending instances, inspect one, and
//! resolve paused approvals.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::authenticate;
use crate::error::{AppError, AppResult};
use crate::services::workflows::{resolve_approval, WorkflowContext};
use crate::state::AppState;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/_workflows/pending", axum::routing::get(list_pending))
        .route("/_workflows/{id}", axum::routing::get(get_instance))
        .route("/_workflows/{id}/approve", axum::routing::post(approve))
        .route("/_workflows/{id}/reject", axum::routing::post(reject))
}

async fn list_pending(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    let user = authenticate(&state, &app, &headers)?;
    require_admin(&user)?;

    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM _workflow_instances t
         WHERE status = 'running' AND current_step IS NOT NULL
         ORDER BY created_at DESC
         LIMIT 100",
    )
    .fetch_all(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let data = crate::repository::sql::read_rows(rows);
    Ok(Json(json!({ "data": data })))
}

async fn get_instance(
    State(state): State<AppState>,
    Path((app_name, instance_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    let user = authenticate(&state, &app, &headers)?;
    require_admin(&user)?;

    let row = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _workflow_instances t WHERE id = $1::uuid",
    )
    .bind(&instance_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let instance = row
        .as_ref()
        .and_then(crate::repository::sql::read_row)
        .ok_or_else(|| AppError::NotFound("Workflow instance not found.".to_string()))?;
    Ok(Json(json!({ "data": instance })))
}

async fn approve(
    State(state): State<AppState>,
    Path((app_name, instance_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    resolve(state, app_name, instance_id, headers, true).await
}

async fn reject(
    State(state): State<AppState>,
    Path((app_name, instance_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    resolve(state, app_name, instance_id, headers, false).await
}

async fn resolve(
    state: AppState,
    app_name: String,
    instance_id: String,
    headers: HeaderMap,
    approve: bool,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    let user = authenticate(&state, &app, &headers)?;
    require_admin(&user)?;

    let snapshot = app.registry.get();
    let delivery = state.delivery_config(&app);
    let ctx = WorkflowContext {
        pool: &app.pool,
        snapshot: &snapshot,
        webhooks: &delivery,
    };
    let instance = resolve_approval(&ctx, &instance_id, approve, &user).await?;
    Ok(Json(json!({ "data": instance })))
}

fn require_admin(user: &crate::metadata::model::UserContext) -> AppResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Workflow administration requires the admin role.".to_string(),
        ))
    }
}
