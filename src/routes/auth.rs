use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use sqlx::Row;

use crate::auth::{
    authenticate, check_credentials, hash_password, issue_token_pair, rotate_refresh_token,
};
use crate::error::{AppError, AppResult};
use crate::metadata::model::UserContext;
use crate::schemas::{validate_input, AcceptInviteInput, LoginInput, RefreshInput};
use crate::state::AppState;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/auth/login", axum::routing::post(login))
        .route("/auth/refresh", axum::routing::post(refresh))
        .route("/auth/accept-invite", axum::routing::post(accept_invite))
        .route("/auth/me", axum::routing::get(me))
}

async fn login(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    Json(payload): Json<LoginInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let app = state.manager.get(&app_name).await?;

    let user = check_credentials(&app.pool, &payload.email, &payload.password).await?;
    let pair = issue_token_pair(&state, &app, &user).await?;

    Ok(Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "expires_in": pair.expires_in,
        "user": user.to_value(),
    })))
}

async fn refresh(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    Json(payload): Json<RefreshInput>,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    let (user, pair) = rotate_refresh_token(&state, &app, &payload.refresh_token).await?;

    Ok(Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "expires_in": pair.expires_in,
        "user": user.to_value(),
    })))
}

async fn accept_invite(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    Json(payload): Json<AcceptInviteInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let app = state.manager.get(&app_name).await?;

    let invite = sqlx::query(
        "SELECT id::text AS id, email, roles
         FROM _invites
         WHERE token = $1 AND accepted_at IS NULL AND expires_at > now()
         LIMIT 1",
    )
    .bind(&payload.token)
    .fetch_optional(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?
    .ok_or_else(|| AppError::NotFound("Invite not found or expired.".to_string()))?;

    let invite_id: String = invite.try_get("id").unwrap_or_default();
    let email: String = invite.try_get("email").unwrap_or_default();
    let roles: Vec<String> = invite
        .try_get::<Value, _>("roles")
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let password_hash = hash_password(&payload.password)?;
    let created = sqlx::query(
        "INSERT INTO _users (email, password_hash, roles)
         VALUES ($1, $2, $3)
         ON CONFLICT (email) DO NOTHING
         RETURNING id::text AS id",
    )
    .bind(&email)
    .bind(&password_hash)
    .bind(serde_json::to_value(&roles).unwrap_or_default())
    .fetch_optional(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let Some(created) = created else {
        return Err(AppError::Conflict(format!(
            "A user with email '{email}' already exists."
        )));
    };
    let user_id: String = created.try_get("id").unwrap_or_default();

    sqlx::query("UPDATE _invites SET accepted_at = now() WHERE id = $1::uuid")
        .bind(&invite_id)
        .execute(&app.pool)
        .await
        .map_err(crate::repository::sql::map_db_error)?;

    let user = UserContext {
        id: user_id,
        email,
        roles,
    };
    let pair = issue_token_pair(&state, &app, &user).await?;

    Ok(Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "expires_in": pair.expires_in,
        "user": user.to_value(),
    })))
}

async fn me(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    let user = authenticate(&state, &app, &headers)?;
    Ok(Json(json!({ "data": user.to_value() })))
}
