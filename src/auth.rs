//! Authentication: JWT issuance and dual-secret validation, bcrypt
//! password checks, and rotating refresh tokens.
//!
//! A request token is validated against the app's secret first; on
//! failure it falls back to the platform secret. Platform tokens carry
//! cross-app admin access, app tokens are scoped to their app. Refresh
//! tokens are opaque UUIDs stored hashed; refreshing rotates the pair
//! and invalidates the old token.

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use crate::apps::AppContext;
use crate::error::{AppError, AppResult};
use crate::metadata::model::UserContext;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub roles: Vec<String>,
    /// App the token is scoped to; absent on platform tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    pub scope: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|error| AppError::Internal(format!("password hashing failed: {error}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

fn hash_refresh_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn issue_access_token(
    secret: &str,
    user: &UserContext,
    app: &str,
    ttl_minutes: i64,
) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        roles: user.roles.clone(),
        app: Some(app.to_string()),
        scope: "app".to_string(),
        exp: (now + Duration::minutes(ttl_minutes)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|error| AppError::Internal(format!("token encoding failed: {error}")))
}

fn decode_with(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token.".to_string()))
}

/// Authenticate a request against an app: app secret first, platform
/// secret as fallback. Platform tokens act as cross-app admins.
pub fn authenticate(
    state: &AppState,
    app: &AppContext,
    headers: &HeaderMap,
) -> AppResult<UserContext> {
    let token = bearer_token(headers)?;

    if let Some(claims) = decode_with(&app.jwt_secret, token) {
        if claims.scope == "app" && claims.app.as_deref() == Some(app.name.as_str()) {
            return Ok(UserContext {
                id: claims.sub,
                email: claims.email,
                roles: claims.roles,
            });
        }
    }

    if let Some(claims) = decode_with(&state.config.platform_jwt_secret, token) {
        if claims.scope == "platform" {
            let mut roles = claims.roles;
            if !roles.iter().any(|role| role == "admin") {
                roles.push("admin".to_string());
            }
            return Ok(UserContext {
                id: claims.sub,
                email: claims.email,
                roles,
            });
        }
    }

    Err(AppError::Unauthorized(
        "Invalid or expired token.".to_string(),
    ))
}

/// Verify credentials against `_users` and return the user context.
pub async fn check_credentials(
    pool: &PgPool,
    email: &str,
    password: &str,
) -> AppResult<UserContext> {
    let row = sqlx::query(
        "SELECT id::text AS id, email, password_hash, roles
         FROM _users
         WHERE lower(email) = lower($1) AND active = true
         LIMIT 1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let Some(row) = row else {
        // Burn a comparison anyway so the timing does not reveal
        // whether the account exists.
        let _ = verify_password(password, "$2b$12$invalidinvalidinvalidinvalidinvalidinvalia");
        return Err(AppError::Unauthorized("Invalid credentials.".to_string()));
    };

    let hash: String = row.try_get("password_hash").unwrap_or_default();
    if !verify_password(password, &hash) {
        return Err(AppError::Unauthorized("Invalid credentials.".to_string()));
    }

    Ok(user_from_row(&row))
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserContext {
    let roles = row
        .try_get::<Value, _>("roles")
        .ok()
        .and_then(|value| serde_json::from_value::<Vec<String>>(value).ok())
        .unwrap_or_default();
    UserContext {
        id: row.try_get("id").unwrap_or_default(),
        email: row.try_get("email").unwrap_or_default(),
        roles,
    }
}

/// Issue a fresh access/refresh pair for the user, persisting the
/// hashed refresh token.
pub async fn issue_token_pair(
    state: &AppState,
    app: &AppContext,
    user: &UserContext,
) -> AppResult<TokenPair> {
    let access_token = issue_access_token(
        &app.jwt_secret,
        user,
        &app.name,
        state.config.access_token_ttl_minutes,
    )?;

    let refresh_token = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(state.config.refresh_token_ttl_days);
    sqlx::query(
        "INSERT INTO _refresh_tokens (user_id, token_hash, expires_at)
         VALUES ($1::uuid, $2, $3)",
    )
    .bind(&user.id)
    .bind(hash_refresh_token(&refresh_token))
    .bind(expires_at)
    .execute(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    Ok(TokenPair {
        access_token,
        refresh_token,
        expires_in: state.config.access_token_ttl_minutes * 60,
    })
}

/// Rotate a refresh token: revoke the presented one and return a new
/// pair for its user. Expired, revoked, or unknown tokens are rejected.
pub async fn rotate_refresh_token(
    state: &AppState,
    app: &AppContext,
    refresh_token: &str,
) -> AppResult<(UserContext, TokenPair)> {
    let token_hash = hash_refresh_token(refresh_token);

    let row = sqlx::query(
        "UPDATE _refresh_tokens
         SET revoked_at = now()
         WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > now()
         RETURNING user_id::text AS user_id",
    )
    .bind(&token_hash)
    .fetch_optional(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let Some(row) = row else {
        return Err(AppError::Unauthorized(
            "Refresh token is invalid or expired.".to_string(),
        ));
    };
    let user_id: String = row
        .try_get("user_id")
        .map_err(|error| AppError::Internal(format!("refresh token user read failed: {error}")))?;

    let user_row = sqlx::query(
        "SELECT id::text AS id, email, password_hash, roles
         FROM _users WHERE id = $1::uuid AND active = true",
    )
    .bind(&user_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?
    .ok_or_else(|| AppError::Unauthorized("User is no longer active.".to_string()))?;

    let user = user_from_row(&user_row);
    let pair = issue_token_pair(state, app, &user).await?;
    Ok((user, pair))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserContext {
        UserContext {
            id: "2a5ec16c-32c2-4d45-a4ca-59758a0ee92f".to_string(),
            email: "user@example.com".to_string(),
            roles: vec!["accountant".to_string()],
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn access_token_round_trip() {
        let token = issue_access_token("secret-1", &user(), "demo", 15).unwrap();
        let claims = decode_with("secret-1", &token).unwrap();
        assert_eq!(claims.sub, user().id);
        assert_eq!(claims.app.as_deref(), Some("demo"));
        assert_eq!(claims.scope, "app");
        assert!(decode_with("other-secret", &token).is_none());
    }

    #[test]
    fn refresh_token_hashing_is_deterministic() {
        let a = hash_refresh_token("token-a");
        assert_eq!(a, hash_refresh_token("token-a"));
        assert_ne!(a, hash_refresh_token("token-b"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");
        headers.insert(axum::http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }
}
