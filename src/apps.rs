//! Multi-app manager.
//!
//! A management database (`_apps`) describes the tenant apps. Each app
//! gets a lazily-created context holding its own connection pool,
//! metadata registry, and JWT secret. First touch bootstraps the system
//! tables, seeds the default admin user, and loads the registry.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::config::PlatformConfig;
use crate::error::{AppError, AppResult};
use crate::metadata::registry::Registry;
use crate::repository::bootstrap::{bootstrap_app_tables, bootstrap_platform_tables};

pub struct AppContext {
    pub name: String,
    pub pool: PgPool,
    pub registry: Registry,
    pub jwt_secret: String,
}

pub struct AppManager {
    platform_pool: PgPool,
    config: PlatformConfig,
    contexts: RwLock<HashMap<String, Arc<AppContext>>>,
}

impl AppManager {
    /// Connect the management database and make sure `_apps` exists.
    pub async fn connect(config: &PlatformConfig) -> AppResult<AppManager> {
        let url = config.platform_db_url.as_deref().ok_or_else(|| {
            AppError::Dependency(
                "Platform database is not configured. Set PLATFORM_DB_URL or DATABASE_URL."
                    .to_string(),
            )
        })?;

        let platform_pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size.min(10))
            .connect(url)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, "Failed to connect platform database");
                AppError::Dependency("Failed to connect the platform database.".to_string())
            })?;
        bootstrap_platform_tables(&platform_pool).await?;

        Ok(AppManager {
            platform_pool,
            config: config.clone(),
            contexts: RwLock::new(HashMap::new()),
        })
    }

    pub fn platform_pool(&self) -> &PgPool {
        &self.platform_pool
    }

    /// Contexts that have been touched since process start. Schedulers
    /// fan out over these; an app nobody has called yet has no pending
    /// retries or instances in memory to drive.
    pub async fn active_contexts(&self) -> Vec<Arc<AppContext>> {
        self.contexts.read().await.values().cloned().collect()
    }

    /// Resolve an app by name, bootstrapping it on first touch.
    pub async fn get(&self, app_name: &str) -> AppResult<Arc<AppContext>> {
        validate_app_name(app_name)?;

        if let Some(context) = self.contexts.read().await.get(app_name) {
            return Ok(context.clone());
        }

        let row = sqlx::query(
            "SELECT name, db_url, jwt_secret FROM _apps WHERE name = $1 AND active = true",
        )
        .bind(app_name)
        .fetch_optional(&self.platform_pool)
        .await
        .map_err(crate::repository::sql::map_db_error)?;

        let Some(row) = row else {
            return Err(AppError::NotFound(format!("Unknown app '{app_name}'.")));
        };
        let db_url: String = row
            .try_get("db_url")
            .map_err(|error| AppError::Internal(format!("app row read failed: {error}")))?;
        let jwt_secret: String = row
            .try_get("jwt_secret")
            .map_err(|error| AppError::Internal(format!("app row read failed: {error}")))?;

        let context = self.bootstrap_context(app_name, &db_url, jwt_secret).await?;

        let mut contexts = self.contexts.write().await;
        // Another request may have finished bootstrap while we did.
        if let Some(existing) = contexts.get(app_name) {
            return Ok(existing.clone());
        }
        contexts.insert(app_name.to_string(), context.clone());
        Ok(context)
    }

    async fn bootstrap_context(
        &self,
        app_name: &str,
        db_url: &str,
        jwt_secret: String,
    ) -> AppResult<Arc<AppContext>> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.db_pool_size)
            .connect(db_url)
            .await
            .map_err(|error| {
                tracing::error!(app = app_name, error = %error, "Failed to connect app database");
                AppError::Dependency(format!("Failed to connect database for app '{app_name}'."))
            })?;

        bootstrap_app_tables(&pool).await?;
        seed_default_admin(&pool, &self.config).await?;

        let registry = Registry::empty();
        registry.reload(&pool).await?;

        tracing::info!(app = app_name, "App context bootstrapped");
        Ok(Arc::new(AppContext {
            name: app_name.to_string(),
            pool,
            registry,
            jwt_secret,
        }))
    }
}

async fn seed_default_admin(pool: &PgPool, config: &PlatformConfig) -> AppResult<()> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT 1::bigint FROM _users WHERE lower(email) = lower($1)")
            .bind(&config.default_admin_email)
            .fetch_optional(pool)
            .await
            .map_err(crate::repository::sql::map_db_error)?;
    if existing.is_some() {
        return Ok(());
    }

    let password_hash = crate::auth::hash_password(&config.default_admin_password)?;
    sqlx::query(
        "INSERT INTO _users (email, password_hash, roles)
         VALUES ($1, $2, '[\"admin\"]'::jsonb)
         ON CONFLICT (email) DO NOTHING",
    )
    .bind(&config.default_admin_email)
    .bind(&password_hash)
    .execute(pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    tracing::info!(email = %config.default_admin_email, "Seeded default admin user");
    Ok(())
}

fn validate_app_name(name: &str) -> AppResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("Invalid app name '{name}'.")))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_app_name;

    #[test]
    fn app_name_validation() {
        assert!(validate_app_name("demo").is_ok());
        assert!(validate_app_name("my-app_2").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("Demo").is_err());
        assert!(validate_app_name("a/b").is_err());
        assert!(validate_app_name(&"x".repeat(65)).is_err());
    }
}
