//! Idempotent creation of the system tables an app database needs before
//! the registry can load. Runs on first touch of every app and on every
//! process start; every statement is `IF NOT EXISTS`.

use sqlx::PgPool;

use crate::error::{AppError, AppResult};

const SYSTEM_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _entities (
        name text PRIMARY KEY,
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _relations (
        name text PRIMARY KEY,
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _rules (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _permissions (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _state_machines (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _workflows (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _workflow_instances (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        workflow_id uuid NOT NULL,
        workflow_name text NOT NULL,
        status text NOT NULL DEFAULT 'running',
        current_step text,
        current_step_deadline timestamptz,
        context jsonb NOT NULL DEFAULT '{}'::jsonb,
        history jsonb NOT NULL DEFAULT '[]'::jsonb,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS _workflow_instances_deadline_idx
        ON _workflow_instances (current_step_deadline)
        WHERE status = 'running' AND current_step_deadline IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS _webhooks (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _webhook_logs (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        webhook_id uuid NOT NULL,
        entity text NOT NULL,
        hook text NOT NULL,
        url text NOT NULL,
        method text NOT NULL,
        request_headers jsonb NOT NULL DEFAULT '{}'::jsonb,
        request_body jsonb,
        response_status integer,
        response_body text,
        status text NOT NULL DEFAULT 'pending',
        attempt integer NOT NULL DEFAULT 0,
        max_attempts integer NOT NULL DEFAULT 3,
        backoff text NOT NULL DEFAULT 'exponential',
        next_retry_at timestamptz,
        error text,
        idempotency_key uuid NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS _webhook_logs_retry_idx
        ON _webhook_logs (next_retry_at)
        WHERE status = 'retrying'",
    "CREATE TABLE IF NOT EXISTS _users (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        email text NOT NULL UNIQUE,
        password_hash text NOT NULL,
        roles jsonb NOT NULL DEFAULT '[]'::jsonb,
        active boolean NOT NULL DEFAULT true,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _refresh_tokens (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        user_id uuid NOT NULL,
        token_hash text NOT NULL UNIQUE,
        expires_at timestamptz NOT NULL,
        revoked_at timestamptz,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _invites (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        email text NOT NULL,
        roles jsonb NOT NULL DEFAULT '[]'::jsonb,
        token text NOT NULL UNIQUE,
        expires_at timestamptz NOT NULL,
        accepted_at timestamptz,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _files (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        name text NOT NULL,
        mime_type text NOT NULL DEFAULT 'application/octet-stream',
        size_bytes bigint NOT NULL DEFAULT 0,
        path text NOT NULL,
        created_by uuid,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _ui_configs (
        name text PRIMARY KEY,
        definition jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS _audit_log (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        entity text NOT NULL,
        record_id text,
        action text NOT NULL,
        user_id text,
        before jsonb,
        after jsonb,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS _audit_log_entity_idx
        ON _audit_log (entity, record_id)",
];

const PLATFORM_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _apps (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        name text NOT NULL UNIQUE,
        display_name text NOT NULL DEFAULT '',
        db_url text NOT NULL,
        jwt_secret text NOT NULL,
        active boolean NOT NULL DEFAULT true,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
];

/// Create the per-app system tables. Safe to run on every start.
pub async fn bootstrap_app_tables(pool: &PgPool) -> AppResult<()> {
    run_statements(pool, SYSTEM_TABLES).await
}

/// Create the platform management tables (`_apps`).
pub async fn bootstrap_platform_tables(pool: &PgPool) -> AppResult<()> {
    run_statements(pool, PLATFORM_TABLES).await
}

async fn run_statements(pool: &PgPool, statements: &[&str]) -> AppResult<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await.map_err(|error| {
            tracing::error!(error = %error, "System table bootstrap failed");
            AppError::Dependency("System table bootstrap failed.".to_string())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_idempotent() {
        for statement in SYSTEM_TABLES.iter().chain(PLATFORM_TABLES) {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "not idempotent: {statement}"
            );
        }
    }

    #[test]
    fn covers_all_system_tables() {
        let ddl = SYSTEM_TABLES.join("\n");
        for table in [
            "_entities",
            "_relations",
            "_rules",
            "_permissions",
            "_state_machines",
            "_workflows",
            "_workflow_instances",
            "_webhooks",
            "_webhook_logs",
            "_users",
            "_refresh_tokens",
            "_invites",
            "_files",
            "_ui_configs",
            "_audit_log",
        ] {
            assert!(ddl.contains(table), "missing {table}");
        }
    }
}
