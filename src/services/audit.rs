//! Audit trail. One row per accepted write, inserted inside the write
//! transaction so a rollback discards it together with the change.

use serde_json::Value;
use sqlx::PgConnection;

use crate::error::AppResult;
use crate::metadata::model::UserContext;
use crate::repository::sql::map_db_error;

pub async fn record(
    tx: &mut PgConnection,
    entity: &str,
    record_id: &str,
    action: &str,
    user: &UserContext,
    before: Option<&Value>,
    after: Option<&Value>,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO _audit_log (entity, record_id, action, user_id, before, after)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(entity)
    .bind(record_id)
    .bind(action)
    .bind(&user.id)
    .bind(before)
    .bind(after)
    .execute(tx)
    .await
    .map_err(map_db_error)?;
    Ok(())
}
