use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(state.manager.platform_pool())
        .await
        .is_ok();
    Json(json!({
        "status": "ok",
        "database": if db_ok { "up" } else { "down" },
    }))
}
