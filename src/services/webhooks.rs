//! Webhook dispatcher.
//!
//! Sync webhooks (`async=false`) run inside the write transaction and can
//! veto it; their delivery log row commits or rolls back with the write.
//! Async webhooks enqueue a `_webhook_logs` row after commit and deliver
//! in a background task, with retries driven by the per-app scheduler.
//! Payloads are signed with HMAC-SHA256 over the request body.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use sqlx::{PgConnection, PgPool, Row};

use crate::error::{AppError, AppResult, ValidationDetail};
use crate::expr::Env;
use crate::metadata::model::{Backoff, HookKind, UserContext, Webhook};
use crate::metadata::registry::Snapshot;
use crate::repository::sql::map_db_error;

/// Everything a delivery needs besides the log row itself.
#[derive(Clone)]
pub struct DeliveryConfig {
    pub client: reqwest::Client,
    pub signing_secret: String,
    pub timeout: Duration,
}

/// Delay before the next attempt, where `attempt` is the 1-based number
/// of the attempt that just failed.
pub fn backoff_delay(backoff: Backoff, attempt: i32) -> Duration {
    let base = 30u64;
    match backoff {
        Backoff::Linear => Duration::from_secs(base),
        Backoff::Exponential => {
            let exponent = attempt.max(1) - 1;
            Duration::from_secs(base.saturating_mul(1u64 << exponent.min(16)))
        }
    }
}

/// `{event, entity, action, record, old, changes, user, timestamp,
/// idempotency_key}` — the body every webhook receives.
pub fn build_payload(
    entity: &str,
    hook: HookKind,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
    idempotency_key: &str,
) -> Value {
    json!({
        "event": hook_name(hook),
        "entity": entity,
        "action": action,
        "record": record,
        "old": old.cloned().unwrap_or(Value::Null),
        "changes": diff_changes(old, record),
        "user": user.to_value(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "idempotency_key": idempotency_key,
    })
}

pub fn hook_name(hook: HookKind) -> &'static str {
    match hook {
        HookKind::BeforeWrite => "before_write",
        HookKind::AfterWrite => "after_write",
        HookKind::BeforeDelete => "before_delete",
        HookKind::AfterDelete => "after_delete",
    }
}

/// Fields present in the new record that differ from the old one.
fn diff_changes(old: Option<&Value>, record: &Value) -> Value {
    let Some(new_map) = record.as_object() else {
        return json!({});
    };
    let old_map = old.and_then(Value::as_object);
    let mut changes = Map::new();
    for (key, value) in new_map {
        let previous = old_map.and_then(|m| m.get(key));
        if previous != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    Value::Object(changes)
}

/// Evaluate the webhook's optional condition over its environment.
pub fn should_fire(webhook: &Webhook, payload: &Value) -> bool {
    let Some(program) = &webhook.condition_program else {
        return true;
    };
    let Some(vars) = payload.as_object() else {
        return true;
    };
    match program.eval_truthy(&Env::new(vars)) {
        Ok(result) => result,
        Err(error) => {
            tracing::warn!(webhook_id = %webhook.id, error = %error, "Webhook condition failed, skipping");
            false
        }
    }
}

/// Replace `{{env.VAR}}` placeholders in configured header values.
pub fn interpolate_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), interpolate_env(value)))
        .collect()
}

fn interpolate_env(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("{{env.") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 6..];
        match after.find("}}") {
            Some(end) => {
                let var = after[..end].trim();
                result.push_str(&std::env::var(var).unwrap_or_default());
                rest = &after[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                return result;
            }
        }
    }
    result.push_str(rest);
    result
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Fire all matching sync webhooks inside the transaction. A non-2xx
/// response or transport error vetoes the write.
#[allow(clippy::too_many_arguments)]
pub async fn fire_sync_hooks(
    tx: &mut PgConnection,
    config: &DeliveryConfig,
    snapshot: &Snapshot,
    entity: &str,
    hook: HookKind,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
) -> AppResult<()> {
    for webhook in snapshot.webhooks_for(entity, hook) {
        if webhook.async_delivery {
            continue;
        }
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let payload = build_payload(entity, hook, action, record, old, user, &idempotency_key);
        if !should_fire(webhook, &payload) {
            continue;
        }

        let outcome = deliver(config, webhook.method.as_str(), &webhook.url, &webhook.headers, &payload).await;
        let (status_code, response_body, error) = match &outcome {
            Ok((status, body)) => (Some(*status), Some(body.clone()), None),
            Err(message) => (None, None, Some(message.clone())),
        };
        let delivered = matches!(outcome, Ok((status, _)) if (200..300).contains(&status));

        insert_log_row(
            &mut *tx,
            webhook,
            entity,
            &payload,
            &idempotency_key,
            if delivered { "delivered" } else { "failed" },
            1,
            status_code,
            response_body.as_deref(),
            error.as_deref(),
            None,
        )
        .await?;

        if !delivered {
            let reason = error.unwrap_or_else(|| {
                format!("endpoint answered {}", status_code.unwrap_or_default())
            });
            return Err(AppError::Validation(vec![ValidationDetail {
                field: None,
                relation: None,
                rule: Some("WEBHOOK_REJECTED".to_string()),
                index: None,
                message: format!(
                    "Webhook '{}' on {} rejected the write: {reason}.",
                    webhook.id,
                    hook_name(hook)
                ),
            }]));
        }
    }
    Ok(())
}

/// Insert pending log rows for matching async webhooks and spawn their
/// first delivery attempt. Called after the write transaction commits.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_async_hooks(
    pool: &PgPool,
    config: &DeliveryConfig,
    snapshot: &Snapshot,
    entity: &str,
    hook: HookKind,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
) {
    for webhook in snapshot.webhooks_for(entity, hook) {
        if !webhook.async_delivery {
            continue;
        }
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let payload = build_payload(entity, hook, action, record, old, user, &idempotency_key);
        if !should_fire(webhook, &payload) {
            continue;
        }

        let inserted = insert_log_row(
            pool,
            webhook,
            entity,
            &payload,
            &idempotency_key,
            "pending",
            0,
            None,
            None,
            None,
            None,
        )
        .await;

        match inserted {
            Ok(log_id) => {
                let pool = pool.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    attempt_delivery(&pool, &config, &log_id).await;
                });
            }
            Err(error) => {
                tracing::error!(webhook_id = %webhook.id, error = %error, "Failed to enqueue webhook");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_log_row<'e, E>(
    executor: E,
    webhook: &Webhook,
    entity: &str,
    payload: &Value,
    idempotency_key: &str,
    status: &str,
    attempt: i32,
    response_status: Option<u16>,
    response_body: Option<&str>,
    error: Option<&str>,
    next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
) -> AppResult<String>
where
    E: sqlx::PgExecutor<'e>,
{
    let headers = interpolate_headers(&webhook.headers);
    let row = sqlx::query(
        "INSERT INTO _webhook_logs (
            webhook_id, entity, hook, url, method, request_headers, request_body,
            response_status, response_body, status, attempt, max_attempts,
            backoff, next_retry_at, error, idempotency_key
         ) VALUES ($1::uuid, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16::uuid)
         RETURNING id::text AS id",
    )
    .bind(&webhook.id)
    .bind(entity)
    .bind(hook_name(webhook.hook))
    .bind(&webhook.url)
    .bind(&webhook.method)
    .bind(serde_json::to_value(&headers).unwrap_or_default())
    .bind(payload)
    .bind(response_status.map(|s| s as i32))
    .bind(response_body)
    .bind(status)
    .bind(attempt)
    .bind(webhook.retry.max_attempts)
    .bind(match webhook.retry.backoff {
        Backoff::Exponential => "exponential",
        Backoff::Linear => "linear",
    })
    .bind(next_retry_at)
    .bind(error)
    .bind(idempotency_key)
    .fetch_one(executor)
    .await
    .map_err(map_db_error)?;

    row.try_get::<String, _>("id")
        .map_err(|error| AppError::Internal(format!("webhook log id read failed: {error}")))
}

async fn deliver(
    config: &DeliveryConfig,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    payload: &Value,
) -> Result<(u16, String), String> {
    let body = serde_json::to_vec(payload).map_err(|error| error.to_string())?;
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut request = config
        .client
        .request(method, url)
        .timeout(config.timeout)
        .header("content-type", "application/json")
        .header("x-rocket-signature", sign_body(&config.signing_secret, &body))
        .header(
            "x-rocket-event",
            payload.get("event").and_then(Value::as_str).unwrap_or(""),
        )
        .header(
            "x-rocket-delivery",
            payload
                .get("idempotency_key")
                .and_then(Value::as_str)
                .unwrap_or(""),
        );
    for (name, value) in interpolate_headers(headers) {
        request = request.header(name, value);
    }

    let response = request.body(body).send().await.map_err(|error| error.to_string())?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    Ok((status, text))
}

/// Run one delivery attempt for a pending/retrying log row and persist
/// the outcome.
pub async fn attempt_delivery(pool: &PgPool, config: &DeliveryConfig, log_id: &str) {
    let row = sqlx::query(
        "SELECT url, method, request_headers, request_body, attempt, max_attempts, backoff
         FROM _webhook_logs
         WHERE id = $1::uuid AND status IN ('pending', 'retrying')",
    )
    .bind(log_id)
    .fetch_optional(pool)
    .await;

    let row = match row {
        Ok(Some(row)) => row,
        Ok(None) => return,
        Err(error) => {
            tracing::error!(log_id, error = %error, "Failed to load webhook log row");
            return;
        }
    };

    let url: String = row.try_get("url").unwrap_or_default();
    let method: String = row.try_get("method").unwrap_or_else(|_| "POST".to_string());
    let headers: HashMap<String, String> = row
        .try_get::<Value, _>("request_headers")
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let payload: Value = row.try_get("request_body").unwrap_or(Value::Null);
    let attempt: i32 = row.try_get("attempt").unwrap_or(0);
    let max_attempts: i32 = row.try_get("max_attempts").unwrap_or(3);
    let backoff = match row.try_get::<String, _>("backoff").as_deref() {
        Ok("linear") => Backoff::Linear,
        _ => Backoff::Exponential,
    };

    let outcome = deliver(config, &method, &url, &headers, &payload).await;
    let this_attempt = attempt + 1;
    let delivered = matches!(outcome, Ok((status, _)) if (200..300).contains(&status));

    let (status_text, next_retry_at) = if delivered {
        ("delivered", None)
    } else if this_attempt < max_attempts {
        let delay = backoff_delay(backoff, this_attempt);
        (
            "retrying",
            Some(chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()),
        )
    } else {
        ("failed", None)
    };

    let (response_status, response_body, error_text) = match &outcome {
        Ok((status, body)) => (Some(*status as i32), Some(body.clone()), None),
        Err(message) => (None, None, Some(message.clone())),
    };

    let updated = sqlx::query(
        "UPDATE _webhook_logs
         SET status = $1, attempt = $2, response_status = $3, response_body = $4,
             error = $5, next_retry_at = $6, updated_at = now()
         WHERE id = $7::uuid AND status IN ('pending', 'retrying')",
    )
    .bind(status_text)
    .bind(this_attempt)
    .bind(response_status)
    .bind(response_body)
    .bind(error_text)
    .bind(next_retry_at)
    .bind(log_id)
    .execute(pool)
    .await;

    match updated {
        Ok(_) => {
            if !delivered {
                tracing::warn!(
                    log_id,
                    attempt = this_attempt,
                    max_attempts,
                    status = status_text,
                    "Webhook delivery attempt failed"
                );
            }
        }
        Err(error) => {
            tracing::error!(log_id, error = %error, "Failed to persist webhook delivery outcome");
        }
    }
}

/// One retry-scheduler tick: deliver due retrying rows, oldest first.
pub async fn run_retry_sweep(pool: &PgPool, config: &DeliveryConfig, batch: i64) -> u32 {
    let rows = sqlx::query(
        "SELECT id::text AS id FROM _webhook_logs
         WHERE status = 'retrying' AND next_retry_at < now()
         ORDER BY next_retry_at ASC
         LIMIT $1",
    )
    .bind(batch)
    .fetch_all(pool)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(error) => {
            tracing::error!(error = %error, "Webhook retry sweep query failed");
            return 0;
        }
    };

    let mut processed = 0;
    for row in rows {
        if let Ok(id) = row.try_get::<String, _>("id") {
            attempt_delivery(pool, config, &id).await;
            processed += 1;
        }
    }
    processed
}

/// Move a failed or stuck log row back into the retry queue immediately.
pub async fn retry_now(pool: &PgPool, log_id: &str) -> AppResult<Value> {
    let row = sqlx::query(
        "UPDATE _webhook_logs
         SET status = 'retrying', next_retry_at = now(), updated_at = now()
         WHERE id = $1::uuid AND status IN ('failed', 'retrying')
         RETURNING row_to_json(_webhook_logs.*) AS row",
    )
    .bind(log_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    row.as_ref()
        .and_then(crate::repository::sql::read_row)
        .ok_or_else(|| {
            AppError::NotFound("Webhook log not found or not in a retryable state.".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn webhook(condition: Option<&str>) -> Webhook {
        let mut definition = json!({
            "entity": "invoice",
            "hook": "after_write",
            "url": "https://example.com/hook",
            "headers": {"x-api-key": "{{env.ROCKET_TEST_HOOK_KEY}}"},
        });
        if let Some(condition) = condition {
            definition["condition"] = json!(condition);
        }
        Webhook::parse("wh1", &definition).unwrap()
    }

    fn user() -> UserContext {
        UserContext {
            id: "u1".to_string(),
            email: "user@example.com".to_string(),
            roles: vec!["admin".to_string()],
        }
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(
            backoff_delay(Backoff::Exponential, 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            backoff_delay(Backoff::Exponential, 2),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff_delay(Backoff::Exponential, 3),
            Duration::from_secs(120)
        );
        assert_eq!(backoff_delay(Backoff::Linear, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(Backoff::Linear, 5), Duration::from_secs(30));
    }

    #[test]
    fn payload_contains_changes_diff() {
        let old = json!({"status": "draft", "total": 100});
        let record = json!({"status": "sent", "total": 100});
        let payload = build_payload(
            "invoice",
            HookKind::AfterWrite,
            "update",
            &record,
            Some(&old),
            &user(),
            "key-1",
        );
        assert_eq!(payload["event"], "after_write");
        assert_eq!(payload["changes"], json!({"status": "sent"}));
        assert_eq!(payload["idempotency_key"], "key-1");
    }

    #[test]
    fn condition_gates_firing() {
        let record = json!({"status": "sent"});
        let old = json!({"status": "draft"});
        let payload = build_payload(
            "invoice",
            HookKind::AfterWrite,
            "update",
            &record,
            Some(&old),
            &user(),
            "key-1",
        );
        assert!(should_fire(&webhook(None), &payload));
        assert!(should_fire(
            &webhook(Some("changes.status != null")),
            &payload
        ));
        assert!(!should_fire(
            &webhook(Some("record.status == 'paid'")),
            &payload
        ));
    }

    #[test]
    fn header_interpolation_reads_env() {
        std::env::set_var("ROCKET_TEST_HOOK_KEY", "secret-123");
        let headers = interpolate_headers(&webhook(None).headers);
        assert_eq!(headers.get("x-api-key").map(String::as_str), Some("secret-123"));
        assert_eq!(interpolate_env("static"), "static");
        assert_eq!(interpolate_env("{{env.ROCKET_TEST_HOOK_KEY}}-x"), "secret-123-x");
    }

    #[test]
    fn signature_is_stable_hex() {
        let signature = sign_body("secret", b"payload");
        assert_eq!(signature.len(), 64);
        assert_eq!(signature, sign_body("secret", b"payload"));
        assert_ne!(signature, sign_body("other", b"payload"));
    }
}
