//! Workflow engine.
//!
//! Instances are created when a committed state transition matches a
//! workflow trigger, then advanced step by step. Every advance persists
//! the instance before moving on, so a crash resumes from the last
//! durable step. Approval steps pause the instance (optionally with a
//! deadline); the admin API or the timeout sweep resumes it. Concurrent
//! resumes are serialized with status/current_step-guarded UPDATEs.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::expr::Env;
use crate::metadata::model::{parse_timeout, StepTarget, UserContext, Workflow, WorkflowStep};
use crate::repository::sql::{map_db_error, read_row};
use crate::services::state_machine::AppliedTransition;
use crate::services::webhooks::DeliveryConfig;

/// Safety bound on a single advance call; a workflow that loops past
/// this is marked failed.
const MAX_ADVANCE_STEPS: usize = 64;

pub struct WorkflowContext<'a> {
    pub pool: &'a PgPool,
    pub snapshot: &'a crate::metadata::registry::Snapshot,
    pub webhooks: &'a DeliveryConfig,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: String,
    pub current_step: Option<String>,
    pub current_step_deadline: Option<DateTime<Utc>>,
    pub context: Map<String, Value>,
    pub history: Vec<Value>,
}

/// Create and advance instances for every workflow triggered by the
/// given committed transitions. Failures are logged, never surfaced to
/// the client; the write has already committed.
pub async fn start_for_transitions(
    ctx: &WorkflowContext<'_>,
    entity: &str,
    transitions: &[AppliedTransition],
    record: &Value,
    record_id: &str,
) {
    for transition in transitions {
        let workflows =
            ctx.snapshot
                .workflows_for_state(entity, &transition.field, &transition.to);
        for workflow in workflows {
            match start_instance(ctx, &workflow, record, record_id).await {
                Ok(instance_id) => {
                    tracing::info!(
                        workflow = %workflow.name,
                        instance_id,
                        entity,
                        to = %transition.to,
                        "Workflow instance started"
                    );
                    advance(ctx, &instance_id).await;
                }
                Err(error) => {
                    tracing::error!(
                        workflow = %workflow.name,
                        error = %error,
                        "Failed to start workflow instance"
                    );
                }
            }
        }
    }
}

async fn start_instance(
    ctx: &WorkflowContext<'_>,
    workflow: &Workflow,
    record: &Value,
    record_id: &str,
) -> AppResult<String> {
    let envelope = json!({
        "trigger": {
            "record_id": record_id,
            "record": record,
        },
    });
    let context = resolve_context(&workflow.context, &envelope);

    let row = sqlx::query(
        "INSERT INTO _workflow_instances (workflow_id, workflow_name, status, current_step, context, history)
         VALUES ($1::uuid, $2, 'running', $3, $4, '[]'::jsonb)
         RETURNING id::text AS id",
    )
    .bind(&workflow.id)
    .bind(&workflow.name)
    .bind(workflow.first_step().id())
    .bind(Value::Object(context))
    .fetch_one(ctx.pool)
    .await
    .map_err(map_db_error)?;

    row.try_get::<String, _>("id")
        .map_err(|error| AppError::Internal(format!("instance id read failed: {error}")))
}

/// Resolve the declared context mapping against the trigger envelope.
/// Each value is a dot-path into `{trigger: {record_id, record}}`.
pub fn resolve_context(mapping: &Map<String, Value>, envelope: &Value) -> Map<String, Value> {
    let mut context = Map::new();
    for (name, path) in mapping {
        let resolved = match path.as_str() {
            Some(path) => resolve_path(envelope, path),
            None => path.clone(),
        };
        context.insert(name.clone(), resolved);
    }
    context
}

fn resolve_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Drive the instance until it pauses, completes, or fails.
pub async fn advance(ctx: &WorkflowContext<'_>, instance_id: &str) {
    for _ in 0..MAX_ADVANCE_STEPS {
        let Some(mut instance) = load_running(ctx.pool, instance_id).await else {
            return;
        };

        let Some(workflow) = ctx.snapshot.workflow_by_id(&instance.workflow_id) else {
            // The definition was deleted or replaced; conservatively fail.
            fail_instance(ctx.pool, &mut instance, "workflow definition no longer exists").await;
            return;
        };

        let Some(step_id) = instance.current_step.clone() else {
            complete_instance(ctx.pool, &mut instance).await;
            return;
        };
        let Some(step) = workflow.step(&step_id) else {
            fail_instance(
                ctx.pool,
                &mut instance,
                &format!("step '{step_id}' not found"),
            )
            .await;
            return;
        };

        match step {
            WorkflowStep::Action { id, actions, then } => {
                for action in actions {
                    run_step_action(ctx, &mut instance, action);
                }
                push_history(&mut instance, id, "completed", None, None);
                if !goto(ctx.pool, &mut instance, then.clone()).await {
                    return;
                }
            }
            WorkflowStep::Condition {
                id,
                program,
                on_true,
                on_false,
                ..
            } => {
                let branch = condition_branch(program.as_ref(), &instance.context);
                push_history(
                    &mut instance,
                    id,
                    if branch { "true" } else { "false" },
                    None,
                    None,
                );
                let target = if branch { on_true } else { on_false };
                if !goto(ctx.pool, &mut instance, target.clone()).await {
                    return;
                }
            }
            WorkflowStep::Approval { id, timeout, .. } => {
                let deadline = timeout
                    .as_deref()
                    .and_then(parse_timeout)
                    .and_then(|duration| chrono::Duration::from_std(duration).ok())
                    .map(|duration| Utc::now() + duration);
                push_history(&mut instance, id, "waiting_approval", None, None);
                instance.current_step_deadline = deadline;
                persist(ctx.pool, &instance).await;
                return;
            }
        }
    }

    // Ran off the iteration budget; the definition is cyclic.
    if let Some(mut instance) = load_running(ctx.pool, instance_id).await {
        fail_instance(ctx.pool, &mut instance, "advance iteration limit exceeded").await;
    }
}

/// Null or empty conditions route to the true branch.
fn condition_branch(program: Option<&crate::expr::Program>, context: &Map<String, Value>) -> bool {
    let Some(program) = program else {
        return true;
    };
    let mut env = Map::new();
    env.insert("context".to_string(), Value::Object(context.clone()));
    match program.eval_truthy(&Env::new(&env)) {
        Ok(result) => result,
        Err(error) => {
            tracing::warn!(error = %error, "Workflow condition evaluation failed, taking false branch");
            false
        }
    }
}

fn run_step_action(ctx: &WorkflowContext<'_>, instance: &mut Instance, action: &Value) {
    let action_type = action.get("type").and_then(Value::as_str).unwrap_or("");
    match action_type {
        "set_field" => apply_set_field(instance, action),
        "webhook" => {
            let Some(url) = action.get("url").and_then(Value::as_str) else {
                return;
            };
            let body = json!({
                "event": "workflow_action",
                "workflow": instance.workflow_name,
                "instance_id": instance.id,
                "context": instance.context,
                "timestamp": Utc::now().to_rfc3339(),
            });
            let request = ctx
                .webhooks
                .client
                .post(url)
                .timeout(ctx.webhooks.timeout)
                .json(&body);
            let instance_id = instance.id.clone();
            tokio::spawn(async move {
                if let Err(error) = request.send().await {
                    tracing::warn!(instance_id, error = %error, "Workflow webhook action failed");
                }
            });
        }
        "create_record" | "send_event" => {
            tracing::info!(
                instance_id = %instance.id,
                action_type,
                "Workflow action acknowledged (no executor bound)"
            );
        }
        other => {
            tracing::warn!(action_type = other, "Unknown workflow action type, skipping");
        }
    }
}

fn apply_set_field(instance: &mut Instance, action: &Value) {
    let Some(field) = action.get("field").and_then(Value::as_str) else {
        return;
    };
    let value = action.get("value").cloned().unwrap_or(Value::Null);
    instance.context.insert(field.to_string(), value);
}

/// Route to the next step (or completion). Returns false when the
/// instance reached a terminal state and the loop should stop.
async fn goto(pool: &PgPool, instance: &mut Instance, target: StepTarget) -> bool {
    match target {
        StepTarget::End => {
            complete_instance(pool, instance).await;
            false
        }
        StepTarget::Step(next) => {
            instance.current_step = Some(next);
            instance.current_step_deadline = None;
            persist(pool, instance).await;
            true
        }
    }
}

fn push_history(
    instance: &mut Instance,
    step: &str,
    status: &str,
    by: Option<&str>,
    error: Option<&str>,
) {
    let mut entry = Map::new();
    entry.insert("step".to_string(), json!(step));
    entry.insert("status".to_string(), json!(status));
    entry.insert("at".to_string(), json!(Utc::now().to_rfc3339()));
    if let Some(by) = by {
        entry.insert("by".to_string(), json!(by));
    }
    if let Some(error) = error {
        entry.insert("error".to_string(), json!(error));
    }
    instance.history.push(Value::Object(entry));
}

async fn complete_instance(pool: &PgPool, instance: &mut Instance) {
    instance.status = "completed".to_string();
    instance.current_step = None;
    instance.current_step_deadline = None;
    persist(pool, instance).await;
}

async fn fail_instance(pool: &PgPool, instance: &mut Instance, reason: &str) {
    tracing::warn!(instance_id = %instance.id, reason, "Workflow instance failed");
    let step = instance.current_step.clone().unwrap_or_default();
    push_history(instance, &step, "failed", None, Some(reason));
    instance.status = "failed".to_string();
    instance.current_step = None;
    instance.current_step_deadline = None;
    persist(pool, instance).await;
}

async fn persist(pool: &PgPool, instance: &Instance) {
    let result = sqlx::query(
        "UPDATE _workflow_instances
         SET status = $1, current_step = $2, current_step_deadline = $3,
             context = $4, history = $5, updated_at = now()
         WHERE id = $6::uuid",
    )
    .bind(&instance.status)
    .bind(&instance.current_step)
    .bind(instance.current_step_deadline)
    .bind(Value::Object(instance.context.clone()))
    .bind(Value::Array(instance.history.clone()))
    .bind(&instance.id)
    .execute(pool)
    .await;

    if let Err(error) = result {
        tracing::error!(instance_id = %instance.id, error = %error, "Failed to persist workflow instance");
    }
}

async fn load_running(pool: &PgPool, instance_id: &str) -> Option<Instance> {
    let row = sqlx::query(
        "SELECT id::text AS id, workflow_id::text AS workflow_id, workflow_name, status,
                current_step, current_step_deadline, context, history
         FROM _workflow_instances
         WHERE id = $1::uuid AND status = 'running'",
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;

    Some(Instance {
        id: row.try_get("id").ok()?,
        workflow_id: row.try_get("workflow_id").ok()?,
        workflow_name: row.try_get("workflow_name").ok()?,
        status: row.try_get("status").ok()?,
        current_step: row
            .try_get::<Option<String>, _>("current_step")
            .ok()
            .flatten(),
        current_step_deadline: row
            .try_get::<Option<DateTime<Utc>>, _>("current_step_deadline")
            .ok()
            .flatten(),
        context: row
            .try_get::<Value, _>("context")
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        history: row
            .try_get::<Value, _>("history")
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
    })
}

/// Resolve a paused approval step. The guarded UPDATE makes concurrent
/// approve/reject calls on the same instance idempotent: only the first
/// one moves the step pointer, later ones see zero rows and get a 422.
pub async fn resolve_approval(
    ctx: &WorkflowContext<'_>,
    instance_id: &str,
    approve: bool,
    user: &UserContext,
) -> AppResult<Value> {
    let instance = load_running(ctx.pool, instance_id)
        .await
        .ok_or_else(|| AppError::NotFound("Workflow instance is not running.".to_string()))?;

    let workflow = ctx
        .snapshot
        .workflow_by_id(&instance.workflow_id)
        .ok_or_else(|| {
            AppError::UnprocessableEntity("Workflow definition no longer exists.".to_string())
        })?;
    let step_id = instance.current_step.clone().ok_or_else(|| {
        AppError::UnprocessableEntity("Instance is not paused on a step.".to_string())
    })?;
    let Some(WorkflowStep::Approval {
        on_approve,
        on_reject,
        ..
    }) = workflow.step(&step_id)
    else {
        return Err(AppError::UnprocessableEntity(
            "Current step is not an approval.".to_string(),
        ));
    };

    let target = if approve { on_approve } else { on_reject };
    let decision = if approve { "approved" } else { "rejected" };
    let history_entry = json!({
        "step": step_id,
        "status": decision,
        "by": user.id,
        "at": Utc::now().to_rfc3339(),
    });

    let (next_status, next_step) = match target {
        StepTarget::End => ("completed", None),
        StepTarget::Step(next) => ("running", Some(next.clone())),
    };

    let updated = sqlx::query(
        "UPDATE _workflow_instances
         SET status = $1, current_step = $2, current_step_deadline = NULL,
             history = history || $3::jsonb, updated_at = now()
         WHERE id = $4::uuid AND status = 'running' AND current_step = $5
         RETURNING row_to_json(_workflow_instances.*) AS row",
    )
    .bind(next_status)
    .bind(&next_step)
    .bind(Value::Array(vec![history_entry]))
    .bind(instance_id)
    .bind(&step_id)
    .fetch_optional(ctx.pool)
    .await
    .map_err(map_db_error)?;

    let row = updated.as_ref().and_then(read_row).ok_or_else(|| {
        AppError::UnprocessableEntity(
            "Instance was already resolved by a concurrent request.".to_string(),
        )
    })?;

    if next_step.is_some() {
        advance(ctx, instance_id).await;
    }

    Ok(row)
}

/// One timeout-sweep tick: route every overdue approval through its
/// `on_timeout` target (or fail the instance when none is declared).
pub async fn run_timeout_sweep(ctx: &WorkflowContext<'_>) -> u32 {
    let rows = sqlx::query(
        "SELECT id::text AS id FROM _workflow_instances
         WHERE status = 'running' AND current_step_deadline < now()
         ORDER BY current_step_deadline ASC
         LIMIT 100",
    )
    .fetch_all(ctx.pool)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(error) => {
            tracing::error!(error = %error, "Workflow timeout sweep query failed");
            return 0;
        }
    };

    let mut processed = 0;
    for row in rows {
        let Ok(instance_id) = row.try_get::<String, _>("id") else {
            continue;
        };
        timeout_instance(ctx, &instance_id).await;
        processed += 1;
    }
    processed
}

async fn timeout_instance(ctx: &WorkflowContext<'_>, instance_id: &str) {
    let Some(instance) = load_running(ctx.pool, instance_id).await else {
        return;
    };
    let Some(step_id) = instance.current_step.clone() else {
        return;
    };

    let target = ctx
        .snapshot
        .workflow_by_id(&instance.workflow_id)
        .and_then(|workflow| match workflow.step(&step_id) {
            Some(WorkflowStep::Approval { on_timeout, .. }) => Some(on_timeout.clone()),
            _ => None,
        });

    let history_entry = json!({
        "step": step_id,
        "status": "timed_out",
        "at": Utc::now().to_rfc3339(),
    });

    let (next_status, next_step) = match &target {
        Some(StepTarget::Step(next)) => ("running", Some(next.clone())),
        Some(StepTarget::End) => ("completed", None),
        None => ("failed", None),
    };

    let updated = sqlx::query(
        "UPDATE _workflow_instances
         SET status = $1, current_step = $2, current_step_deadline = NULL,
             history = history || $3::jsonb, updated_at = now()
         WHERE id = $4::uuid AND status = 'running' AND current_step = $5",
    )
    .bind(next_status)
    .bind(&next_step)
    .bind(Value::Array(vec![history_entry]))
    .bind(instance_id)
    .bind(&step_id)
    .execute(ctx.pool)
    .await;

    match updated {
        Ok(result) if result.rows_affected() > 0 => {
            tracing::info!(instance_id, status = next_status, "Workflow approval timed out");
            if next_step.is_some() {
                advance(ctx, instance_id).await;
            }
        }
        Ok(_) => {}
        Err(error) => {
            tracing::error!(instance_id, error = %error, "Failed to time out workflow instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Program;

    fn instance() -> Instance {
        Instance {
            id: "i1".to_string(),
            workflow_id: "w1".to_string(),
            workflow_name: "flow".to_string(),
            status: "running".to_string(),
            current_step: Some("s1".to_string()),
            current_step_deadline: None,
            context: Map::new(),
            history: Vec::new(),
        }
    }

    #[test]
    fn context_resolution_follows_dot_paths() {
        let mapping = serde_json::from_value::<Map<String, Value>>(json!({
            "amount": "trigger.record.total",
            "invoice_id": "trigger.record_id",
            "missing": "trigger.record.nope",
        }))
        .unwrap();
        let envelope = json!({
            "trigger": {
                "record_id": "r1",
                "record": {"total": 5000, "status": "pending_approval"},
            },
        });
        let context = resolve_context(&mapping, &envelope);
        assert_eq!(context.get("amount"), Some(&json!(5000)));
        assert_eq!(context.get("invoice_id"), Some(&json!("r1")));
        assert_eq!(context.get("missing"), Some(&Value::Null));
    }

    #[test]
    fn condition_branch_defaults_to_true() {
        let context = json!({"amount": 500}).as_object().cloned().unwrap();
        assert!(condition_branch(None, &context));

        let program = Program::compile("context.amount > 1000").unwrap();
        assert!(!condition_branch(Some(&program), &context));

        let big = json!({"amount": 5000}).as_object().cloned().unwrap();
        assert!(condition_branch(Some(&program), &big));
    }

    #[test]
    fn history_entries_carry_step_and_status() {
        let mut instance = instance();
        push_history(&mut instance, "s1", "completed", Some("u1"), None);
        push_history(&mut instance, "s2", "failed", None, Some("boom"));
        assert_eq!(instance.history.len(), 2);
        assert_eq!(instance.history[0]["step"], "s1");
        assert_eq!(instance.history[0]["by"], "u1");
        assert_eq!(instance.history[1]["error"], "boom");
        assert!(instance.history[1].get("by").is_none());
    }

    #[test]
    fn set_field_action_mutates_context() {
        let mut instance = instance();
        apply_set_field(
            &mut instance,
            &json!({"type": "set_field", "field": "escalated", "value": true}),
        );
        assert_eq!(instance.context.get("escalated"), Some(&json!(true)));

        apply_set_field(&mut instance, &json!({"type": "set_field"}));
        assert_eq!(instance.context.len(), 1);
    }
}
