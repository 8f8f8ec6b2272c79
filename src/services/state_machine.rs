//! State-machine enforcement inside the write pipeline.
//!
//! For each active machine on the entity: default the field on create,
//! check transition legality / roles / guard on change, and run the
//! transition actions. `set_field` and `create_record` take effect inside
//! the surrounding transaction; `webhook` and `send_event` are deferred
//! until after commit.

use serde_json::{Map, Value};

use crate::error::{AppError, AppResult, ValidationDetail};
use crate::expr::Env;
use crate::metadata::model::{Entity, StateMachine, Transition, UserContext};
use crate::metadata::registry::Snapshot;

/// A state change accepted by a machine; drives workflow triggers after
/// commit.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub field: String,
    pub from: Option<String>,
    pub to: String,
}

/// Transition actions that fire after the transaction commits.
#[derive(Debug, Clone)]
pub enum DeferredAction {
    Webhook(Value),
    SendEvent(Value),
}

/// A `create_record` action to execute inside the transaction.
#[derive(Debug, Clone)]
pub struct RecordCreate {
    pub entity: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct TransitionOutcome {
    pub transitions: Vec<AppliedTransition>,
    pub deferred: Vec<DeferredAction>,
    pub record_creates: Vec<RecordCreate>,
}

/// Apply every active machine on the entity to the pending fields.
pub fn apply_state_machines(
    snapshot: &Snapshot,
    entity: &Entity,
    fields: &mut Map<String, Value>,
    old: Option<&Value>,
    action: &str,
    user: &UserContext,
) -> AppResult<TransitionOutcome> {
    let mut outcome = TransitionOutcome::default();

    for machine in snapshot.state_machines_for(&entity.name) {
        apply_machine(machine, fields, old, action, user, &mut outcome)?;
    }

    Ok(outcome)
}

fn apply_machine(
    machine: &StateMachine,
    fields: &mut Map<String, Value>,
    old: Option<&Value>,
    action: &str,
    user: &UserContext,
    outcome: &mut TransitionOutcome,
) -> AppResult<()> {
    let field = machine.field.as_str();
    let incoming = fields
        .get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .filter(|value| !value.is_empty());

    if action == "create" {
        let Some(target) = incoming else {
            fields.insert(field.to_string(), Value::String(machine.initial.clone()));
            return Ok(());
        };
        if target == machine.initial {
            return Ok(());
        }
        // Creating directly in a non-initial state must follow a legal
        // transition out of the initial state.
        let transition = machine.transition_for(&machine.initial, &target).ok_or_else(|| {
            invalid_transition(field, &machine.initial, &target)
        })?;
        accept_transition(
            machine, transition, field, Some(machine.initial.clone()), &target, fields, old, user,
            outcome,
        )?;
        return Ok(());
    }

    // Update path: nothing to do unless the field actually changes.
    let Some(target) = incoming else {
        return Ok(());
    };
    let current = old
        .and_then(|row| row.get(field))
        .and_then(Value::as_str)
        .unwrap_or(&machine.initial)
        .to_string();
    if current == target {
        return Ok(());
    }

    let transition = machine
        .transition_for(&current, &target)
        .ok_or_else(|| invalid_transition(field, &current, &target))?;
    accept_transition(
        machine, transition, field, Some(current), &target, fields, old, user, outcome,
    )
}

#[allow(clippy::too_many_arguments)]
fn accept_transition(
    machine: &StateMachine,
    transition: &Transition,
    field: &str,
    from: Option<String>,
    to: &str,
    fields: &mut Map<String, Value>,
    old: Option<&Value>,
    user: &UserContext,
    outcome: &mut TransitionOutcome,
) -> AppResult<()> {
    if !transition.roles.is_empty() && !user.is_admin() && !user.has_any_role(&transition.roles) {
        return Err(AppError::Forbidden(format!(
            "Transition to '{to}' requires one of roles: {}.",
            transition.roles.join(", ")
        )));
    }

    if let Some(guard) = &transition.guard_program {
        let env_vars = guard_env(fields, old, user);
        let passed = guard
            .eval_truthy(&Env::new(&env_vars))
            .map_err(|error| {
                AppError::Validation(vec![ValidationDetail::field(
                    field,
                    machine.id.clone(),
                    format!("Transition guard failed: {error}"),
                )])
            })?;
        if !passed {
            return Err(AppError::Validation(vec![ValidationDetail::field(
                field,
                machine.id.clone(),
                format!("Transition guard rejected the change to '{to}'."),
            )]));
        }
    }

    for action in &transition.actions {
        run_action(action, fields, old, outcome);
    }

    outcome.transitions.push(AppliedTransition {
        field: field.to_string(),
        from,
        to: to.to_string(),
    });
    Ok(())
}

fn run_action(
    action: &Value,
    fields: &mut Map<String, Value>,
    old: Option<&Value>,
    outcome: &mut TransitionOutcome,
) {
    let action_type = action.get("type").and_then(Value::as_str).unwrap_or("");
    match action_type {
        "set_field" => {
            let Some(field) = action.get("field").and_then(Value::as_str) else {
                return;
            };
            let value = action.get("value").cloned().unwrap_or(Value::Null);
            let resolved = if value.as_str() == Some("now") {
                Value::String(chrono::Utc::now().to_rfc3339())
            } else {
                value
            };
            fields.insert(field.to_string(), resolved);
        }
        "webhook" => {
            outcome.deferred.push(DeferredAction::Webhook(action.clone()));
        }
        "send_event" => {
            outcome.deferred.push(DeferredAction::SendEvent(action.clone()));
        }
        "create_record" => {
            let Some(target_entity) = action.get("entity").and_then(Value::as_str) else {
                return;
            };
            let template = action
                .get("fields")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let record = resolve_record_template(&template, fields, old);
            outcome.record_creates.push(RecordCreate {
                entity: target_entity.to_string(),
                fields: record,
            });
        }
        other => {
            tracing::warn!(action_type = other, "Unknown transition action type, skipping");
        }
    }
}

/// String values of the form `{{field}}` copy the named field from the
/// pending record; everything else passes through verbatim.
fn resolve_record_template(
    template: &Map<String, Value>,
    fields: &Map<String, Value>,
    old: Option<&Value>,
) -> Map<String, Value> {
    let mut record = Map::new();
    for (key, value) in template {
        let resolved = match value.as_str() {
            Some(text) if text.starts_with("{{") && text.ends_with("}}") => {
                let reference = text[2..text.len() - 2].trim();
                fields
                    .get(reference)
                    .cloned()
                    .or_else(|| old.and_then(|row| row.get(reference).cloned()))
                    .unwrap_or(Value::Null)
            }
            _ => value.clone(),
        };
        record.insert(key.clone(), resolved);
    }
    record
}

fn guard_env(
    fields: &Map<String, Value>,
    old: Option<&Value>,
    user: &UserContext,
) -> Map<String, Value> {
    let mut record = old
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in fields {
        record.insert(key.clone(), value.clone());
    }

    let mut env = Map::new();
    env.insert("record".to_string(), Value::Object(record));
    env.insert("old".to_string(), old.cloned().unwrap_or(Value::Null));
    env.insert("user".to_string(), user.to_value());
    env.insert(
        "now".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    env
}

fn invalid_transition(field: &str, from: &str, to: &str) -> AppError {
    AppError::Validation(vec![ValidationDetail::field(
        field,
        "state_machine",
        format!("Invalid transition '{from}' -> '{to}'."),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> Entity {
        Entity::parse(&json!({
            "name": "invoice",
            "table": "invoices",
            "primary_key": {"field": "id", "type": "uuid", "generated": true},
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "status", "type": "string"},
                {"name": "total", "type": "decimal", "precision": 2},
                {"name": "sent_at", "type": "timestamp"},
            ],
        }))
        .unwrap()
    }

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.insert_state_machine(
            StateMachine::parse(
                "sm1",
                &json!({
                    "entity": "invoice",
                    "field": "status",
                    "definition": {
                        "initial": "draft",
                        "transitions": [
                            {
                                "from": "draft",
                                "to": "sent",
                                "roles": ["accountant"],
                                "actions": [{"type": "set_field", "field": "sent_at", "value": "now"}],
                            },
                            {"from": "sent", "to": "paid", "guard": "record.total > 0"},
                            {
                                "from": "sent",
                                "to": "pending_approval",
                                "actions": [{"type": "webhook", "url": "https://example.com"}],
                            },
                        ],
                    },
                }),
            )
            .unwrap(),
        );
        snapshot
    }

    fn user(roles: &[&str]) -> UserContext {
        UserContext {
            id: "u1".to_string(),
            email: "user@example.com".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn create_defaults_to_initial_state() {
        let entity = entity();
        let mut fields = Map::new();
        let outcome = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            None,
            "create",
            &user(&["accountant"]),
        )
        .unwrap();
        assert_eq!(fields.get("status"), Some(&json!("draft")));
        assert!(outcome.transitions.is_empty());
    }

    #[test]
    fn legal_transition_runs_set_field_action() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("sent"));
        let old = json!({"status": "draft", "total": 100});
        let outcome = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["accountant"]),
        )
        .unwrap();
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].to, "sent");
        assert!(fields.contains_key("sent_at"));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("paid"));
        let old = json!({"status": "draft", "total": 100});
        let error = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["accountant"]),
        )
        .unwrap_err();
        assert!(matches!(error, AppError::Validation(_)));
    }

    #[test]
    fn role_check_yields_forbidden() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("sent"));
        let old = json!({"status": "draft", "total": 100});
        let error = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["viewer"]),
        )
        .unwrap_err();
        assert!(matches!(error, AppError::Forbidden(_)));
    }

    #[test]
    fn admin_bypasses_transition_roles() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("sent"));
        let old = json!({"status": "draft", "total": 100});
        assert!(apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["admin"]),
        )
        .is_ok());
    }

    #[test]
    fn guard_rejects_falsy_result() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("paid"));
        let old = json!({"status": "sent", "total": 0});
        let error = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["accountant"]),
        )
        .unwrap_err();
        assert!(matches!(error, AppError::Validation(_)));

        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("paid"));
        let old = json!({"status": "sent", "total": 50});
        assert!(apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["accountant"]),
        )
        .is_ok());
    }

    #[test]
    fn webhook_actions_are_deferred() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("pending_approval"));
        let old = json!({"status": "sent", "total": 100});
        let outcome = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["accountant"]),
        )
        .unwrap();
        assert_eq!(outcome.deferred.len(), 1);
        assert!(matches!(outcome.deferred[0], DeferredAction::Webhook(_)));
    }

    #[test]
    fn unchanged_field_is_a_no_op() {
        let entity = entity();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("draft"));
        let old = json!({"status": "draft", "total": 100});
        let outcome = apply_state_machines(
            &snapshot(),
            &entity,
            &mut fields,
            Some(&old),
            "update",
            &user(&["viewer"]),
        )
        .unwrap();
        assert!(outcome.transitions.is_empty());
    }

    #[test]
    fn create_record_template_resolution() {
        let mut template = Map::new();
        template.insert("invoice_number".to_string(), json!("{{number}}"));
        template.insert("kind".to_string(), json!("receipt"));
        let mut fields = Map::new();
        fields.insert("number".to_string(), json!("INV-7"));
        let record = resolve_record_template(&template, &fields, None);
        assert_eq!(record.get("invoice_number"), Some(&json!("INV-7")));
        assert_eq!(record.get("kind"), Some(&json!("receipt")));
    }
}
