//! Rule engine for the write pipeline.
//!
//! Active rules for (entity, hook) run in `(priority, id)` order. Field
//! and expression rules validate and accumulate errors; computed rules
//! run afterwards and assign into the pending field map. A truthy
//! expression result means "rule violated".

use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::{AppError, AppResult, ValidationDetail};
use crate::expr::Env;
use crate::metadata::model::{Entity, Rule, RuleHook, RuleType, UserContext};
use crate::metadata::registry::Snapshot;
use crate::repository::query_planner::{run_list, Filter, FilterOp, ListQuery};
use crate::services::permissions::compare_values;

/// Run all rules for one hook. Mutates `fields` (computed rules) and
/// returns accumulated validation details.
pub async fn run_rules(
    pool: &PgPool,
    snapshot: &Snapshot,
    entity: &Entity,
    hook: RuleHook,
    fields: &mut Map<String, Value>,
    old: Option<&Value>,
    action: &str,
    user: &UserContext,
) -> AppResult<Vec<ValidationDetail>> {
    let rules = snapshot.rules_for(&entity.name, hook);
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let related = load_related(pool, snapshot, rules, fields, old).await?;
    let mut errors = Vec::new();

    for rule in rules {
        if matches!(rule.rule_type, RuleType::Computed) {
            continue;
        }
        let env_vars = build_env(entity, fields, old, action, user, &related);
        match evaluate_rule(rule, fields, &env_vars) {
            Ok(()) => {}
            Err(detail) => {
                errors.push(detail);
                if rule.stop_on_fail {
                    return Ok(errors);
                }
            }
        }
    }

    if !errors.is_empty() {
        return Ok(errors);
    }

    // Computed rules run once validation has passed.
    for rule in rules {
        if !matches!(rule.rule_type, RuleType::Computed) {
            continue;
        }
        let env_vars = build_env(entity, fields, old, action, user, &related);
        apply_computed(rule, fields, &env_vars)?;
    }

    Ok(errors)
}

fn evaluate_rule(
    rule: &Rule,
    fields: &Map<String, Value>,
    env_vars: &Map<String, Value>,
) -> Result<(), ValidationDetail> {
    match rule.rule_type {
        RuleType::Field => {
            let Some(field) = rule.target_field() else {
                return Ok(());
            };
            let operator = rule
                .definition
                .get("operator")
                .and_then(Value::as_str)
                .and_then(parse_operator);
            let Some(operator) = operator else {
                return Ok(());
            };
            let expected = rule
                .definition
                .get("value")
                .cloned()
                .unwrap_or(Value::Null);
            let actual = fields.get(field).cloned().unwrap_or(Value::Null);
            if compare_values(&actual, operator, &expected) {
                Ok(())
            } else {
                Err(ValidationDetail::field(
                    field,
                    rule.id.clone(),
                    rule.message().map(ToOwned::to_owned).unwrap_or_else(|| {
                        format!("Field '{field}' failed validation.")
                    }),
                ))
            }
        }
        RuleType::Expression => {
            let Some(program) = &rule.program else {
                return Ok(());
            };
            let violated = program
                .eval_truthy(&Env::new(env_vars))
                .map_err(|error| {
                    ValidationDetail::field(
                        rule.target_field().unwrap_or("_"),
                        rule.id.clone(),
                        format!("Rule expression failed: {error}"),
                    )
                })?;
            if violated {
                Err(ValidationDetail::field(
                    rule.target_field().unwrap_or("_"),
                    rule.id.clone(),
                    rule.message()
                        .map(ToOwned::to_owned)
                        .unwrap_or_else(|| "Validation rule violated.".to_string()),
                ))
            } else {
                Ok(())
            }
        }
        RuleType::Computed => Ok(()),
    }
}

fn apply_computed(
    rule: &Rule,
    fields: &mut Map<String, Value>,
    env_vars: &Map<String, Value>,
) -> AppResult<()> {
    let (Some(program), Some(target)) = (&rule.program, rule.target_field()) else {
        return Ok(());
    };
    let value = program.eval(&Env::new(env_vars)).map_err(|error| {
        AppError::Validation(vec![ValidationDetail::field(
            target,
            rule.id.clone(),
            format!("Computed rule failed: {error}"),
        )])
    })?;
    fields.insert(target.to_string(), value);
    Ok(())
}

fn parse_operator(raw: &str) -> Option<crate::metadata::model::ConditionOperator> {
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

/// Build the rule environment: `record` is old-state merged with the
/// pending fields, so expressions can reference unchanged columns.
fn build_env(
    entity: &Entity,
    fields: &Map<String, Value>,
    old: Option<&Value>,
    action: &str,
    user: &UserContext,
    related: &Map<String, Value>,
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
    env.insert(
        "old".to_string(),
        old.cloned().unwrap_or(Value::Null),
    );
    env.insert("action".to_string(), Value::String(action.to_string()));
    env.insert("user".to_string(), user.to_value());
    env.insert(
        "now".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    env.insert("entity".to_string(), Value::String(entity.name.clone()));
    if !related.is_empty() {
        env.insert("related".to_string(), Value::Object(related.clone()));
    }
    env
}

/// Pre-fetch the relations any rule declares in `related_load`, once per
/// relation name, keyed under `related.<relation>` in the environment.
async fn load_related(
    pool: &PgPool,
    snapshot: &Snapshot,
    rules: &[std::sync::Arc<Rule>],
    fields: &Map<String, Value>,
    old: Option<&Value>,
) -> AppResult<Map<String, Value>> {
    let mut related = Map::new();

    for rule in rules {
        for load in &rule.related_load {
            if related.contains_key(&load.relation) {
                continue;
            }
            let Some(relation) = snapshot.relation(&load.relation) else {
                continue;
            };
            let Some(target) = snapshot.entity(&relation.target) else {
                continue;
            };
            let Some(target_key) = relation.target_key.as_deref() else {
                continue;
            };

            // The FK value comes from the pending fields or the old row.
            let parent_key = fields
                .get(relation.source_key.as_str())
                .cloned()
                .or_else(|| {
                    old.and_then(|value| value.get(relation.source_key.as_str()).cloned())
                });
            let Some(parent_key) = parent_key.filter(|v| !v.is_null()) else {
                related.insert(load.relation.clone(), Value::Array(vec![]));
                continue;
            };

            let mut filters = vec![Filter {
                field: target_key.to_string(),
                op: FilterOp::Eq,
                value: parent_key,
            }];
            if let Some(extra) = &load.filter {
                for (field, value) in extra {
                    filters.push(Filter {
                        field: field.clone(),
                        op: FilterOp::Eq,
                        value: value.clone(),
                    });
                }
            }

            let list = ListQuery {
                filters,
                page: 1,
                per_page: crate::repository::query_planner::MAX_PER_PAGE,
                ..Default::default()
            };
            let (rows, _) = run_list(pool, &target, &list, &[]).await?;
            related.insert(load.relation.clone(), Value::Array(rows));
        }
    }

    Ok(related)
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
                {"name": "number", "type": "string"},
                {"name": "status", "type": "string"},
                {"name": "total", "type": "decimal", "precision": 2},
                {"name": "vat", "type": "decimal", "precision": 2},
            ],
        }))
        .unwrap()
    }

    fn user() -> UserContext {
        UserContext {
            id: "u1".to_string(),
            email: "user@example.com".to_string(),
            roles: vec!["accountant".to_string()],
        }
    }

    fn env_for(fields: &Map<String, Value>, old: Option<&Value>) -> Map<String, Value> {
        build_env(&entity(), fields, old, "update", &user(), &Map::new())
    }

    #[test]
    fn field_rule_violation_uses_rule_message() {
        let rule = Rule::parse(
            "r1",
            &json!({
                "entity": "invoice",
                "hook": "before_write",
                "type": "field",
                "definition": {"field": "total", "operator": "gte", "value": 0, "message": "total must not be negative"},
            }),
        )
        .unwrap();

        let mut fields = Map::new();
        fields.insert("total".to_string(), json!(-5));
        let env = env_for(&fields, None);
        let detail = evaluate_rule(&rule, &fields, &env).unwrap_err();
        assert_eq!(detail.field.as_deref(), Some("total"));
        assert_eq!(detail.message, "total must not be negative");

        fields.insert("total".to_string(), json!(10));
        let env = env_for(&fields, None);
        assert!(evaluate_rule(&rule, &fields, &env).is_ok());
    }

    #[test]
    fn expression_rule_truthy_means_violation() {
        let rule = Rule::parse(
            "r2",
            &json!({
                "entity": "invoice",
                "hook": "before_write",
                "type": "expression",
                "definition": {"expression": "record.total > 10000 && action == 'update'", "field": "total"},
            }),
        )
        .unwrap();

        let mut fields = Map::new();
        fields.insert("total".to_string(), json!(20000));
        let env = env_for(&fields, None);
        assert!(evaluate_rule(&rule, &fields, &env).is_err());

        fields.insert("total".to_string(), json!(100));
        let env = env_for(&fields, None);
        assert!(evaluate_rule(&rule, &fields, &env).is_ok());
    }

    #[test]
    fn non_boolean_result_coerces_through_truthy() {
        let rule = Rule::parse(
            "r3",
            &json!({
                "entity": "invoice",
                "hook": "before_write",
                "type": "expression",
                "definition": {"expression": "record.total % 2"},
            }),
        )
        .unwrap();
        let mut fields = Map::new();
        fields.insert("total".to_string(), json!(3));
        let env = env_for(&fields, None);
        assert!(evaluate_rule(&rule, &fields, &env).is_err());

        fields.insert("total".to_string(), json!(4));
        let env = env_for(&fields, None);
        assert!(evaluate_rule(&rule, &fields, &env).is_ok());
    }

    #[test]
    fn computed_rule_assigns_into_fields() {
        let rule = Rule::parse(
            "r4",
            &json!({
                "entity": "invoice",
                "hook": "before_write",
                "type": "computed",
                "definition": {"field": "vat", "expression": "record.total * 0.1"},
            }),
        )
        .unwrap();

        let mut fields = Map::new();
        fields.insert("total".to_string(), json!(100));
        let env = env_for(&fields, None);
        apply_computed(&rule, &mut fields, &env).unwrap();
        assert_eq!(fields.get("vat"), Some(&json!(10)));
    }

    #[test]
    fn record_env_merges_old_with_pending_fields() {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("sent"));
        let old = json!({"status": "draft", "number": "INV-1"});
        let env = env_for(&fields, Some(&old));
        let record = env.get("record").unwrap();
        assert_eq!(record.get("status"), Some(&json!("sent")));
        assert_eq!(record.get("number"), Some(&json!("INV-1")));
        assert_eq!(env.get("old").unwrap().get("status"), Some(&json!("draft")));
    }
}
