//! Whitelist permission evaluation.
//!
//! Role `admin` bypasses everything. Otherwise a user needs at least one
//! policy row matching (entity, action) whose roles intersect theirs.
//! For writes the policy conditions are evaluated against the record;
//! for reads they are handed back as extra WHERE filters instead of
//! denying the request.

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::metadata::model::{ConditionOperator, PermissionAction, PermissionCondition, UserContext};
use crate::metadata::registry::Snapshot;
use crate::repository::query_planner::Filter;

/// Resolve read access. Returns the permission filters to AND into the
/// query (empty for admins and unconditional policies).
pub fn check_read(
    snapshot: &Snapshot,
    entity: &str,
    user: &UserContext,
) -> AppResult<Vec<Filter>> {
    if user.is_admin() {
        return Ok(Vec::new());
    }

    let policies = snapshot.permissions_for(entity, PermissionAction::Read);
    let matching: Vec<_> = policies
        .iter()
        .filter(|policy| user.has_any_role(&policy.roles))
        .collect();
    if matching.is_empty() {
        return Err(AppError::Forbidden(format!(
            "You are not allowed to read '{entity}'."
        )));
    }

    let filters = matching
        .iter()
        .flat_map(|policy| policy.conditions.iter().map(Filter::from_permission))
        .collect();
    Ok(filters)
}

/// Resolve write access for create/update/delete. `record` is the current
/// DB row for update/delete and the incoming payload for create. Allowed
/// iff all conditions pass for some matching policy.
pub fn check_write(
    snapshot: &Snapshot,
    entity: &str,
    action: PermissionAction,
    user: &UserContext,
    record: &Value,
) -> AppResult<()> {
    if user.is_admin() {
        return Ok(());
    }

    let policies = snapshot.permissions_for(entity, action);
    let mut saw_role_match = false;
    for policy in policies {
        if !user.has_any_role(&policy.roles) {
            continue;
        }
        saw_role_match = true;
        if policy
            .conditions
            .iter()
            .all(|condition| condition_matches(record, condition))
        {
            return Ok(());
        }
    }

    let reason = if saw_role_match {
        format!("Policy conditions deny this write on '{entity}'.")
    } else {
        let verb = match action {
            PermissionAction::Read => "read",
            PermissionAction::Create => "create",
            PermissionAction::Update => "update",
            PermissionAction::Delete => "delete",
        };
        format!("You are not allowed to {verb} '{entity}'.")
    };
    Err(AppError::Forbidden(reason))
}

/// Evaluate one condition against a record object.
pub fn condition_matches(record: &Value, condition: &PermissionCondition) -> bool {
    let actual = record.get(condition.field.as_str()).unwrap_or(&Value::Null);
    compare_values(actual, condition.operator, &condition.value)
}

pub fn compare_values(actual: &Value, operator: ConditionOperator, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Eq => loose_eq(actual, expected),
        ConditionOperator::Neq => !loose_eq(actual, expected),
        ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt | ConditionOperator::Lte => {
            let Some(ordering) = loose_cmp(actual, expected) else {
                return false;
            };
            match operator {
                ConditionOperator::Gt => ordering.is_gt(),
                ConditionOperator::Gte => ordering.is_ge(),
                ConditionOperator::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
        ConditionOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| loose_eq(actual, item)),
            other => loose_eq(actual, other),
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(items) => !items.iter().any(|item| loose_eq(actual, item)),
            other => !loose_eq(actual, other),
        },
        ConditionOperator::Like => match (actual.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => like_matches(text, pattern),
            _ => false,
        },
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn loose_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// SQL-LIKE matching with `%` wildcards.
fn like_matches(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut remainder = text;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(at) => remainder = &remainder[at + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::Permission;
    use serde_json::json;

    fn user(roles: &[&str]) -> UserContext {
        UserContext {
            id: "u1".to_string(),
            email: "user@example.com".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn snapshot_with(policy: Value) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.insert_permission(Permission::parse("p1", &policy).unwrap());
        snapshot
    }

    #[test]
    fn admin_bypasses_everything() {
        let snapshot = Snapshot::default();
        assert!(check_read(&snapshot, "invoice", &user(&["admin"])).unwrap().is_empty());
        assert!(check_write(
            &snapshot,
            "invoice",
            PermissionAction::Delete,
            &user(&["admin"]),
            &json!({}),
        )
        .is_ok());
    }

    #[test]
    fn read_without_policy_is_forbidden() {
        let snapshot = Snapshot::default();
        assert!(matches!(
            check_read(&snapshot, "invoice", &user(&["accountant"])),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn read_conditions_become_filters_not_denials() {
        let snapshot = snapshot_with(json!({
            "entity": "invoice",
            "action": "read",
            "roles": ["accountant"],
            "conditions": [{"field": "status", "operator": "in", "value": ["draft", "sent"]}],
        }));
        let filters = check_read(&snapshot, "invoice", &user(&["accountant"])).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "status");
    }

    #[test]
    fn write_conditions_evaluate_against_the_record() {
        let snapshot = snapshot_with(json!({
            "entity": "invoice",
            "action": "update",
            "roles": ["accountant"],
            "conditions": [{"field": "status", "operator": "eq", "value": "draft"}],
        }));
        let accountant = user(&["accountant"]);
        assert!(check_write(
            &snapshot,
            "invoice",
            PermissionAction::Update,
            &accountant,
            &json!({"status": "draft"}),
        )
        .is_ok());
        assert!(check_write(
            &snapshot,
            "invoice",
            PermissionAction::Update,
            &accountant,
            &json!({"status": "paid"}),
        )
        .is_err());
        assert!(check_write(
            &snapshot,
            "invoice",
            PermissionAction::Update,
            &user(&["viewer"]),
            &json!({"status": "draft"}),
        )
        .is_err());
    }

    #[test]
    fn operators() {
        let record = json!({"total": 150, "status": "sent", "number": "INV-42"});
        let condition = |field: &str, op: &str, value: Value| -> PermissionCondition {
            serde_json::from_value(json!({"field": field, "operator": op, "value": value})).unwrap()
        };
        assert!(condition_matches(&record, &condition("total", "gt", json!(100))));
        assert!(condition_matches(&record, &condition("total", "lte", json!("150"))));
        assert!(condition_matches(&record, &condition("status", "neq", json!("void"))));
        assert!(condition_matches(&record, &condition("status", "not_in", json!(["void"]))));
        assert!(condition_matches(&record, &condition("number", "like", json!("INV-%"))));
        assert!(!condition_matches(&record, &condition("number", "like", json!("%-99"))));
        assert!(condition_matches(&record, &condition("number", "like", json!("%NV%42%"))));
        assert!(!condition_matches(&record, &condition("missing", "eq", json!("x"))));
    }
}
