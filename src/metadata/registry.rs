//! Hot-reloadable schema of record for one app.
//!
//! All metadata (entities, relations, rules, state machines, workflows,
//! webhooks, permissions) lives in one immutable [`Snapshot`]. Readers
//! clone an `Arc` and never block each other; `reload` builds a complete
//! replacement off to the side and swaps it in under a short write lock.
//! Compiled expression programs ride on the metadata objects, so a swap
//! retires them together with the snapshot that owns them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::metadata::model::{
    Entity, HookKind, Permission, PermissionAction, Relation, Rule, RuleHook, StateMachine,
    Webhook, Workflow,
};

#[derive(Default)]
pub struct Snapshot {
    entities: HashMap<String, Arc<Entity>>,
    relations: HashMap<String, Arc<Relation>>,
    rules: HashMap<(String, RuleHook), Vec<Arc<Rule>>>,
    state_machines: HashMap<String, Vec<Arc<StateMachine>>>,
    workflows: Vec<Arc<Workflow>>,
    webhooks: HashMap<(String, HookKind), Vec<Arc<Webhook>>>,
    permissions: HashMap<(String, PermissionAction), Vec<Arc<Permission>>>,
}

impl Snapshot {
    pub fn entity(&self, name: &str) -> Option<Arc<Entity>> {
        self.entities.get(name).cloned()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values()
    }

    pub fn relation(&self, name: &str) -> Option<Arc<Relation>> {
        self.relations.get(name).cloned()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Arc<Relation>> {
        self.relations.values()
    }

    /// Relations whose source side is the given entity.
    pub fn relations_of(&self, entity: &str) -> Vec<Arc<Relation>> {
        let mut relations: Vec<Arc<Relation>> = self
            .relations
            .values()
            .filter(|relation| relation.source == entity)
            .cloned()
            .collect();
        relations.sort_by(|a, b| a.name.cmp(&b.name));
        relations
    }

    pub fn rules_for(&self, entity: &str, hook: RuleHook) -> &[Arc<Rule>] {
        self.rules
            .get(&(entity.to_string(), hook))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn state_machines_for(&self, entity: &str) -> &[Arc<StateMachine>] {
        self.state_machines
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn workflows(&self) -> &[Arc<Workflow>] {
        &self.workflows
    }

    pub fn workflow_by_name(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.iter().find(|w| w.name == name).cloned()
    }

    pub fn workflow_by_id(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.iter().find(|w| w.id == id).cloned()
    }

    /// Active workflows triggered by `entity.field` entering state `to`.
    pub fn workflows_for_state(&self, entity: &str, field: &str, to: &str) -> Vec<Arc<Workflow>> {
        self.workflows
            .iter()
            .filter(|workflow| {
                workflow.active
                    && workflow.trigger.trigger_type == "state_change"
                    && workflow.trigger.entity == entity
                    && workflow.trigger.field == field
                    && workflow.trigger.to == to
            })
            .cloned()
            .collect()
    }

    pub fn webhooks_for(&self, entity: &str, hook: HookKind) -> &[Arc<Webhook>] {
        self.webhooks
            .get(&(entity.to_string(), hook))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn permissions_for(&self, entity: &str, action: PermissionAction) -> &[Arc<Permission>] {
        self.permissions
            .get(&(entity.to_string(), action))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
impl Snapshot {
    pub fn insert_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.name.clone(), Arc::new(entity));
    }

    pub fn insert_relation(&mut self, relation: Relation) {
        self.relations
            .insert(relation.name.clone(), Arc::new(relation));
    }

    pub fn insert_rule(&mut self, rule: Rule) {
        self.rules
            .entry((rule.entity.clone(), rule.hook))
            .or_default()
            .push(Arc::new(rule));
    }

    pub fn insert_state_machine(&mut self, machine: StateMachine) {
        self.state_machines
            .entry(machine.entity.clone())
            .or_default()
            .push(Arc::new(machine));
    }

    pub fn insert_workflow(&mut self, workflow: Workflow) {
        self.workflows.push(Arc::new(workflow));
    }

    pub fn insert_webhook(&mut self, webhook: Webhook) {
        self.webhooks
            .entry((webhook.entity.clone(), webhook.hook))
            .or_default()
            .push(Arc::new(webhook));
    }

    pub fn insert_permission(&mut self, permission: Permission) {
        self.permissions
            .entry((permission.entity.clone(), permission.action))
            .or_default()
            .push(Arc::new(permission));
    }
}

pub struct Registry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Current snapshot. In-flight requests keep their clone across a swap.
    pub fn get(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read all system metadata rows, parse and compile, then swap.
    /// Any failure leaves the previous snapshot untouched.
    pub async fn reload(&self, pool: &PgPool) -> AppResult<()> {
        let snapshot = load_snapshot(pool).await?;
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
        Ok(())
    }
}

async fn load_snapshot(pool: &PgPool) -> AppResult<Snapshot> {
    let mut snapshot = Snapshot::default();

    for (name, definition) in fetch_definitions(pool, "_entities", "name").await? {
        let entity = Entity::parse(&definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        snapshot.entities.insert(name, Arc::new(entity));
    }

    for (name, definition) in fetch_definitions(pool, "_relations", "name").await? {
        let relation = Relation::parse(&definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        snapshot.relations.insert(name, Arc::new(relation));
    }

    for (id, definition) in fetch_definitions(pool, "_rules", "id::text").await? {
        let rule = Rule::parse(&id, &definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        if !rule.active {
            continue;
        }
        snapshot
            .rules
            .entry((rule.entity.clone(), rule.hook))
            .or_default()
            .push(Arc::new(rule));
    }
    for rules in snapshot.rules.values_mut() {
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    }

    for (id, definition) in fetch_definitions(pool, "_state_machines", "id::text").await? {
        let machine = StateMachine::parse(&id, &definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        if !machine.active {
            continue;
        }
        snapshot
            .state_machines
            .entry(machine.entity.clone())
            .or_default()
            .push(Arc::new(machine));
    }

    for (id, definition) in fetch_definitions(pool, "_workflows", "id::text").await? {
        let workflow = Workflow::parse(&id, &definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        snapshot.workflows.push(Arc::new(workflow));
    }

    for (id, definition) in fetch_definitions(pool, "_webhooks", "id::text").await? {
        let webhook = Webhook::parse(&id, &definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        if !webhook.active {
            continue;
        }
        snapshot
            .webhooks
            .entry((webhook.entity.clone(), webhook.hook))
            .or_default()
            .push(Arc::new(webhook));
    }

    for (id, definition) in fetch_definitions(pool, "_permissions", "id::text").await? {
        let permission = Permission::parse(&id, &definition)
            .map_err(|error| AppError::Internal(format!("registry: {error}")))?;
        snapshot
            .permissions
            .entry((permission.entity.clone(), permission.action))
            .or_default()
            .push(Arc::new(permission));
    }

    tracing::info!(
        entities = snapshot.entities.len(),
        relations = snapshot.relations.len(),
        workflows = snapshot.workflows.len(),
        "Registry loaded"
    );

    Ok(snapshot)
}

async fn fetch_definitions(
    pool: &PgPool,
    table: &str,
    key_expr: &str,
) -> AppResult<Vec<(String, Value)>> {
    let sql = format!("SELECT {key_expr} AS key, definition FROM {table} ORDER BY 1");
    let rows = sqlx::query(&sql).fetch_all(pool).await.map_err(|error| {
        tracing::error!(error = %error, table, "Failed to read metadata table");
        AppError::Dependency(format!("Failed to read {table}."))
    })?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key: String = row
            .try_get("key")
            .map_err(|error| AppError::Internal(format!("metadata key read failed: {error}")))?;
        let definition: Value = row
            .try_get("definition")
            .map_err(|error| AppError::Internal(format!("metadata definition read failed: {error}")))?;
        out.push((key, definition));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with_rules() -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (id, priority) in [("b", 10), ("a", 10), ("c", 1)] {
            let rule = Rule::parse(
                id,
                &json!({
                    "entity": "invoice",
                    "hook": "before_write",
                    "type": "expression",
                    "definition": {"expression": "record.total < 0"},
                    "priority": priority,
                }),
            )
            .unwrap();
            snapshot
                .rules
                .entry(("invoice".to_string(), RuleHook::BeforeWrite))
                .or_default()
                .push(Arc::new(rule));
        }
        for rules in snapshot.rules.values_mut() {
            rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        }
        snapshot
    }

    #[test]
    fn rules_order_by_priority_then_id() {
        let snapshot = snapshot_with_rules();
        let ids: Vec<&str> = snapshot
            .rules_for("invoice", RuleHook::BeforeWrite)
            .iter()
            .map(|rule| rule.id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(snapshot.rules_for("invoice", RuleHook::BeforeDelete).len(), 0);
    }

    #[test]
    fn swap_is_visible_to_new_readers_only() {
        let registry = Registry::empty();
        let before = registry.get();
        {
            let mut guard = registry.snapshot.write().unwrap();
            *guard = Arc::new(snapshot_with_rules());
        }
        let after = registry.get();
        assert_eq!(before.rules_for("invoice", RuleHook::BeforeWrite).len(), 0);
        assert_eq!(after.rules_for("invoice", RuleHook::BeforeWrite).len(), 3);
    }

    #[test]
    fn workflow_trigger_matching() {
        let mut snapshot = Snapshot::default();
        let workflow = Workflow::parse(
            "wf1",
            &json!({
                "name": "invoice_approval",
                "trigger": {"type": "state_change", "entity": "invoice", "field": "status", "to": "pending_approval"},
                "steps": [{"type": "action", "id": "s1", "actions": [], "then": "end"}],
            }),
        )
        .unwrap();
        snapshot.workflows.push(Arc::new(workflow));

        assert_eq!(
            snapshot
                .workflows_for_state("invoice", "status", "pending_approval")
                .len(),
            1
        );
        assert!(snapshot
            .workflows_for_state("invoice", "status", "sent")
            .is_empty());
        assert!(snapshot
            .workflows_for_state("order", "status", "pending_approval")
            .is_empty());
    }
}
