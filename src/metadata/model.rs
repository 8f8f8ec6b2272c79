//! Typed metadata records. Administrators store these as JSON in the
//! system tables; the registry parses them into the structs below and
//! compiles any embedded expressions at load time.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::expr::Program;

/// `[a-z][a-z0-9_]*` — the only shape ever allowed into SQL identifiers.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Int,
    Bigint,
    Float,
    Decimal,
    Boolean,
    Uuid,
    Timestamp,
    Date,
    Json,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    Create,
    Update,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub auto: Option<AutoMode>,
    #[serde(default)]
    pub slug: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PrimaryKey {
    pub field: String,
    #[serde(rename = "type", default = "default_pk_type")]
    pub key_type: FieldType,
    #[serde(default = "default_true")]
    pub generated: bool,
}

fn default_pk_type() -> FieldType {
    FieldType::Uuid
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Entity {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub soft_delete: bool,
    pub fields: Vec<Field>,
    /// Name of the field used for slug lookups, if any. A field marked
    /// `slug: true` is the equivalent shorthand.
    #[serde(default)]
    pub slug: Option<String>,
}

impl Entity {
    pub fn parse(definition: &Value) -> Result<Entity, String> {
        let entity: Entity = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid entity definition: {error}"))?;
        entity.validate()?;
        Ok(entity)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.name) {
            return Err(format!("entity name '{}' is not a valid identifier", self.name));
        }
        if !is_valid_name(&self.table) {
            return Err(format!("table name '{}' is not a valid identifier", self.table));
        }
        if self.fields.is_empty() {
            return Err(format!("entity '{}' declares no fields", self.name));
        }
        for field in &self.fields {
            if !is_valid_name(&field.name) {
                return Err(format!(
                    "field name '{}' on entity '{}' is not a valid identifier",
                    field.name, self.name
                ));
            }
            if field.field_type == FieldType::Decimal && field.precision.is_none() {
                return Err(format!(
                    "decimal field '{}' on entity '{}' requires a precision",
                    field.name, self.name
                ));
            }
        }
        if self.field(&self.primary_key.field).is_none() {
            return Err(format!(
                "primary key field '{}' is not declared on entity '{}'",
                self.primary_key.field, self.name
            ));
        }
        let slug_count = self.fields.iter().filter(|f| f.slug).count();
        if slug_count > 1 {
            return Err(format!("entity '{}' declares more than one slug field", self.name));
        }
        if let Some(slug) = &self.slug {
            if self.field(slug).is_none() {
                return Err(format!(
                    "slug field '{slug}' is not declared on entity '{}'",
                    self.name
                ));
            }
            if slug_count == 1 && self.fields.iter().find(|f| f.slug).map(|f| f.name.as_str())
                != Some(slug.as_str())
            {
                return Err(format!(
                    "entity '{}' declares conflicting slug fields",
                    self.name
                ));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn slug_field(&self) -> Option<&Field> {
        if let Some(slug) = &self.slug {
            return self.field(slug);
        }
        self.fields.iter().find(|field| field.slug)
    }

    /// Fields the engine manages itself; payload values for them are ignored.
    pub fn auto_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|field| field.auto.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Source,
    Target,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Lazy,
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Diff,
    Replace,
    Append,
}

impl WriteMode {
    pub fn parse(raw: &str) -> Option<WriteMode> {
        match raw {
            "diff" => Some(WriteMode::Diff),
            "replace" => Some(WriteMode::Replace),
            "append" => Some(WriteMode::Append),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Relation {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    pub source_key: String,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub join_table: Option<String>,
    #[serde(default)]
    pub source_join_key: Option<String>,
    #[serde(default)]
    pub target_join_key: Option<String>,
    #[serde(default = "default_ownership")]
    pub ownership: Ownership,
    #[serde(default = "default_on_delete")]
    pub on_delete: OnDelete,
    #[serde(default = "default_fetch")]
    pub fetch: FetchMode,
    #[serde(default = "default_write_mode")]
    pub write_mode: WriteMode,
}

fn default_ownership() -> Ownership {
    Ownership::Source
}
fn default_on_delete() -> OnDelete {
    OnDelete::Restrict
}
fn default_fetch() -> FetchMode {
    FetchMode::Lazy
}
fn default_write_mode() -> WriteMode {
    WriteMode::Diff
}

impl Relation {
    pub fn parse(definition: &Value) -> Result<Relation, String> {
        let relation: Relation = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid relation definition: {error}"))?;
        relation.validate()?;
        Ok(relation)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.name) {
            return Err(format!("relation name '{}' is not a valid identifier", self.name));
        }
        match self.kind {
            RelationKind::ManyToMany => {
                if self.join_table.is_none()
                    || self.source_join_key.is_none()
                    || self.target_join_key.is_none()
                {
                    return Err(format!(
                        "many-to-many relation '{}' requires join_table, source_join_key, and target_join_key",
                        self.name
                    ));
                }
                if self.ownership != Ownership::None {
                    return Err(format!(
                        "many-to-many relation '{}' must declare ownership 'none'",
                        self.name
                    ));
                }
            }
            RelationKind::OneToOne | RelationKind::OneToMany => {
                if self.target_key.is_none() {
                    return Err(format!(
                        "relation '{}' requires target_key",
                        self.name
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleHook {
    BeforeWrite,
    BeforeDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Field,
    Expression,
    Computed,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RelatedLoad {
    pub relation: String,
    #[serde(default)]
    pub filter: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    pub entity: String,
    pub hook: RuleHook,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub definition: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stop_on_fail: bool,
    #[serde(default)]
    pub related_load: Vec<RelatedLoad>,
    /// Compiled expression; attached by the registry, discarded on reload.
    #[serde(skip)]
    pub program: Option<Program>,
}

impl Rule {
    pub fn parse(id: &str, definition: &Value) -> Result<Rule, String> {
        let mut rule: Rule = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid rule definition: {error}"))?;
        rule.id = id.to_string();
        if matches!(rule.rule_type, RuleType::Expression | RuleType::Computed) {
            let source = rule.expression_source().ok_or_else(|| {
                format!("rule '{id}' of type {:?} requires an expression", rule.rule_type)
            })?;
            rule.program = Some(
                Program::compile(source)
                    .map_err(|error| format!("rule '{id}': {error}"))?,
            );
        }
        Ok(rule)
    }

    pub fn expression_source(&self) -> Option<&str> {
        self.definition.get("expression").and_then(Value::as_str)
    }

    pub fn target_field(&self) -> Option<&str> {
        self.definition.get("field").and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.definition.get("message").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transition {
    #[serde(deserialize_with = "string_or_vec")]
    pub from: Vec<String>,
    pub to: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(skip)]
    pub guard_program: Option<Program>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateMachine {
    #[serde(default)]
    pub id: String,
    pub entity: String,
    pub field: String,
    pub initial: String,
    pub transitions: Vec<Transition>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl StateMachine {
    pub fn parse(id: &str, definition: &Value) -> Result<StateMachine, String> {
        // {entity, field, definition: {initial, transitions}, active}
        let entity = definition
            .get("entity")
            .and_then(Value::as_str)
            .ok_or("state machine requires an entity")?
            .to_string();
        let field = definition
            .get("field")
            .and_then(Value::as_str)
            .ok_or("state machine requires a field")?
            .to_string();
        let active = definition
            .get("active")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let inner = definition
            .get("definition")
            .ok_or("state machine requires a definition block")?;
        let initial = inner
            .get("initial")
            .and_then(Value::as_str)
            .ok_or("state machine definition requires an initial state")?
            .to_string();
        let mut transitions: Vec<Transition> = serde_json::from_value(
            inner.get("transitions").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|error| format!("invalid transitions on state machine '{id}': {error}"))?;

        for transition in &mut transitions {
            if let Some(guard) = &transition.guard {
                transition.guard_program = Some(
                    Program::compile(guard)
                        .map_err(|error| format!("state machine '{id}' guard: {error}"))?,
                );
            }
        }

        Ok(StateMachine {
            id: id.to_string(),
            entity,
            field,
            initial,
            transitions,
            active,
        })
    }

    /// Find the transition matching an observed `from -> to` state change.
    pub fn transition_for(&self, from: &str, to: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.to == to && t.from.iter().any(|f| f == from || f == "*"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub entity: String,
    pub field: String,
    pub to: String,
}

/// Where a step routes next: a step id, or the end of the workflow.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StepTarget {
    #[default]
    End,
    Step(String),
}

impl StepTarget {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            StepTarget::Step(id) => Some(id),
            StepTarget::End => None,
        }
    }
}

fn deserialize_target<'de, D>(deserializer: D) -> Result<StepTarget, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(parse_target(value.as_ref()))
}

fn parse_target(value: Option<&Value>) -> StepTarget {
    match value {
        None | Some(Value::Null) => StepTarget::End,
        Some(Value::String(text)) if text == "end" || text.is_empty() => StepTarget::End,
        Some(Value::String(text)) => StepTarget::Step(text.clone()),
        Some(Value::Object(map)) => match map.get("goto").and_then(Value::as_str) {
            Some("end") | None => StepTarget::End,
            Some(step) => StepTarget::Step(step.to_string()),
        },
        _ => StepTarget::End,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    Action {
        id: String,
        #[serde(default)]
        actions: Vec<Value>,
        #[serde(default, deserialize_with = "deserialize_target")]
        then: StepTarget,
    },
    Condition {
        id: String,
        #[serde(default)]
        condition: Option<String>,
        #[serde(default, deserialize_with = "deserialize_target")]
        on_true: StepTarget,
        #[serde(default, deserialize_with = "deserialize_target")]
        on_false: StepTarget,
        #[serde(skip)]
        program: Option<Program>,
    },
    Approval {
        id: String,
        #[serde(default)]
        timeout: Option<String>,
        #[serde(default, deserialize_with = "deserialize_target")]
        on_approve: StepTarget,
        #[serde(default, deserialize_with = "deserialize_target")]
        on_reject: StepTarget,
        #[serde(default, deserialize_with = "deserialize_target")]
        on_timeout: StepTarget,
    },
}

impl WorkflowStep {
    pub fn id(&self) -> &str {
        match self {
            WorkflowStep::Action { id, .. }
            | WorkflowStep::Condition { id, .. }
            | WorkflowStep::Approval { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Workflow {
    pub fn parse(id: &str, definition: &Value) -> Result<Workflow, String> {
        let mut workflow: Workflow = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid workflow definition: {error}"))?;
        workflow.id = id.to_string();
        if workflow.steps.is_empty() {
            return Err(format!("workflow '{}' declares no steps", workflow.name));
        }
        for step in &mut workflow.steps {
            if let WorkflowStep::Condition {
                condition, program, ..
            } = step
            {
                if let Some(source) = condition.as_deref().filter(|s| !s.trim().is_empty()) {
                    *program = Some(
                        Program::compile(source)
                            .map_err(|error| format!("workflow '{id}' condition: {error}"))?,
                    );
                }
            }
        }
        Ok(workflow)
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id() == id)
    }

    pub fn first_step(&self) -> &WorkflowStep {
        &self.steps[0]
    }
}

/// Parse `"2h"` / `"30m"` / `"45s"` timeout strings.
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.len() < 2 {
        return None;
    }
    let (amount, unit) = trimmed.split_at(trimmed.len() - 1);
    let quantity: u64 = amount.parse().ok()?;
    match unit {
        "h" => Some(Duration::from_secs(quantity * 3600)),
        "m" => Some(Duration::from_secs(quantity * 60)),
        "s" => Some(Duration::from_secs(quantity)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeWrite,
    AfterWrite,
    BeforeDelete,
    AfterDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
}

fn default_max_attempts() -> i32 {
    3
}
fn default_backoff() -> Backoff {
    Backoff::Exponential
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    #[serde(default)]
    pub id: String,
    pub entity: String,
    pub hook: HookKind,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(rename = "async", default = "default_true")]
    pub async_delivery: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(skip)]
    pub condition_program: Option<Program>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Webhook {
    pub fn parse(id: &str, definition: &Value) -> Result<Webhook, String> {
        let mut webhook: Webhook = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid webhook definition: {error}"))?;
        webhook.id = id.to_string();
        url::Url::parse(&webhook.url)
            .map_err(|error| format!("webhook '{id}' has an invalid url: {error}"))?;
        if let Some(source) = webhook.condition.as_deref().filter(|s| !s.trim().is_empty()) {
            webhook.condition_program = Some(
                Program::compile(source)
                    .map_err(|error| format!("webhook '{id}' condition: {error}"))?,
            );
        }
        Ok(webhook)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PermissionCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub id: String,
    pub entity: String,
    pub action: PermissionAction,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<PermissionCondition>,
}

impl Permission {
    pub fn parse(id: &str, definition: &Value) -> Result<Permission, String> {
        let mut permission: Permission = serde_json::from_value(definition.clone())
            .map_err(|error| format!("invalid permission definition: {error}"))?;
        permission.id = id.to_string();
        Ok(permission)
    }
}

/// Request-scoped user context. Role `admin` bypasses permission checks.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub id: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl UserContext {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.roles.contains(role))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "email": self.email,
            "roles": self.roles,
        })
    }
}

fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(single) => Ok(vec![single]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_str()
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| serde::de::Error::custom("expected string"))
            })
            .collect(),
        _ => Err(serde::de::Error::custom("expected string or array of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoice_definition() -> Value {
        json!({
            "name": "invoice",
            "table": "invoices",
            "primary_key": {"field": "id", "type": "uuid", "generated": true},
            "soft_delete": true,
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "number", "type": "string", "required": true, "unique": true},
                {"name": "status", "type": "string", "default": "draft"},
                {"name": "total", "type": "decimal", "precision": 2},
                {"name": "created_at", "type": "timestamp", "auto": "create"},
                {"name": "updated_at", "type": "timestamp", "auto": "update"},
            ],
        })
    }

    #[test]
    fn parses_a_valid_entity() {
        let entity = Entity::parse(&invoice_definition()).unwrap();
        assert_eq!(entity.table, "invoices");
        assert!(entity.soft_delete);
        assert!(entity.has_field("number"));
        assert_eq!(entity.auto_fields().count(), 2);
    }

    #[test]
    fn rejects_entity_with_missing_pk_field() {
        let mut definition = invoice_definition();
        definition["primary_key"]["field"] = json!("nope");
        assert!(Entity::parse(&definition).is_err());
    }

    #[test]
    fn rejects_invalid_field_names() {
        let mut definition = invoice_definition();
        definition["fields"][1]["name"] = json!("Bad-Name");
        assert!(Entity::parse(&definition).is_err());
        assert!(!is_valid_name("1abc"));
        assert!(!is_valid_name("ABC"));
        assert!(is_valid_name("a1_b2"));
    }

    #[test]
    fn decimal_requires_precision() {
        let mut definition = invoice_definition();
        definition["fields"][3] = json!({"name": "total", "type": "decimal"});
        assert!(Entity::parse(&definition).is_err());
    }

    #[test]
    fn many_to_many_relation_needs_join_table() {
        let definition = json!({
            "name": "product_tags",
            "type": "many_to_many",
            "source": "product",
            "target": "tag",
            "source_key": "id",
            "ownership": "none",
        });
        assert!(Relation::parse(&definition).is_err());

        let full = json!({
            "name": "product_tags",
            "type": "many_to_many",
            "source": "product",
            "target": "tag",
            "source_key": "id",
            "join_table": "product_tags",
            "source_join_key": "product_id",
            "target_join_key": "tag_id",
            "ownership": "none",
        });
        let relation = Relation::parse(&full).unwrap();
        assert_eq!(relation.kind, RelationKind::ManyToMany);
        assert_eq!(relation.write_mode, WriteMode::Diff);
    }

    #[test]
    fn one_to_many_requires_target_key() {
        let definition = json!({
            "name": "invoice_items",
            "type": "one_to_many",
            "source": "invoice",
            "target": "invoice_item",
            "source_key": "id",
        });
        assert!(Relation::parse(&definition).is_err());
    }

    #[test]
    fn rule_compiles_expression_at_parse_time() {
        let definition = json!({
            "entity": "invoice",
            "hook": "before_write",
            "type": "expression",
            "definition": {"expression": "record.total < 0", "field": "total", "message": "negative"},
            "priority": 10,
        });
        let rule = Rule::parse("r1", &definition).unwrap();
        assert!(rule.program.is_some());
        assert_eq!(rule.target_field(), Some("total"));

        let broken = json!({
            "entity": "invoice",
            "hook": "before_write",
            "type": "expression",
            "definition": {"expression": "record.total <"},
        });
        assert!(Rule::parse("r2", &broken).is_err());
    }

    #[test]
    fn state_machine_transition_lookup() {
        let definition = json!({
            "entity": "invoice",
            "field": "status",
            "definition": {
                "initial": "draft",
                "transitions": [
                    {"from": "draft", "to": "sent", "roles": ["accountant"]},
                    {"from": ["sent", "draft"], "to": "void", "guard": "user.id != null"},
                ],
            },
        });
        let machine = StateMachine::parse("sm1", &definition).unwrap();
        assert_eq!(machine.initial, "draft");
        assert!(machine.transition_for("draft", "sent").is_some());
        assert!(machine.transition_for("sent", "void").is_some());
        assert!(machine.transition_for("void", "draft").is_none());
        let guarded = machine.transition_for("sent", "void").unwrap();
        assert!(guarded.guard_program.is_some());
    }

    #[test]
    fn workflow_steps_parse_with_targets() {
        let definition = json!({
            "name": "invoice_approval",
            "trigger": {"type": "state_change", "entity": "invoice", "field": "status", "to": "pending_approval"},
            "context": {"amount": "trigger.record.total"},
            "steps": [
                {"type": "condition", "id": "check_amount", "condition": "context.amount > 1000",
                 "on_true": {"goto": "approve_step"}, "on_false": "end"},
                {"type": "approval", "id": "approve_step", "timeout": "24h",
                 "on_approve": {"goto": "notify"}, "on_reject": "end", "on_timeout": "end"},
                {"type": "action", "id": "notify", "actions": [{"type": "webhook"}], "then": "end"},
            ],
        });
        let workflow = Workflow::parse("wf1", &definition).unwrap();
        assert_eq!(workflow.first_step().id(), "check_amount");
        match workflow.step("check_amount").unwrap() {
            WorkflowStep::Condition { on_true, program, .. } => {
                assert_eq!(on_true, &StepTarget::Step("approve_step".to_string()));
                assert!(program.is_some());
            }
            other => panic!("unexpected step: {other:?}"),
        }
        match workflow.step("approve_step").unwrap() {
            WorkflowStep::Approval { timeout, on_reject, .. } => {
                assert_eq!(timeout.as_deref(), Some("24h"));
                assert_eq!(on_reject, &StepTarget::End);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn slug_resolution_and_conflicts() {
        let mut definition = invoice_definition();
        definition["slug"] = json!("number");
        let entity = Entity::parse(&definition).unwrap();
        assert_eq!(entity.slug_field().map(|f| f.name.as_str()), Some("number"));

        definition["slug"] = json!("missing");
        assert!(Entity::parse(&definition).is_err());

        let mut flagged = invoice_definition();
        flagged["fields"][1]["slug"] = json!(true);
        let entity = Entity::parse(&flagged).unwrap();
        assert_eq!(entity.slug_field().map(|f| f.name.as_str()), Some("number"));

        flagged["slug"] = json!("status");
        assert!(Entity::parse(&flagged).is_err());
    }

    #[test]
    fn timeout_parsing() {
        assert_eq!(parse_timeout("24h"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_timeout("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_timeout("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_timeout("x"), None);
        assert_eq!(parse_timeout("10d"), None);
    }

    #[test]
    fn webhook_parse_validates_url_and_condition() {
        let definition = json!({
            "entity": "invoice",
            "hook": "after_write",
            "url": "https://example.com/hook",
            "headers": {"x-api-key": "{{env.HOOK_KEY}}"},
            "condition": "changes.status != null",
            "retry": {"max_attempts": 5, "backoff": "linear"},
        });
        let webhook = Webhook::parse("wh1", &definition).unwrap();
        assert!(webhook.async_delivery);
        assert_eq!(webhook.retry.max_attempts, 5);
        assert!(webhook.condition_program.is_some());

        let bad_url = json!({
            "entity": "invoice",
            "hook": "after_write",
            "url": "not a url",
        });
        assert!(Webhook::parse("wh2", &bad_url).is_err());
    }

    #[test]
    fn user_context_roles() {
        let user = UserContext {
            id: "u1".to_string(),
            email: "a@b.c".to_string(),
            roles: vec!["accountant".to_string()],
        };
        assert!(!user.is_admin());
        assert!(user.has_any_role(&["accountant".to_string(), "owner".to_string()]));
        assert!(!user.has_any_role(&["owner".to_string()]));
    }
}
