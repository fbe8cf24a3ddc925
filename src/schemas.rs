use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::BadRequest(format!("Validation failed: {errors}")))
}

fn default_true() -> bool {
    true
}
fn default_post() -> String {
    "POST".to_string()
}
fn default_max_attempts() -> i32 {
    3
}

// ---------------------------------------------------------------------------
// Entities and fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkType {
    Uuid,
    Int,
    Bigint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub field: String,
    #[serde(rename = "type")]
    pub pk_type: PkType,
    #[serde(default = "default_true")]
    pub generated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStamp {
    Create,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub auto: Option<AutoStamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlugConfig {
    pub field: String,
    pub source: String,
    #[serde(default)]
    pub regenerate_on_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub slug: Option<SlugConfig>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn pk_field(&self) -> &str {
        &self.primary_key.field
    }

    /// Structural invariants enforced at admin create and registry load.
    pub fn validate_shape(&self) -> Result<(), AppError> {
        if self.field(self.pk_field()).is_none() {
            return Err(AppError::BadRequest(format!(
                "Entity '{}' declares primary key '{}' which is not among its fields.",
                self.name,
                self.pk_field()
            )));
        }
        for field in &self.fields {
            if let Some(values) = &field.enum_values {
                let mut seen = std::collections::HashSet::new();
                for value in values {
                    if !seen.insert(value) {
                        return Err(AppError::BadRequest(format!(
                            "Field '{}.{}' repeats enum value '{value}'.",
                            self.name, field.name
                        )));
                    }
                }
            }
            if field.auto.is_some() && field.field_type != FieldType::Timestamp {
                return Err(AppError::BadRequest(format!(
                    "Field '{}.{}' declares auto but is not a timestamp.",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Diff,
    Replace,
    Append,
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::Diff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Source,
    Target,
    None,
}

impl Default for Ownership {
    fn default() -> Self {
        Ownership::Source
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub join_table: Option<String>,
    #[serde(default)]
    pub source_join_key: Option<String>,
    #[serde(default)]
    pub target_join_key: Option<String>,
    #[serde(default = "RelationDef::default_on_delete")]
    pub on_delete: OnDelete,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub ownership: Ownership,
}

impl RelationDef {
    fn default_on_delete() -> OnDelete {
        OnDelete::Restrict
    }

    pub fn is_many_to_many(&self) -> bool {
        self.kind == RelationKind::ManyToMany
    }

    pub fn validate_shape(&self) -> Result<(), AppError> {
        if self.is_many_to_many() {
            if self.join_table.is_none()
                || self.source_join_key.is_none()
                || self.target_join_key.is_none()
            {
                return Err(AppError::BadRequest(format!(
                    "Relation '{}' is many_to_many and must declare join_table, source_join_key and target_join_key.",
                    self.name
                )));
            }
        } else if self.target_key.is_none() {
            return Err(AppError::BadRequest(format!(
                "Relation '{}' must declare target_key.",
                self.name
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleHook {
    BeforeWrite,
    BeforeDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Field {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Expression {
        expression: String,
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Computed {
        field: String,
        expression: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    #[serde(default)]
    pub id: i64,
    pub entity: String,
    pub hook: RuleHook,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stop_on_fail: bool,
}

// ---------------------------------------------------------------------------
// State machines
// ---------------------------------------------------------------------------

/// Transition `from` accepts a single state or a list of states.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FromStates(pub Vec<String>);

impl FromStates {
    pub fn contains(&self, state: &str) -> bool {
        self.0.iter().any(|candidate| candidate == state)
    }
}

impl<'de> Deserialize<'de> for FromStates {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(state) => FromStates(vec![state]),
            OneOrMany::Many(states) => FromStates(states),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDef {
    SetField {
        field: String,
        value: Value,
    },
    Webhook {
        url: String,
        #[serde(default = "default_post")]
        method: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    // Reserved action types: accepted, logged, no-op.
    CreateRecord {
        #[serde(default)]
        entity: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
    SendEvent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        payload: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: FromStates,
    pub to: String,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDef {
    #[serde(default)]
    pub id: i64,
    pub entity: String,
    pub field: String,
    #[serde(default)]
    pub initial: Option<String>,
    pub transitions: Vec<TransitionDef>,
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    pub entity: String,
    #[serde(default)]
    pub from_status: Option<String>,
    pub to_status: String,
}

/// A step's transition slot: `"end"`, a step id, or inline actions + goto.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionSlot {
    Target(String),
    Inline {
        #[serde(default)]
        actions: Vec<ActionDef>,
        goto: String,
    },
}

impl TransitionSlot {
    pub fn goto(&self) -> &str {
        match self {
            TransitionSlot::Target(target) => target,
            TransitionSlot::Inline { goto, .. } => goto,
        }
    }

    pub fn actions(&self) -> &[ActionDef] {
        match self {
            TransitionSlot::Target(_) => &[],
            TransitionSlot::Inline { actions, .. } => actions,
        }
    }

    pub fn is_end(&self) -> bool {
        self.goto() == "end"
    }
}

/// Approval timeouts accept integer seconds or `"90s"/"15m"/"1h"/"2d"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TimeoutSpec {
    Seconds(i64),
    Text(String),
}

impl TimeoutSpec {
    pub fn as_seconds(&self) -> Option<i64> {
        match self {
            TimeoutSpec::Seconds(seconds) if *seconds > 0 => Some(*seconds),
            TimeoutSpec::Seconds(_) => None,
            TimeoutSpec::Text(text) => parse_duration_seconds(text),
        }
    }
}

fn parse_duration_seconds(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return (seconds > 0).then_some(seconds);
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    let magnitude = digits.trim().parse::<i64>().ok()?;
    if magnitude <= 0 {
        return None;
    }
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    Some(magnitude * factor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action {
        #[serde(default)]
        actions: Vec<ActionDef>,
        #[serde(default)]
        then: Option<TransitionSlot>,
    },
    Condition {
        expression: String,
        #[serde(default)]
        on_true: Option<TransitionSlot>,
        #[serde(default)]
        on_false: Option<TransitionSlot>,
    },
    Approval {
        #[serde(default)]
        timeout: Option<TimeoutSpec>,
        #[serde(default)]
        on_approve: Option<TransitionSlot>,
        #[serde(default)]
        on_reject: Option<TransitionSlot>,
        #[serde(default)]
        on_timeout: Option<TransitionSlot>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub trigger: TriggerDef,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub steps: Vec<StepDef>,
}

impl WorkflowDef {
    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|step| step.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::WaitingApproval => "waiting_approval",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermAction {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDef {
    #[serde(default)]
    pub id: i64,
    pub entity: String,
    pub action: PermAction,
    pub roles: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookHook {
    BeforeWrite,
    AfterWrite,
    BeforeDelete,
    AfterDelete,
}

impl WebhookHook {
    pub fn is_sync(&self) -> bool {
        matches!(self, WebhookHook::BeforeWrite | WebhookHook::BeforeDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Exponential,
    Linear,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDef {
    #[serde(default)]
    pub id: i64,
    pub entity: String,
    pub hook: WebhookHook,
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub signing_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Users / apps / writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserContext {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|role| roles.contains(role))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbDriver {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub display_name: String,
    pub db_name: String,
    pub db_driver: DbDriver,
    pub jwt_secret: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }

    pub fn perm_action(&self) -> PermAction {
        match self {
            WriteAction::Create => PermAction::Create,
            WriteAction::Update => PermAction::Update,
            WriteAction::Delete => PermAction::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_states_accepts_string_and_list() {
        let single: TransitionDef =
            serde_json::from_value(json!({"from": "draft", "to": "sent"})).unwrap();
        assert_eq!(single.from, FromStates(vec!["draft".to_string()]));

        let many: TransitionDef =
            serde_json::from_value(json!({"from": ["draft", "review"], "to": "sent"})).unwrap();
        assert!(many.from.contains("review"));
        assert!(!many.from.contains("sent"));
    }

    #[test]
    fn rule_definition_is_tagged_on_type() {
        let rule: RuleDef = serde_json::from_value(json!({
            "entity": "person",
            "hook": "before_write",
            "type": "computed",
            "field": "full_name",
            "expression": "record.first + \" \" + record.last"
        }))
        .unwrap();
        match rule.kind {
            RuleKind::Computed { field, .. } => assert_eq!(field, "full_name"),
            other => panic!("expected computed rule, got {other:?}"),
        }
        assert!(rule.active);
    }

    #[test]
    fn step_kind_is_tagged_and_slots_parse_both_shapes() {
        let step: StepDef = serde_json::from_value(json!({
            "id": "notify",
            "type": "action",
            "actions": [{"type": "webhook", "url": "https://example.test/hook"}],
            "then": "end"
        }))
        .unwrap();
        match &step.kind {
            StepKind::Action { then, .. } => {
                assert!(then.as_ref().unwrap().is_end());
            }
            other => panic!("expected action step, got {other:?}"),
        }

        let step: StepDef = serde_json::from_value(json!({
            "id": "check",
            "type": "condition",
            "expression": "record.total > 100",
            "on_true": {"actions": [{"type": "set_field", "field": "flag", "value": true}], "goto": "notify"},
            "on_false": "end"
        }))
        .unwrap();
        match &step.kind {
            StepKind::Condition { on_true, .. } => {
                let slot = on_true.as_ref().unwrap();
                assert_eq!(slot.goto(), "notify");
                assert_eq!(slot.actions().len(), 1);
            }
            other => panic!("expected condition step, got {other:?}"),
        }
    }

    #[test]
    fn timeout_spec_parses_seconds_and_suffixes() {
        assert_eq!(TimeoutSpec::Seconds(90).as_seconds(), Some(90));
        assert_eq!(TimeoutSpec::Text("90s".into()).as_seconds(), Some(90));
        assert_eq!(TimeoutSpec::Text("15m".into()).as_seconds(), Some(900));
        assert_eq!(TimeoutSpec::Text("1h".into()).as_seconds(), Some(3600));
        assert_eq!(TimeoutSpec::Text("2d".into()).as_seconds(), Some(172_800));
        assert_eq!(TimeoutSpec::Text("nope".into()).as_seconds(), None);
        assert_eq!(TimeoutSpec::Seconds(0).as_seconds(), None);
    }

    #[test]
    fn entity_shape_rejects_missing_pk_and_duplicate_enum() {
        let entity: EntityDef = serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [
                {"name": "id", "type": "uuid"},
                {"name": "status", "type": "string", "enum": ["open", "open"]}
            ]
        }))
        .unwrap();
        assert!(entity.validate_shape().is_err());

        let entity: EntityDef = serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [{"name": "status", "type": "string"}]
        }))
        .unwrap();
        assert!(entity.validate_shape().is_err());
    }

    #[test]
    fn relation_shape_requires_join_metadata() {
        let relation: RelationDef = serde_json::from_value(json!({
            "name": "order_tags",
            "type": "many_to_many",
            "source": "order",
            "target": "tag"
        }))
        .unwrap();
        assert!(relation.validate_shape().is_err());

        let relation: RelationDef = serde_json::from_value(json!({
            "name": "order_items",
            "type": "one_to_many",
            "source": "order",
            "target": "line_item",
            "target_key": "order_id"
        }))
        .unwrap();
        assert!(relation.validate_shape().is_ok());
        assert_eq!(relation.write_mode, WriteMode::Diff);
        assert_eq!(relation.on_delete, OnDelete::Restrict);
    }

    #[test]
    fn webhook_defaults() {
        let webhook: WebhookDef = serde_json::from_value(json!({
            "entity": "order",
            "hook": "after_write",
            "url": "https://example.test/hook"
        }))
        .unwrap();
        assert!(webhook.active);
        assert!(!webhook.is_async);
        assert_eq!(webhook.method, "POST");
        assert_eq!(webhook.retry.max_attempts, 3);
        assert_eq!(webhook.retry.backoff, Backoff::Exponential);
        assert!(!webhook.hook.is_sync());
    }

    #[test]
    fn user_admin_and_role_checks() {
        let user = UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: vec!["editor".into()],
        };
        assert!(!user.is_admin());
        assert!(user.has_any_role(&["editor".to_string(), "viewer".to_string()]));
        assert!(!user.has_any_role(&["viewer".to_string()]));
    }
}
