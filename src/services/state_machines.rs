use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::{AppError, ValidationDetail};
use crate::schemas::{ActionDef, StateMachineDef, TransitionDef, UserContext, WriteAction};
use crate::services::expression;

/// A state field that changed during this write, reported post-commit to the
/// workflow engine, plus any webhook actions the matched transition queued.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub field: String,
    pub from: Option<String>,
    pub to: String,
    pub deferred_webhooks: Vec<ActionDef>,
}

/// Evaluate every state machine declared on the entity against the new
/// record. Returns the set of observed state changes, or the collected
/// transition violations.
pub fn evaluate(
    machines: &[Arc<StateMachineDef>],
    record: &mut Map<String, Value>,
    old: Option<&Value>,
    action: WriteAction,
    user: &UserContext,
) -> Result<Vec<StateChange>, AppError> {
    let mut changes = Vec::new();
    let mut errors = Vec::new();

    for machine in machines {
        match evaluate_machine(machine, record, old, action, user) {
            Ok(Some(change)) => changes.push(change),
            Ok(None) => {}
            Err(detail) => errors.push(detail),
        }
    }

    if errors.is_empty() {
        Ok(changes)
    } else {
        Err(AppError::Validation(errors))
    }
}

fn evaluate_machine(
    machine: &StateMachineDef,
    record: &mut Map<String, Value>,
    old: Option<&Value>,
    action: WriteAction,
    user: &UserContext,
) -> Result<Option<StateChange>, ValidationDetail> {
    let field = machine.field.as_str();
    let old_state = old
        .and_then(|value| value.get(field))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    let initial = machine
        .initial
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if action == WriteAction::Create {
        let new_state = record.get(field).and_then(Value::as_str).map(ToOwned::to_owned);
        return match (new_state, initial) {
            // Omitted state defaults to the machine's initial.
            (None, Some(initial)) => {
                record.insert(field.to_string(), Value::String(initial.to_string()));
                Ok(Some(StateChange {
                    field: field.to_string(),
                    from: None,
                    to: initial.to_string(),
                    deferred_webhooks: Vec::new(),
                }))
            }
            (Some(state), Some(initial)) if state == initial => Ok(Some(StateChange {
                field: field.to_string(),
                from: None,
                to: state,
                deferred_webhooks: Vec::new(),
            })),
            (Some(state), Some(initial)) => Err(ValidationDetail::new(
                field,
                "state_machine",
                format!("State must start at '{initial}', got '{state}'."),
            )),
            // No declared initial accepts any create-time value.
            (Some(state), None) => Ok(Some(StateChange {
                field: field.to_string(),
                from: None,
                to: state,
                deferred_webhooks: Vec::new(),
            })),
            (None, None) => Ok(None),
        };
    }

    // Update: only evaluate when the field is present and actually changes.
    let Some(new_state) = record.get(field).and_then(Value::as_str).map(ToOwned::to_owned) else {
        return Ok(None);
    };
    if old_state.as_deref() == Some(new_state.as_str()) {
        return Ok(None);
    }
    let from_state = old_state.clone().unwrap_or_default();

    // Declared order; first transition whose from/to both match wins.
    let transition = machine.transitions.iter().find(|transition| {
        transition.to == new_state && transition.from.contains(&from_state)
    });
    let Some(transition) = transition else {
        return Err(ValidationDetail::new(
            field,
            "state_machine",
            format!("No transition from '{from_state}' to '{new_state}'."),
        ));
    };

    if let Some(roles) = &transition.roles {
        if !user.has_any_role(roles) {
            return Err(ValidationDetail::new(
                field,
                "state_machine",
                format!("Transition from '{from_state}' to '{new_state}' requires one of roles {roles:?}."),
            ));
        }
    }

    if let Some(guard) = &transition.guard {
        let ctx = expression::write_context(record, old, action, user);
        let allowed = match expression::eval_bool(guard, &ctx) {
            Ok(allowed) => allowed,
            Err(error) => {
                tracing::warn!(field, guard = %guard, error = %error, "Guard expression failed");
                false
            }
        };
        if !allowed {
            return Err(ValidationDetail::new(
                field,
                "state_machine",
                format!("Transition from '{from_state}' to '{new_state}' blocked by guard"),
            ));
        }
    }

    let deferred_webhooks = apply_actions(transition, record);

    Ok(Some(StateChange {
        field: field.to_string(),
        from: old_state,
        to: new_state,
        deferred_webhooks,
    }))
}

/// Inline actions run in declared order; a failing action is logged and the
/// transition proceeds. Webhook actions are deferred to post-commit.
fn apply_actions(transition: &TransitionDef, record: &mut Map<String, Value>) -> Vec<ActionDef> {
    let mut deferred = Vec::new();
    for action in &transition.actions {
        match action {
            ActionDef::SetField { field, value } => {
                record.insert(field.clone(), resolve_action_value(value));
            }
            ActionDef::Webhook { .. } => {
                deferred.push(action.clone());
            }
            ActionDef::CreateRecord { entity, .. } => {
                tracing::info!(entity = entity.as_deref().unwrap_or(""), "create_record transition action is reserved; skipped");
            }
            ActionDef::SendEvent { name, .. } => {
                tracing::info!(event = name.as_deref().unwrap_or(""), "send_event transition action is reserved; skipped");
            }
        }
    }
    deferred
}

/// `"now"` resolves to the current timestamp at action time.
fn resolve_action_value(value: &Value) -> Value {
    match value.as_str() {
        Some("now") => Value::String(Utc::now().to_rfc3339()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine(value: Value) -> Arc<StateMachineDef> {
        Arc::new(serde_json::from_value(value).unwrap())
    }

    fn invoice_machine() -> Arc<StateMachineDef> {
        machine(json!({
            "id": 1,
            "entity": "invoice",
            "field": "status",
            "initial": "draft",
            "transitions": [
                {"from": "draft", "to": "sent", "guard": "record.total > 0"},
                {"from": ["sent", "overdue"], "to": "paid",
                 "actions": [{"type": "set_field", "field": "paid_at", "value": "now"}]},
                {"from": "sent", "to": "cancelled", "roles": ["manager"]}
            ]
        }))
    }

    fn user_with(roles: &[&str]) -> UserContext {
        UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_must_match_initial() {
        let machines = vec![invoice_machine()];
        let mut ok = obj(json!({"status": "draft", "total": 0}));
        let changes = evaluate(&machines, &mut ok, None, WriteAction::Create, &user_with(&[]))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, "draft");
        assert_eq!(changes[0].from, None);

        let mut bad = obj(json!({"status": "sent"}));
        let error = evaluate(&machines, &mut bad, None, WriteAction::Create, &user_with(&[]))
            .unwrap_err();
        match error {
            AppError::Validation(details) => {
                assert_eq!(details[0].rule, "state_machine");
                assert!(details[0].message.contains("'draft'"));
            }
            other => panic!("expected validation, got {other:?}"),
        }
    }

    #[test]
    fn create_defaults_missing_state_to_initial() {
        let machines = vec![invoice_machine()];
        let mut body = obj(json!({"total": 10}));
        evaluate(&machines, &mut body, None, WriteAction::Create, &user_with(&[])).unwrap();
        assert_eq!(body["status"], json!("draft"));
    }

    #[test]
    fn empty_initial_accepts_any_create_value() {
        let machines = vec![machine(json!({
            "id": 2, "entity": "ticket", "field": "stage",
            "transitions": [{"from": "new", "to": "done"}]
        }))];
        let mut body = obj(json!({"stage": "whatever"}));
        let changes = evaluate(&machines, &mut body, None, WriteAction::Create, &user_with(&[]))
            .unwrap();
        assert_eq!(changes[0].to, "whatever");
    }

    #[test]
    fn guard_blocks_transition() {
        let machines = vec![invoice_machine()];
        let old = json!({"status": "draft", "total": 0});
        let mut body = obj(json!({"status": "sent", "total": 0}));
        let error = evaluate(
            &machines,
            &mut body,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap_err();
        match error {
            AppError::Validation(details) => {
                assert_eq!(details[0].field, "status");
                assert_eq!(
                    details[0].message,
                    "Transition from 'draft' to 'sent' blocked by guard"
                );
            }
            other => panic!("expected validation, got {other:?}"),
        }

        let mut allowed = obj(json!({"status": "sent", "total": 50}));
        let changes = evaluate(
            &machines,
            &mut allowed,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap();
        assert_eq!(changes[0].from.as_deref(), Some("draft"));
        assert_eq!(changes[0].to, "sent");
    }

    #[test]
    fn from_list_and_set_field_action() {
        let machines = vec![invoice_machine()];
        let old = json!({"status": "overdue", "total": 50});
        let mut body = obj(json!({"status": "paid", "total": 50}));
        let changes = evaluate(
            &machines,
            &mut body,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap();
        assert_eq!(changes[0].to, "paid");
        assert!(body.get("paid_at").and_then(Value::as_str).is_some());
    }

    #[test]
    fn role_gated_transition() {
        let machines = vec![invoice_machine()];
        let old = json!({"status": "sent", "total": 50});

        let mut denied = obj(json!({"status": "cancelled"}));
        assert!(evaluate(
            &machines,
            &mut denied,
            Some(&old),
            WriteAction::Update,
            &user_with(&["editor"]),
        )
        .is_err());

        let mut allowed = obj(json!({"status": "cancelled"}));
        assert!(evaluate(
            &machines,
            &mut allowed,
            Some(&old),
            WriteAction::Update,
            &user_with(&["manager"]),
        )
        .is_ok());
    }

    #[test]
    fn unchanged_or_absent_state_is_ignored() {
        let machines = vec![invoice_machine()];
        let old = json!({"status": "sent", "total": 50});
        let mut unchanged = obj(json!({"status": "sent", "total": 75}));
        assert!(evaluate(
            &machines,
            &mut unchanged,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap()
        .is_empty());

        let mut absent = obj(json!({"total": 75}));
        assert!(evaluate(
            &machines,
            &mut absent,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap()
        .is_empty());
    }

    #[test]
    fn no_matching_transition_fails() {
        let machines = vec![invoice_machine()];
        let old = json!({"status": "draft", "total": 10});
        let mut body = obj(json!({"status": "paid"}));
        let error = evaluate(
            &machines,
            &mut body,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap_err();
        match error {
            AppError::Validation(details) => {
                assert!(details[0].message.contains("No transition"));
            }
            other => panic!("expected validation, got {other:?}"),
        }
    }

    #[test]
    fn webhook_actions_are_deferred() {
        let machines = vec![machine(json!({
            "id": 3, "entity": "order", "field": "status", "initial": "new",
            "transitions": [{
                "from": "new", "to": "shipped",
                "actions": [
                    {"type": "webhook", "url": "https://example.test/ship"},
                    {"type": "create_record", "entity": "audit"}
                ]
            }]
        }))];
        let old = json!({"status": "new"});
        let mut body = obj(json!({"status": "shipped"}));
        let changes = evaluate(
            &machines,
            &mut body,
            Some(&old),
            WriteAction::Update,
            &user_with(&[]),
        )
        .unwrap();
        assert_eq!(changes[0].deferred_webhooks.len(), 1);
    }
}
