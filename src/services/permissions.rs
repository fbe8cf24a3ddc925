use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::registry::RegistrySnapshot;
use crate::schemas::{PermAction, UserContext};
use crate::services::expression;

/// Entity-level permission check. The admin role bypasses everything; an
/// entity with no declared permissions for the action is open. Otherwise the
/// caller needs a role whitelisted by at least one permission, and when that
/// permission carries a row-level condition it must hold against the
/// pre-image (`record` in the condition context).
pub fn check(
    snapshot: &RegistrySnapshot,
    entity: &str,
    action: PermAction,
    user: &UserContext,
    record: Option<&Value>,
) -> AppResult<()> {
    if user.is_admin() {
        return Ok(());
    }

    let permissions = snapshot.permissions_for(entity, action);
    if permissions.is_empty() {
        return Ok(());
    }

    let mut role_matched = false;
    for permission in permissions {
        if !user.has_any_role(&permission.roles) {
            continue;
        }
        role_matched = true;

        let Some(condition) = &permission.condition else {
            return Ok(());
        };
        let ctx = condition_context(record, user);
        match expression::eval_bool(condition, &ctx) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(entity, condition = %condition, error = %error, "Permission condition failed to evaluate");
            }
        }
    }

    if role_matched {
        Err(AppError::Forbidden(
            "Forbidden: row-level condition not satisfied.".to_string(),
        ))
    } else {
        Err(AppError::Forbidden(format!(
            "Forbidden: no permission to {} '{entity}'.",
            action_label(action)
        )))
    }
}

/// Condition expressions the read path must AND into its result set. This is
/// the permission engine's only hook into reads: conditions for permissions
/// whose roles match the caller. An unconditioned matching permission means
/// unrestricted read (empty filter list).
pub fn read_filters(
    snapshot: &RegistrySnapshot,
    entity: &str,
    user: &UserContext,
) -> AppResult<Vec<String>> {
    if user.is_admin() {
        return Ok(Vec::new());
    }

    let permissions = snapshot.permissions_for(entity, PermAction::Read);
    if permissions.is_empty() {
        return Ok(Vec::new());
    }

    let mut filters = Vec::new();
    let mut role_matched = false;
    for permission in permissions {
        if !user.has_any_role(&permission.roles) {
            continue;
        }
        role_matched = true;
        match &permission.condition {
            None => return Ok(Vec::new()),
            Some(condition) => filters.push(condition.clone()),
        }
    }

    if !role_matched {
        return Err(AppError::Forbidden(format!(
            "Forbidden: no permission to read '{entity}'."
        )));
    }
    Ok(filters)
}

fn condition_context(record: Option<&Value>, user: &UserContext) -> Value {
    json!({
        "record": record.cloned().unwrap_or(Value::Null),
        "user": {
            "id": user.id,
            "email": user.email,
            "roles": user.roles,
        },
    })
}

fn action_label(action: PermAction) -> &'static str {
    match action {
        PermAction::Create => "create",
        PermAction::Read => "read",
        PermAction::Update => "update",
        PermAction::Delete => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistrySnapshot;
    use crate::schemas::{EntityDef, PermissionDef};
    use serde_json::json;

    fn snapshot(permissions: Vec<Value>) -> RegistrySnapshot {
        let entity: EntityDef = serde_json::from_value(json!({
            "name": "order",
            "table": "orders",
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [{"name": "id", "type": "uuid"}]
        }))
        .unwrap();
        let permissions: Vec<PermissionDef> = permissions
            .into_iter()
            .map(|p| serde_json::from_value(p).unwrap())
            .collect();
        RegistrySnapshot::build(vec![entity], vec![], vec![], vec![], vec![], permissions, vec![])
            .unwrap()
    }

    fn user(roles: &[&str]) -> UserContext {
        UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn open_entity_allows_everyone() {
        let snapshot = snapshot(vec![]);
        assert!(check(&snapshot, "order", PermAction::Update, &user(&[]), None).is_ok());
    }

    #[test]
    fn admin_bypasses_whitelist() {
        let snapshot = snapshot(vec![json!({
            "id": 1, "entity": "order", "action": "update", "roles": ["manager"]
        })]);
        assert!(check(&snapshot, "order", PermAction::Update, &user(&["admin"]), None).is_ok());
        assert!(check(&snapshot, "order", PermAction::Update, &user(&["viewer"]), None).is_err());
        assert!(check(&snapshot, "order", PermAction::Update, &user(&["manager"]), None).is_ok());
    }

    #[test]
    fn row_condition_evaluates_pre_image() {
        let snapshot = snapshot(vec![json!({
            "id": 1, "entity": "order", "action": "update",
            "roles": ["owner"], "condition": "record.owner_id == user.id"
        })]);
        let mine = json!({"owner_id": "u1"});
        let theirs = json!({"owner_id": "u2"});
        assert!(check(&snapshot, "order", PermAction::Update, &user(&["owner"]), Some(&mine)).is_ok());
        let denied =
            check(&snapshot, "order", PermAction::Update, &user(&["owner"]), Some(&theirs));
        assert!(matches!(denied, Err(AppError::Forbidden(_))));
    }

    #[test]
    fn read_filters_collect_conditions() {
        let snapshot = snapshot(vec![
            json!({
                "id": 1, "entity": "order", "action": "read",
                "roles": ["owner"], "condition": "record.owner_id == user.id"
            }),
            json!({
                "id": 2, "entity": "order", "action": "read", "roles": ["auditor"]
            }),
        ]);
        let filters = read_filters(&snapshot, "order", &user(&["owner"])).unwrap();
        assert_eq!(filters, vec!["record.owner_id == user.id".to_string()]);

        // an unconditioned matching permission clears all filters
        let filters = read_filters(&snapshot, "order", &user(&["owner", "auditor"])).unwrap();
        assert!(filters.is_empty());

        assert!(read_filters(&snapshot, "order", &user(&["stranger"])).is_err());
        assert!(read_filters(&snapshot, "order", &user(&["admin"]))
            .unwrap()
            .is_empty());
    }
}
