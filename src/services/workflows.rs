use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{map_db_error, AppError, AppResult};
use crate::schemas::{
    ActionDef, InstanceStatus, StepDef, StepKind, TransitionSlot, UserContext, WorkflowDef,
};
use crate::services::expression;
use crate::services::state_machines::StateChange;
use crate::services::webhooks;
use crate::tenancy::AppContext;

/// Guard against cyclic `goto` graphs.
const MAX_ADVANCE_STEPS: usize = 64;

/// Does a workflow trigger match an observed transition? An omitted
/// `from_status` matches any origin, including create.
pub(crate) fn trigger_matches(workflow: &WorkflowDef, from: Option<&str>, to: &str) -> bool {
    if workflow.trigger.to_status != to {
        return false;
    }
    match &workflow.trigger.from_status {
        None => true,
        Some(required) => from == Some(required.as_str()),
    }
}

/// Post-commit entry point: create an instance for every workflow whose
/// trigger matches the state change, then advance each.
pub async fn dispatch_triggers(
    app: &Arc<AppContext>,
    entity: &str,
    change: &StateChange,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
) -> AppResult<()> {
    let snapshot = app.registry.snapshot();
    let candidates = snapshot.workflows_for(entity, &change.to);
    if candidates.is_empty() {
        return Ok(());
    }

    let record_id = record
        .get(
            snapshot
                .entity_opt(entity)
                .map(|e| e.pk_field().to_string())
                .unwrap_or_else(|| "id".to_string())
                .as_str(),
        )
        .map(crate::repository::table_service::render_scalar);

    for workflow in candidates {
        if !trigger_matches(workflow, change.from.as_deref(), &change.to) {
            continue;
        }
        let Some(first_step) = workflow.steps.first() else {
            tracing::warn!(workflow = %workflow.name, "Workflow has no steps; skipping");
            continue;
        };

        // context = workflow defaults ∪ {record, old, user}
        let mut context = workflow.context.clone();
        context.insert("record".to_string(), record.clone());
        context.insert(
            "old".to_string(),
            old.cloned().unwrap_or(Value::Null),
        );
        context.insert(
            "user".to_string(),
            json!({"id": user.id, "email": user.email, "roles": user.roles}),
        );

        let row = sqlx::query(
            "INSERT INTO _workflow_instances (workflow_id, entity, record_id, status, current_step, context, history)
             VALUES ($1, $2, $3, 'running', $4, $5, '[]'::jsonb)
             RETURNING id",
        )
        .bind(workflow.id)
        .bind(entity)
        .bind(record_id.as_deref())
        .bind(&first_step.id)
        .bind(Value::Object(context))
        .fetch_one(&app.pool)
        .await
        .map_err(map_db_error)?;
        let instance_id: Uuid = row.try_get("id").map_err(map_db_error)?;

        let span = app
            .instrumentation
            .span("workflows", "trigger")
            .entity(entity)
            .metadata("workflow", json!(workflow.name));

        if let Err(error) = advance(app, instance_id).await {
            tracing::warn!(instance = %instance_id, error = %error, "Workflow advance failed");
            span.finish("error");
        } else {
            span.finish("ok");
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct InstanceRow {
    id: Uuid,
    workflow_id: i64,
    entity: String,
    record_id: Option<String>,
    status: String,
    current_step: Option<String>,
    context: Map<String, Value>,
    history: Vec<Value>,
}

async fn load_instance(app: &AppContext, instance_id: Uuid) -> AppResult<InstanceRow> {
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row FROM _workflow_instances t WHERE id = $1 LIMIT 1",
    )
    .bind(instance_id)
    .fetch_optional(&app.pool)
    .await
    .map_err(map_db_error)?
    .and_then(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
    .ok_or_else(|| AppError::NotFound("Workflow instance not found.".to_string()))?;

    Ok(InstanceRow {
        id: instance_id,
        workflow_id: row.get("workflow_id").and_then(Value::as_i64).unwrap_or_default(),
        entity: row
            .get("entity")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        record_id: row
            .get("record_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        status: row
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        current_step: row
            .get("current_step")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        context: row
            .get("context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        history: row
            .get("history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    })
}

async fn save_instance(
    app: &AppContext,
    instance: &InstanceRow,
    deadline: Option<DateTime<Utc>>,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE _workflow_instances
         SET status = $2, current_step = $3, current_step_deadline = $4,
             context = $5, history = $6, updated_at = now()
         WHERE id = $1",
    )
    .bind(instance.id)
    .bind(&instance.status)
    .bind(instance.current_step.as_deref())
    .bind(deadline)
    .bind(Value::Object(instance.context.clone()))
    .bind(Value::Array(instance.history.clone()))
    .execute(&app.pool)
    .await
    .map_err(map_db_error)?;
    Ok(())
}

fn history_entry(step_id: &str, outcome: &str, actor: Option<&str>) -> Value {
    let mut entry = json!({
        "step_id": step_id,
        "timestamp": Utc::now().to_rfc3339(),
        "outcome": outcome,
    });
    if let Some(actor) = actor {
        entry["actor"] = json!(actor);
    }
    entry
}

/// Advance the instance until it parks (approval), completes, or fails.
/// Within one instance advancement is strictly serial; callers arbitrate via
/// the status compare-and-swap before invoking this.
pub async fn advance(app: &Arc<AppContext>, instance_id: Uuid) -> AppResult<()> {
    let snapshot = app.registry.snapshot();
    let mut instance = load_instance(app, instance_id).await?;

    let Some(workflow) = snapshot.workflow(instance.workflow_id) else {
        instance.status = InstanceStatus::Failed.as_str().to_string();
        instance
            .history
            .push(history_entry("", "failed: workflow definition missing", None));
        return save_instance(app, &instance, None).await;
    };

    for _ in 0..MAX_ADVANCE_STEPS {
        if instance.status != InstanceStatus::Running.as_str() {
            break;
        }
        let Some(step_id) = instance.current_step.clone() else {
            instance.status = InstanceStatus::Completed.as_str().to_string();
            break;
        };
        let Some(step) = workflow.step(&step_id) else {
            instance.status = InstanceStatus::Failed.as_str().to_string();
            instance
                .history
                .push(history_entry(&step_id, "failed: unknown step", None));
            break;
        };

        match &step.kind {
            StepKind::Action { actions, then } => {
                match run_actions(app, &mut instance, actions).await {
                    Ok(()) => {
                        instance.history.push(history_entry(&step_id, "ok", None));
                        apply_slot(app, &workflow, &mut instance, then.as_ref(), &step_id).await?;
                    }
                    Err(error) => {
                        instance.status = InstanceStatus::Failed.as_str().to_string();
                        instance.history.push(history_entry(
                            &step_id,
                            &format!("failed: {error}"),
                            None,
                        ));
                    }
                }
            }
            StepKind::Condition {
                expression: source,
                on_true,
                on_false,
            } => {
                let ctx = Value::Object(instance.context.clone());
                let branch = match expression::eval_bool(source, &ctx) {
                    Ok(result) => result,
                    Err(error) => {
                        instance.status = InstanceStatus::Failed.as_str().to_string();
                        instance.history.push(history_entry(
                            &step_id,
                            &format!("failed: {error}"),
                            None,
                        ));
                        break;
                    }
                };
                let outcome = if branch { "true" } else { "false" };
                instance.history.push(history_entry(&step_id, outcome, None));
                let slot = if branch { on_true } else { on_false };
                apply_slot(app, &workflow, &mut instance, slot.as_ref(), &step_id).await?;
            }
            StepKind::Approval { timeout, .. } => {
                instance.status = InstanceStatus::WaitingApproval.as_str().to_string();
                instance
                    .history
                    .push(history_entry(&step_id, "waiting_approval", None));
                let deadline = timeout
                    .as_ref()
                    .and_then(|spec| spec.as_seconds())
                    .map(|seconds| Utc::now() + Duration::seconds(seconds));
                return save_instance(app, &instance, deadline).await;
            }
        }
    }

    if instance.status == InstanceStatus::Running.as_str() {
        // Loop guard tripped: a goto cycle.
        instance.status = InstanceStatus::Failed.as_str().to_string();
        instance
            .history
            .push(history_entry("", "failed: step limit exceeded", None));
    }
    save_instance(app, &instance, None).await
}

/// Resolve one transition slot: inline actions, then the goto. A missing
/// slot or the literal `"end"` completes the instance; an unknown target
/// fails it.
async fn apply_slot(
    app: &Arc<AppContext>,
    workflow: &WorkflowDef,
    instance: &mut InstanceRow,
    slot: Option<&TransitionSlot>,
    step_id: &str,
) -> AppResult<()> {
    let Some(slot) = slot else {
        instance.status = InstanceStatus::Completed.as_str().to_string();
        instance.current_step = None;
        return Ok(());
    };

    if !slot.actions().is_empty() {
        if let Err(error) = run_actions(app, instance, slot.actions()).await {
            instance.status = InstanceStatus::Failed.as_str().to_string();
            instance
                .history
                .push(history_entry(step_id, &format!("failed: {error}"), None));
            return Ok(());
        }
    }

    let target = slot.goto();
    if target == "end" {
        instance.status = InstanceStatus::Completed.as_str().to_string();
        instance.current_step = None;
        return Ok(());
    }
    if workflow.step(target).is_none() {
        instance.status = InstanceStatus::Failed.as_str().to_string();
        instance.history.push(history_entry(
            step_id,
            &format!("failed: unknown goto '{target}'"),
            None,
        ));
        return Ok(());
    }
    instance.current_step = Some(target.to_string());
    Ok(())
}

/// Execute a step's actions in order. `set_field` writes back to the
/// triggering record in one UPDATE per action and mirrors the change into
/// the instance context; `webhook` is fire-and-forget.
async fn run_actions(
    app: &Arc<AppContext>,
    instance: &mut InstanceRow,
    actions: &[ActionDef],
) -> AppResult<()> {
    for action in actions {
        match action {
            ActionDef::SetField { field, value } => {
                let resolved = match value.as_str() {
                    Some("now") => Value::String(Utc::now().to_rfc3339()),
                    _ => value.clone(),
                };
                set_record_field(app, instance, field, resolved.clone()).await?;
                if let Some(record) = instance
                    .context
                    .get_mut("record")
                    .and_then(Value::as_object_mut)
                {
                    record.insert(field.clone(), resolved);
                }
            }
            ActionDef::Webhook {
                url,
                method,
                payload,
            } => {
                let body = payload.clone().unwrap_or_else(|| {
                    json!({
                        "instance_id": instance.id.to_string(),
                        "entity": instance.entity,
                        "record_id": instance.record_id,
                        "context": instance.context,
                    })
                });
                webhooks::fire_and_forget(app.http.clone(), url.clone(), method.clone(), body);
            }
            ActionDef::CreateRecord { entity, .. } => {
                tracing::info!(
                    entity = entity.as_deref().unwrap_or(""),
                    "create_record workflow action is reserved; skipped"
                );
            }
            ActionDef::SendEvent { name, .. } => {
                tracing::info!(
                    event = name.as_deref().unwrap_or(""),
                    "send_event workflow action is reserved; skipped"
                );
            }
        }
    }
    Ok(())
}

async fn set_record_field(
    app: &Arc<AppContext>,
    instance: &InstanceRow,
    field: &str,
    value: Value,
) -> AppResult<()> {
    let Some(record_id) = &instance.record_id else {
        return Err(AppError::Internal(
            "Workflow instance has no record to update.".to_string(),
        ));
    };
    let snapshot = app.registry.snapshot();
    let entity = snapshot.entity(&instance.entity)?;
    let pk = crate::services::orchestrator::pk_value(&entity, record_id)?;

    let mut payload = Map::new();
    payload.insert(field.to_string(), value);

    let mut conn = app.pool.acquire().await.map_err(map_db_error)?;
    crate::repository::table_service::update_row_tx(
        &mut conn,
        &entity.table,
        entity.pk_field(),
        &pk,
        &payload,
        entity.soft_delete,
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Runtime: approvals and timeouts
// ---------------------------------------------------------------------------

/// Resolve a parked approval. The compare-and-swap on `status` guarantees a
/// single winner between two reviewers or a reviewer racing the timeout
/// scheduler.
pub async fn review(
    app: &Arc<AppContext>,
    instance_id: Uuid,
    approved: bool,
    user: &UserContext,
) -> AppResult<Value> {
    let claimed = sqlx::query(
        "UPDATE _workflow_instances
         SET status = 'running', current_step_deadline = NULL, updated_at = now()
         WHERE id = $1 AND status = 'waiting_approval'",
    )
    .bind(instance_id)
    .execute(&app.pool)
    .await
    .map_err(map_db_error)?;
    if claimed.rows_affected() == 0 {
        return Err(AppError::Conflict(
            "Workflow instance is not awaiting approval.".to_string(),
        ));
    }

    let snapshot = app.registry.snapshot();
    let mut instance = load_instance(app, instance_id).await?;
    let step_id = instance.current_step.clone().unwrap_or_default();
    let outcome = if approved { "approved" } else { "rejected" };
    instance
        .history
        .push(history_entry(&step_id, outcome, Some(&user.id)));

    let workflow = snapshot.workflow(instance.workflow_id);
    match workflow {
        Some(workflow) => {
            let slot = approval_slot(&workflow, &step_id, approved);
            apply_slot(app, &workflow, &mut instance, slot, &step_id).await?;
            save_instance(app, &instance, None).await?;
            if instance.status == InstanceStatus::Running.as_str() {
                advance(app, instance_id).await?;
            }
        }
        None => {
            instance.status = InstanceStatus::Failed.as_str().to_string();
            instance
                .history
                .push(history_entry(&step_id, "failed: workflow definition missing", None));
            save_instance(app, &instance, None).await?;
        }
    }

    let refreshed = load_instance(app, instance_id).await?;
    Ok(json!({
        "id": refreshed.id.to_string(),
        "status": refreshed.status,
        "current_step": refreshed.current_step,
    }))
}

fn approval_slot<'a>(
    workflow: &'a WorkflowDef,
    step_id: &str,
    approved: bool,
) -> Option<&'a TransitionSlot> {
    let step = workflow.step(step_id)?;
    match &step.kind {
        StepKind::Approval {
            on_approve,
            on_reject,
            ..
        } => {
            if approved {
                on_approve.as_ref()
            } else {
                on_reject.as_ref()
            }
        }
        _ => None,
    }
}

fn timeout_slot<'a>(step: &'a StepDef) -> Option<&'a TransitionSlot> {
    match &step.kind {
        StepKind::Approval { on_timeout, .. } => on_timeout.as_ref(),
        _ => None,
    }
}

/// Timeout scheduler tick: claim each expired approval via CAS and advance
/// it through `on_timeout`. Returns how many instances were processed.
pub async fn run_timeout_scan(app: &Arc<AppContext>) -> u32 {
    let expired: Vec<Uuid> = match sqlx::query_scalar(
        "SELECT id FROM _workflow_instances
         WHERE status = 'waiting_approval'
           AND current_step_deadline IS NOT NULL
           AND current_step_deadline < now()
         ORDER BY current_step_deadline
         LIMIT 200",
    )
    .fetch_all(&app.pool)
    .await
    {
        Ok(ids) => ids,
        Err(error) => {
            tracing::warn!(error = %error, "Timeout scan query failed");
            return 0;
        }
    };

    let mut processed = 0;
    for instance_id in expired {
        let claimed = sqlx::query(
            "UPDATE _workflow_instances
             SET status = 'running', current_step_deadline = NULL, updated_at = now()
             WHERE id = $1 AND status = 'waiting_approval'",
        )
        .bind(instance_id)
        .execute(&app.pool)
        .await
        .map(|result| result.rows_affected() > 0)
        .unwrap_or(false);
        if !claimed {
            continue;
        }

        if let Err(error) = fire_timeout(app, instance_id).await {
            tracing::warn!(instance = %instance_id, error = %error, "Timeout handling failed");
        }
        processed += 1;
    }
    processed
}

async fn fire_timeout(app: &Arc<AppContext>, instance_id: Uuid) -> AppResult<()> {
    let snapshot = app.registry.snapshot();
    let mut instance = load_instance(app, instance_id).await?;
    let step_id = instance.current_step.clone().unwrap_or_default();
    instance
        .history
        .push(history_entry(&step_id, "timeout", None));

    let Some(workflow) = snapshot.workflow(instance.workflow_id) else {
        instance.status = InstanceStatus::Failed.as_str().to_string();
        save_instance(app, &instance, None).await?;
        return Ok(());
    };
    let slot = workflow.step(&step_id).and_then(timeout_slot);
    apply_slot(app, &workflow, &mut instance, slot, &step_id).await?;
    save_instance(app, &instance, None).await?;
    if instance.status == InstanceStatus::Running.as_str() {
        advance(app, instance_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(value: Value) -> WorkflowDef {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn trigger_matching_honours_from_status() {
        let any_from = workflow(json!({
            "id": 1, "name": "on-paid",
            "trigger": {"entity": "invoice", "to_status": "paid"},
            "steps": [{"id": "s1", "type": "action", "actions": [], "then": "end"}]
        }));
        assert!(trigger_matches(&any_from, Some("sent"), "paid"));
        assert!(trigger_matches(&any_from, None, "paid"));
        assert!(!trigger_matches(&any_from, Some("sent"), "overdue"));

        let narrow = workflow(json!({
            "id": 2, "name": "sent-to-paid",
            "trigger": {"entity": "invoice", "from_status": "sent", "to_status": "paid"},
            "steps": [{"id": "s1", "type": "action", "actions": [], "then": "end"}]
        }));
        assert!(trigger_matches(&narrow, Some("sent"), "paid"));
        assert!(!trigger_matches(&narrow, Some("overdue"), "paid"));
        assert!(!trigger_matches(&narrow, None, "paid"));
    }

    #[test]
    fn approval_slot_picks_branch() {
        let wf = workflow(json!({
            "id": 3, "name": "approve-discount",
            "trigger": {"entity": "order", "to_status": "discount_requested"},
            "steps": [{
                "id": "review",
                "type": "approval",
                "timeout": "1h",
                "on_approve": "apply",
                "on_reject": "end",
                "on_timeout": {"actions": [], "goto": "end"}
            }, {
                "id": "apply", "type": "action", "actions": [], "then": "end"
            }]
        }));
        assert_eq!(approval_slot(&wf, "review", true).unwrap().goto(), "apply");
        assert_eq!(approval_slot(&wf, "review", false).unwrap().goto(), "end");
        assert!(approval_slot(&wf, "apply", true).is_none());
        assert_eq!(
            timeout_slot(wf.step("review").unwrap()).unwrap().goto(),
            "end"
        );
    }

    #[test]
    fn history_entries_carry_actor_only_when_present() {
        let with_actor = history_entry("review", "approved", Some("u1"));
        assert_eq!(with_actor["actor"], json!("u1"));
        assert_eq!(with_actor["outcome"], json!("approved"));
        let without = history_entry("review", "timeout", None);
        assert!(without.get("actor").is_none());
        assert!(without["timestamp"].as_str().is_some());
    }
}
