use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::metadata;
use crate::schemas::{
    EntityDef, PermAction, PermissionDef, RelationDef, RuleDef, RuleHook, StateMachineDef,
    WebhookDef, WebhookHook, WorkflowDef,
};

/// One immutable view of all declarative artifacts, indexed for the hot
/// lookups of the write pipeline. A reload builds a fresh snapshot and swaps
/// the pointer; readers hold whichever snapshot they started with.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entities: HashMap<String, Arc<EntityDef>>,
    tables: HashMap<String, String>,
    relations: HashMap<String, Arc<RelationDef>>,
    relations_by_source: HashMap<String, Vec<Arc<RelationDef>>>,
    rules: HashMap<(String, RuleHook), Vec<Arc<RuleDef>>>,
    state_machines: HashMap<String, Vec<Arc<StateMachineDef>>>,
    workflows: HashMap<i64, Arc<WorkflowDef>>,
    workflows_by_trigger: HashMap<(String, String), Vec<Arc<WorkflowDef>>>,
    permissions: HashMap<(String, PermAction), Vec<Arc<PermissionDef>>>,
    webhooks: HashMap<(String, WebhookHook), Vec<Arc<WebhookDef>>>,
}

impl RegistrySnapshot {
    pub fn build(
        entities: Vec<EntityDef>,
        relations: Vec<RelationDef>,
        rules: Vec<RuleDef>,
        state_machines: Vec<StateMachineDef>,
        workflows: Vec<WorkflowDef>,
        permissions: Vec<PermissionDef>,
        webhooks: Vec<WebhookDef>,
    ) -> Result<Self, AppError> {
        let mut snapshot = RegistrySnapshot::default();

        for entity in entities {
            entity.validate_shape()?;
            if let Some(owner) = snapshot.tables.get(&entity.table) {
                return Err(AppError::Conflict(format!(
                    "Entities '{owner}' and '{}' share table '{}'.",
                    entity.name, entity.table
                )));
            }
            snapshot
                .tables
                .insert(entity.table.clone(), entity.name.clone());
            snapshot
                .entities
                .insert(entity.name.clone(), Arc::new(entity));
        }

        for relation in relations {
            relation.validate_shape()?;
            let shared = Arc::new(relation);
            snapshot
                .relations_by_source
                .entry(shared.source.clone())
                .or_default()
                .push(shared.clone());
            snapshot.relations.insert(shared.name.clone(), shared);
        }

        for rule in rules {
            if !rule.active {
                continue;
            }
            snapshot
                .rules
                .entry((rule.entity.clone(), rule.hook))
                .or_default()
                .push(Arc::new(rule));
        }
        for bucket in snapshot.rules.values_mut() {
            bucket.sort_by_key(|rule| (rule.priority, rule.id));
        }

        for machine in state_machines {
            snapshot
                .state_machines
                .entry(machine.entity.clone())
                .or_default()
                .push(Arc::new(machine));
        }

        for workflow in workflows {
            let shared = Arc::new(workflow);
            snapshot.workflows.insert(shared.id, shared.clone());
            snapshot
                .workflows_by_trigger
                .entry((
                    shared.trigger.entity.clone(),
                    shared.trigger.to_status.clone(),
                ))
                .or_default()
                .push(shared);
        }

        for permission in permissions {
            snapshot
                .permissions
                .entry((permission.entity.clone(), permission.action))
                .or_default()
                .push(Arc::new(permission));
        }

        for webhook in webhooks {
            if !webhook.active {
                continue;
            }
            snapshot
                .webhooks
                .entry((webhook.entity.clone(), webhook.hook))
                .or_default()
                .push(Arc::new(webhook));
        }
        for bucket in snapshot.webhooks.values_mut() {
            bucket.sort_by_key(|webhook| webhook.id);
        }

        Ok(snapshot)
    }

    pub fn entity(&self, name: &str) -> Result<Arc<EntityDef>, AppError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownEntity(name.to_string()))
    }

    pub fn entity_opt(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.entities.get(name).cloned()
    }

    pub fn table_owner(&self, table: &str) -> Option<&str> {
        self.tables.get(table).map(String::as_str)
    }

    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn relation(&self, name: &str) -> Option<Arc<RelationDef>> {
        self.relations.get(name).cloned()
    }

    pub fn relations_for(&self, source_entity: &str) -> &[Arc<RelationDef>] {
        self.relations_by_source
            .get(source_entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rules_for(&self, entity: &str, hook: RuleHook) -> &[Arc<RuleDef>] {
        self.rules
            .get(&(entity.to_string(), hook))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn state_machines_for(&self, entity: &str) -> &[Arc<StateMachineDef>] {
        self.state_machines
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn workflow(&self, id: i64) -> Option<Arc<WorkflowDef>> {
        self.workflows.get(&id).cloned()
    }

    /// Workflows triggered by a transition into `to_status`; `from_status`
    /// filters apply at the call site where the old state is known.
    pub fn workflows_for(&self, entity: &str, to_status: &str) -> &[Arc<WorkflowDef>] {
        self.workflows_by_trigger
            .get(&(entity.to_string(), to_status.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn permissions_for(&self, entity: &str, action: PermAction) -> &[Arc<PermissionDef>] {
        self.permissions
            .get(&(entity.to_string(), action))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn webhooks_for(&self, entity: &str, hook: WebhookHook) -> &[Arc<WebhookDef>] {
        self.webhooks
            .get(&(entity.to_string(), hook))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn install(&self, snapshot: RegistrySnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }

    /// Re-read every metadata table and swap the snapshot atomically.
    pub async fn reload(&self, pool: &PgPool) -> Result<(), AppError> {
        let entities = metadata::load_entities(pool).await?;
        let relations = metadata::load_relations(pool).await?;
        let rules = metadata::load_rules(pool).await?;
        let state_machines = metadata::load_state_machines(pool).await?;
        let workflows = metadata::load_workflows(pool).await?;
        let permissions = metadata::load_permissions(pool).await?;
        let webhooks = metadata::load_webhooks(pool).await?;

        let snapshot = RegistrySnapshot::build(
            entities,
            relations,
            rules,
            state_machines,
            workflows,
            permissions,
            webhooks,
        )?;
        self.install(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(name: &str, table: &str) -> EntityDef {
        serde_json::from_value(json!({
            "name": name,
            "table": table,
            "primary_key": {"field": "id", "type": "uuid"},
            "fields": [{"name": "id", "type": "uuid"}]
        }))
        .unwrap()
    }

    #[test]
    fn build_rejects_shared_tables() {
        let result = RegistrySnapshot::build(
            vec![entity("order", "orders"), entity("invoice", "orders")],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn rules_sorted_by_priority_and_inactive_skipped() {
        let rules: Vec<RuleDef> = vec![
            serde_json::from_value(json!({
                "id": 1, "entity": "order", "hook": "before_write",
                "type": "expression", "expression": "record.total < 0", "priority": 5
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": 2, "entity": "order", "hook": "before_write",
                "type": "expression", "expression": "record.total > 9000", "priority": 1
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": 3, "entity": "order", "hook": "before_write",
                "type": "expression", "expression": "false", "priority": 0, "active": false
            }))
            .unwrap(),
        ];
        let snapshot = RegistrySnapshot::build(
            vec![entity("order", "orders")],
            vec![],
            rules,
            vec![],
            vec![],
            vec![],
            vec![],
        )
        .unwrap();
        let bucket = snapshot.rules_for("order", RuleHook::BeforeWrite);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].id, 2);
        assert_eq!(bucket[1].id, 1);
    }

    #[test]
    fn webhooks_sorted_by_id() {
        let webhooks: Vec<WebhookDef> = vec![
            serde_json::from_value(json!({
                "id": 9, "entity": "order", "hook": "before_write",
                "url": "https://example.test/b"
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "id": 3, "entity": "order", "hook": "before_write",
                "url": "https://example.test/a"
            }))
            .unwrap(),
        ];
        let snapshot = RegistrySnapshot::build(
            vec![entity("order", "orders")],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
            webhooks,
        )
        .unwrap();
        let bucket = snapshot.webhooks_for("order", WebhookHook::BeforeWrite);
        assert_eq!(bucket[0].id, 3);
        assert_eq!(bucket[1].id, 9);
    }

    #[test]
    fn snapshot_swap_is_atomic_for_readers() {
        let registry = Registry::empty();
        let before = registry.snapshot();
        registry.install(
            RegistrySnapshot::build(
                vec![entity("order", "orders")],
                vec![],
                vec![],
                vec![],
                vec![],
                vec![],
                vec![],
            )
            .unwrap(),
        );
        // The old Arc still resolves to the old view; a fresh snapshot sees the new one.
        assert!(before.entity_opt("order").is_none());
        assert!(registry.snapshot().entity_opt("order").is_some());
    }

    #[test]
    fn unknown_entity_is_typed() {
        let snapshot = RegistrySnapshot::default();
        assert!(matches!(
            snapshot.entity("ghost"),
            Err(AppError::UnknownEntity(_))
        ));
    }
}
