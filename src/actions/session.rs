use crate::actions::ActionServices;
use crate::dispatch::{
    wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget, RequestContext,
};
use crate::queue::QueuePriority;
use crate::state::{EntityType, MetricsDefinition};
use log::info;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

/// 当前在 UI 中被选中的实体
#[derive(Debug, Default)]
pub struct ActiveEntity {
    current: RwLock<Option<String>>,
}

impl ActiveEntity {
    pub fn get(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set(&self, id: Option<String>) -> Option<String> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, id)
    }
}

const ENTITY_TYPES: [EntityType; 5] = [
    EntityType::Table,
    EntityType::Model,
    EntityType::MetricsDefinition,
    EntityType::MeasureDefinition,
    EntityType::DimensionDefinition,
];

/// 切换当前实体，并把它排队中的工作提升到 ActiveEntity
pub async fn set_active_entity(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?.to_string();
    let entity_type = ENTITY_TYPES
        .iter()
        .copied()
        .find(|t| services.store.snapshot(*t, &id).is_some())
        .ok_or_else(|| ActionError::entity(format!("No entity found for id={}", id)))?;

    services.active.set(Some(id.clone()));
    let mut promoted = services.queue.prioritize(&id, QueuePriority::ActiveEntity);
    if let Some(model_id) = services
        .store
        .get_by_id::<MetricsDefinition>(&id)
        .and_then(|def| def.source_model_id)
    {
        promoted += services
            .queue
            .prioritize(&model_id, QueuePriority::ActiveEntity);
    }
    info!("🎯 active entity: {} {} (promoted {})", entity_type, id, promoted);

    ActionOutput::json(&json!({
        "activeEntityId": id,
        "entityType": entity_type,
        "promoted": promoted,
    }))
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    vec![ActionRegistration::new(
        "setActiveEntity",
        ContextTarget::None,
        wrap(set_active_entity),
    )]
}
