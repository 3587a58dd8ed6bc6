pub mod dimensions;
pub mod measures;
pub mod messages;
pub mod metrics_definition;
pub mod metrics_view;
pub mod session;
pub mod sources;

use crate::config::AppConfig;
use crate::dispatch::{ActionError, ActionRegistry, Dispatcher, RegistryError, StoreAccess};
use crate::engine::{EngineOperation, EngineOutput};
use crate::queue::{ActionDescriptor, DatabaseActionQueue, QueueError, QueuePriority};
use crate::state::{
    DerivedModel, EntityRecord, EntityStore, MetricsDefinition, PersistentModel,
};
use std::sync::Arc;

pub use session::ActiveEntity;

/// 所有 action 共享的服务句柄
#[derive(Clone)]
pub struct ActionServices {
    pub store: Arc<EntityStore>,
    pub queue: DatabaseActionQueue,
    pub config: Arc<AppConfig>,
    pub active: Arc<ActiveEntity>,
}

impl StoreAccess for ActionServices {
    fn store(&self) -> &EntityStore {
        &self.store
    }
}

impl ActionServices {
    pub fn new(store: Arc<EntityStore>, queue: DatabaseActionQueue, config: AppConfig) -> Self {
        Self {
            store,
            queue,
            config: Arc::new(config),
            active: Arc::new(ActiveEntity::default()),
        }
    }

    /// 当前选中实体（及其关联的 source model）用 ActiveEntity，
    /// 有别的实体被选中时用 Inactive，都没有时用 Background
    pub fn priority_for(&self, owner_id: &str) -> QueuePriority {
        match self.active.get() {
            None => QueuePriority::Background,
            Some(active) if self.related_to_active(&active, owner_id) => {
                QueuePriority::ActiveEntity
            }
            Some(_) => QueuePriority::Inactive,
        }
    }

    fn related_to_active(&self, active: &str, owner_id: &str) -> bool {
        if active == owner_id {
            return true;
        }
        self.store
            .get_by_id::<MetricsDefinition>(active)
            .and_then(|def| def.source_model_id)
            .is_some_and(|model_id| model_id == owner_id)
    }

    pub async fn run(
        &self,
        owner_id: &str,
        priority: QueuePriority,
        operation: EngineOperation,
    ) -> Result<EngineOutput, QueueError> {
        self.queue
            .enqueue(ActionDescriptor::new(owner_id, priority), operation)
            .await
    }

    pub fn metrics_definition(&self, id: &str) -> Result<MetricsDefinition, ActionError> {
        self.store
            .get_by_id::<MetricsDefinition>(id)
            .ok_or_else(|| ActionError::entity(messages::EXPLORER_METRICS_DEFINITION_DOESNT_EXIST))
    }

    /// 读取 metrics definition 的 source model（持久 + 派生）
    pub fn source_model(
        &self,
        def: &MetricsDefinition,
    ) -> Result<(PersistentModel, DerivedModel), ActionError> {
        let missing = || ActionError::entity(messages::EXPLORER_SOURCE_MODEL_DOESNT_EXIST);
        let model_id = def
            .source_model_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(missing)?;
        let model = self
            .store
            .get_by_id::<PersistentModel>(model_id)
            .ok_or_else(missing)?;
        let derived = self
            .store
            .get_by_id::<DerivedModel>(model_id)
            .ok_or_else(missing)?;
        Ok((model, derived))
    }
}

/// 按 id 列表的顺序排列记录，不在列表里的排在最后
pub(crate) fn ordered_by_ids<R: EntityRecord>(ids: &[String], mut records: Vec<R>) -> Vec<R> {
    records.sort_by_key(|r| ids.iter().position(|id| id == r.id()).unwrap_or(usize::MAX));
    records
}

pub fn build_dispatcher(
    services: ActionServices,
) -> Result<Dispatcher<ActionServices>, RegistryError> {
    ActionRegistry::new()
        .register_class("SourceActions", sources::registrations())
        .register_class(
            "MetricsDefinitionActions",
            metrics_definition::registrations(),
        )
        .register_class("MeasuresActions", measures::registrations())
        .register_class("DimensionsActions", dimensions::registrations())
        .register_class("MetricsViewActions", metrics_view::registrations())
        .register_class("SessionActions", session::registrations())
        .build(services)
}
