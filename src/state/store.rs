use crate::state::entity::{
    DerivedModel, DerivedTable, DimensionDefinition, EntityRecord, EntitySnapshot, EntityType,
    MeasureDefinition, MetricsDefinition, PersistentModel, PersistentTable, StateType,
};
use chrono::Utc;
use log::debug;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreAction {
    AddEntity,
    UpdateEntity,
    DeleteEntity,
}

/// 推送给 UI 状态层的变更通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    pub entity_type: EntityType,
    pub state_type: StateType,
    pub action: StoreAction,
    pub id: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity_type} with id={id} already exists")]
    DuplicateEntity { entity_type: EntityType, id: String },
    #[error("{entity_type} with id={id} not found")]
    NotFound { entity_type: EntityType, id: String },
    #[error("invalid patch for {entity_type}: {message}")]
    InvalidPatch {
        entity_type: EntityType,
        message: String,
    },
    #[error("derived {entity_type} id={id} has no persistent record")]
    MissingCounterpart { entity_type: EntityType, id: String },
}

/// 按插入顺序保存的一类记录（顺序即 UI 展示顺序）
#[derive(Debug, Clone)]
pub struct EntityCollection<R> {
    records: Vec<R>,
}

impl<R> Default for EntityCollection<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<R: EntityRecord> EntityCollection<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.iter()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.records.iter().find(|r| r.id() == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id() == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut R> {
        self.records.iter_mut().find(|r| r.id() == id)
    }

    fn push(&mut self, record: R) {
        self.records.push(record);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<R> {
        let idx = self.position(id)?;
        Some(self.records.remove(idx))
    }
}

/// 所有实体集合，Persistent 和 Derived 分开存放，只通过 id 关联
#[derive(Debug, Default)]
pub struct StoreState {
    pub(crate) tables: EntityCollection<PersistentTable>,
    pub(crate) derived_tables: EntityCollection<DerivedTable>,
    pub(crate) models: EntityCollection<PersistentModel>,
    pub(crate) derived_models: EntityCollection<DerivedModel>,
    pub(crate) metrics_definitions: EntityCollection<MetricsDefinition>,
    pub(crate) measures: EntityCollection<MeasureDefinition>,
    pub(crate) dimensions: EntityCollection<DimensionDefinition>,
}

/// 进程内唯一的实体仓库，由启动代码构造后以 `Arc` 注入各组件。
///
/// 所有变更都是同步的临界区，不跨 `.await` 持锁；变更完成并释放锁之后
/// 才向订阅者推送 [`StoreEvent`]。
pub struct EntityStore {
    state: RwLock<StoreState>,
    observers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
    clock: AtomicI64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            observers: Mutex::new(Vec::new()),
            clock: AtomicI64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 单调递增的毫秒时间戳，同一毫秒内的多次变更也严格递增
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 接收端已关闭的订阅者直接移除
        observers.retain(|tx| events.iter().all(|evt| tx.send(evt.clone()).is_ok()));
    }

    fn event<R: EntityRecord>(action: StoreAction, id: &str) -> StoreEvent {
        StoreEvent {
            entity_type: R::ENTITY_TYPE,
            state_type: R::STATE_TYPE,
            action,
            id: id.to_string(),
        }
    }

    pub fn add<R: EntityRecord>(&self, mut record: R) -> Result<R, StoreError> {
        record.touch(self.next_timestamp());
        {
            let mut state = self.write();
            if R::collection(&state).contains(record.id()) {
                return Err(StoreError::DuplicateEntity {
                    entity_type: R::ENTITY_TYPE,
                    id: record.id().to_string(),
                });
            }
            if !R::counterpart_present(&state, record.id()) {
                return Err(StoreError::MissingCounterpart {
                    entity_type: R::ENTITY_TYPE,
                    id: record.id().to_string(),
                });
            }
            R::collection_mut(&mut state).push(record.clone());
        }
        debug!("addEntity {} {:?} {}", R::ENTITY_TYPE, R::STATE_TYPE, record.id());
        self.notify(vec![Self::event::<R>(StoreAction::AddEntity, record.id())]);
        Ok(record)
    }

    /// 以 JSON 对象的形式合并部分字段；`id` 与 `lastUpdated` 不可被 patch 覆盖
    pub fn update<R: EntityRecord>(&self, id: &str, patch: Value) -> Result<R, StoreError> {
        let Value::Object(fields) = patch else {
            return Err(StoreError::InvalidPatch {
                entity_type: R::ENTITY_TYPE,
                message: "patch must be a JSON object".to_string(),
            });
        };

        self.try_update(id, move |record: &mut R| {
            let invalid = |e: serde_json::Error| StoreError::InvalidPatch {
                entity_type: R::ENTITY_TYPE,
                message: e.to_string(),
            };
            let mut current = serde_json::to_value(&*record).map_err(invalid)?;
            if let Value::Object(map) = &mut current {
                for (key, value) in fields {
                    if key == "id" || key == "lastUpdated" {
                        continue;
                    }
                    map.insert(key, value);
                }
            }
            *record = serde_json::from_value(current).map_err(invalid)?;
            Ok(())
        })
    }

    pub fn update_with<R: EntityRecord>(
        &self,
        id: &str,
        f: impl FnOnce(&mut R),
    ) -> Result<R, StoreError> {
        self.try_update(id, |record| {
            f(record);
            Ok(())
        })
    }

    fn try_update<R: EntityRecord>(
        &self,
        id: &str,
        f: impl FnOnce(&mut R) -> Result<(), StoreError>,
    ) -> Result<R, StoreError> {
        let ts = self.next_timestamp();
        let updated = {
            let mut state = self.write();
            let record = R::collection_mut(&mut state)
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound {
                    entity_type: R::ENTITY_TYPE,
                    id: id.to_string(),
                })?;
            // 先在副本上修改，失败时原记录保持不变
            let mut draft = record.clone();
            f(&mut draft)?;
            draft.set_id(id.to_string());
            draft.touch(ts);
            *record = draft.clone();
            draft
        };
        self.notify(vec![Self::event::<R>(StoreAction::UpdateEntity, id)]);
        Ok(updated)
    }

    pub fn delete<R: EntityRecord>(&self, id: &str) -> Result<R, StoreError> {
        let (removed, cascaded) = {
            let mut state = self.write();
            let removed =
                R::collection_mut(&mut state)
                    .remove(id)
                    .ok_or_else(|| StoreError::NotFound {
                        entity_type: R::ENTITY_TYPE,
                        id: id.to_string(),
                    })?;
            (removed, R::cascade_delete(&mut state, id))
        };

        let mut events = vec![Self::event::<R>(StoreAction::DeleteEntity, id)];
        if let Some((entity_type, state_type)) = cascaded {
            events.push(StoreEvent {
                entity_type,
                state_type,
                action: StoreAction::DeleteEntity,
                id: id.to_string(),
            });
        }
        debug!("deleteEntity {} {:?} {}", R::ENTITY_TYPE, R::STATE_TYPE, id);
        self.notify(events);
        Ok(removed)
    }

    pub fn get_by_id<R: EntityRecord>(&self, id: &str) -> Option<R> {
        R::collection(&self.read()).get(id).cloned()
    }

    pub fn contains<R: EntityRecord>(&self, id: &str) -> bool {
        R::collection(&self.read()).contains(id)
    }

    /// 按 JSON 字段名（camelCase）过滤，保持插入顺序
    pub fn get_many_by_field<R: EntityRecord>(&self, field: &str, value: &Value) -> Vec<R> {
        let state = self.read();
        R::collection(&state)
            .iter()
            .filter(|r| {
                serde_json::to_value(r)
                    .ok()
                    .and_then(|v| v.get(field).cloned())
                    .as_ref()
                    == Some(value)
            })
            .cloned()
            .collect()
    }

    pub fn list<R: EntityRecord>(&self) -> Vec<R> {
        R::collection(&self.read()).iter().cloned().collect()
    }

    pub fn filter<R: EntityRecord>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        R::collection(&self.read())
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub fn count<R: EntityRecord>(&self) -> usize {
        R::collection(&self.read()).len()
    }

    /// 读取任意实体类型的持久记录
    pub fn snapshot(&self, entity_type: EntityType, id: &str) -> Option<EntitySnapshot> {
        let state = self.read();
        match entity_type {
            EntityType::Table => state.tables.get(id).cloned().map(EntitySnapshot::Table),
            EntityType::Model => state.models.get(id).cloned().map(EntitySnapshot::Model),
            EntityType::MetricsDefinition => state
                .metrics_definitions
                .get(id)
                .cloned()
                .map(EntitySnapshot::MetricsDefinition),
            EntityType::MeasureDefinition => state
                .measures
                .get(id)
                .cloned()
                .map(EntitySnapshot::MeasureDefinition),
            EntityType::DimensionDefinition => state
                .dimensions
                .get(id)
                .cloned()
                .map(EntitySnapshot::DimensionDefinition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::ValidationState;
    use crate::state::factory;
    use serde_json::json;

    fn measure(id: &str, metrics_def_id: &str, expression: &str) -> MeasureDefinition {
        let mut m = factory::new_measure_definition(metrics_def_id, expression);
        m.id = id.to_string();
        m
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let store = EntityStore::new();
        store.add(measure("m1", "d1", "count(*)")).unwrap();
        let err = store.add(measure("m1", "d1", "sum(x)")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntity { .. }));
        assert_eq!(store.count::<MeasureDefinition>(), 1);
    }

    #[test]
    fn test_last_write_wins_and_insertion_order_kept() {
        let store = EntityStore::new();
        for id in ["a", "b", "c", "d"] {
            store.add(measure(id, "d1", "count(*)")).unwrap();
        }
        store
            .update::<MeasureDefinition>("b", json!({"expression": "sum(x)"}))
            .unwrap();
        store
            .update::<MeasureDefinition>("b", json!({"expression": "avg(x)"}))
            .unwrap();
        store.delete::<MeasureDefinition>("c").unwrap();
        store.add(measure("e", "d1", "max(y)")).unwrap();

        let ids: Vec<String> = store
            .list::<MeasureDefinition>()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "d", "e"]);
        let b = store.get_by_id::<MeasureDefinition>("b").unwrap();
        assert_eq!(b.expression, "avg(x)");
        assert!(store.get_by_id::<MeasureDefinition>("c").is_none());
    }

    #[test]
    fn test_update_merges_and_bumps_last_updated() {
        let store = EntityStore::new();
        let added = store.add(measure("m1", "d1", "count(*)")).unwrap();
        let updated = store
            .update::<MeasureDefinition>(
                "m1",
                json!({"label": "Total", "id": "hijack", "lastUpdated": 0}),
            )
            .unwrap();
        assert_eq!(updated.id, "m1");
        assert_eq!(updated.label, "Total");
        assert_eq!(updated.expression, "count(*)");
        assert!(updated.last_updated > added.last_updated);
    }

    #[test]
    fn test_invalid_patch_leaves_record_untouched() {
        let store = EntityStore::new();
        store.add(measure("m1", "d1", "count(*)")).unwrap();
        let err = store
            .update::<MeasureDefinition>("m1", json!({"expressionIsValid": "MAYBE"}))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPatch { .. }));
        let m = store.get_by_id::<MeasureDefinition>("m1").unwrap();
        assert_eq!(m.expression_is_valid, ValidationState::Pending);
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let store = EntityStore::new();
        let err = store
            .update::<MeasureDefinition>("nope", json!({"label": "x"}))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        let err = store.delete::<MeasureDefinition>("nope").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_get_many_by_field_preserves_order() {
        let store = EntityStore::new();
        store.add(measure("m1", "d1", "count(*)")).unwrap();
        store.add(measure("m2", "d2", "count(*)")).unwrap();
        store.add(measure("m3", "d1", "sum(x)")).unwrap();
        let found = store.get_many_by_field::<MeasureDefinition>("metricsDefId", &json!("d1"));
        let ids: Vec<&str> = found.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[test]
    fn test_derived_requires_persistent_and_cascades() {
        let store = EntityStore::new();
        let model = factory::new_model("orders", "select 1");
        let derived = factory::new_derived_model(&model);
        let err = store.add(derived.clone()).unwrap_err();
        assert!(matches!(err, StoreError::MissingCounterpart { .. }));

        store.add(model.clone()).unwrap();
        store.add(derived).unwrap();
        store.delete::<PersistentModel>(&model.id).unwrap();
        assert!(store.get_by_id::<DerivedModel>(&model.id).is_none());
    }

    #[tokio::test]
    async fn test_observers_see_events_after_mutation() {
        let store = EntityStore::new();
        let mut rx = store.subscribe();
        store.add(measure("m1", "d1", "count(*)")).unwrap();
        store
            .update::<MeasureDefinition>("m1", json!({"label": "x"}))
            .unwrap();
        store.delete::<MeasureDefinition>("m1").unwrap();

        let actions: Vec<StoreAction> = (0..3)
            .map(|_| rx.try_recv().unwrap())
            .map(|evt| {
                assert_eq!(evt.entity_type, EntityType::MeasureDefinition);
                assert_eq!(evt.id, "m1");
                evt.action
            })
            .collect();
        assert_eq!(
            actions,
            vec![
                StoreAction::AddEntity,
                StoreAction::UpdateEntity,
                StoreAction::DeleteEntity
            ]
        );
    }

    #[test]
    fn test_closed_subscriber_is_pruned() {
        let store = EntityStore::new();
        drop(store.subscribe());
        store.add(measure("m1", "d1", "count(*)")).unwrap();
        assert!(store.observers.lock().unwrap().is_empty());
    }
}
