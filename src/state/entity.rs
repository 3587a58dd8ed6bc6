use crate::state::store::{EntityCollection, StoreState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Table,
    Model,
    MetricsDefinition,
    MeasureDefinition,
    DimensionDefinition,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Table => "Table",
            EntityType::Model => "Model",
            EntityType::MetricsDefinition => "MetricsDefinition",
            EntityType::MeasureDefinition => "MeasureDefinition",
            EntityType::DimensionDefinition => "DimensionDefinition",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Persistent,
    Derived,
}

/// 派生记录的计算状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntityStatus {
    #[default]
    Idle,
    Running,
    Error,
}

/// Measure 表达式校验状态：PENDING -> VALIDATING -> OK / ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationState {
    #[default]
    Pending,
    Validating,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

impl ProfileColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }

    pub fn is_temporal(&self) -> bool {
        let t = self.column_type.to_ascii_uppercase();
        t.contains("TIMESTAMP") || t.contains("DATE") || t.contains("TIME")
    }

    pub fn is_text(&self) -> bool {
        let t = self.column_type.to_ascii_uppercase();
        t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB") || t == "STRING"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_from: Option<String>,
}

impl ExpressionError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentTable {
    pub id: String,
    pub name: String,
    pub path: String,
    pub table_name: String,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedTable {
    pub id: String,
    #[serde(default)]
    pub profile: Vec<ProfileColumn>,
    #[serde(default)]
    pub cardinality: Option<i64>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentModel {
    pub id: String,
    pub name: String,
    pub query: String,
    pub table_name: String,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedModel {
    pub id: String,
    // 为空表示还没有 profile 过
    #[serde(default)]
    pub sanitized_query: String,
    #[serde(default)]
    pub profile: Vec<ProfileColumn>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_updated: i64,
}

impl DerivedModel {
    pub fn has_column(&self, name: &str) -> bool {
        self.profile.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsDefinition {
    pub id: String,
    pub metric_def_label: String,
    #[serde(default)]
    pub source_model_id: Option<String>,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub measure_ids: Vec<String>,
    #[serde(default)]
    pub dimension_ids: Vec<String>,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureDefinition {
    pub id: String,
    pub metrics_def_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub sql_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub format_preset: String,
    #[serde(default)]
    pub expression_is_valid: ValidationState,
    #[serde(default)]
    pub expression_validation_error: Option<ExpressionError>,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDefinition {
    pub id: String,
    pub metrics_def_id: String,
    #[serde(default)]
    pub dimension_column: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub last_updated: i64,
}

/// Entity Store 中每一类记录的公共契约。
///
/// `collection` / `collection_mut` 把记录类型映射到 `StoreState` 中对应的有序集合，
/// `cascade_delete` 和 `counterpart_present` 用来维持 Persistent/Derived 的一一对应。
pub trait EntityRecord:
    Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
    const ENTITY_TYPE: EntityType;
    const STATE_TYPE: StateType;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn last_updated(&self) -> i64;
    fn touch(&mut self, ts: i64);

    fn collection(state: &StoreState) -> &EntityCollection<Self>;
    fn collection_mut(state: &mut StoreState) -> &mut EntityCollection<Self>;

    /// 派生记录必须有同 id 的持久记录
    fn counterpart_present(_state: &StoreState, _id: &str) -> bool {
        true
    }

    /// 删除持久记录时顺带删除同 id 的派生记录
    fn cascade_delete(_state: &mut StoreState, _id: &str) -> Option<(EntityType, StateType)> {
        None
    }
}

macro_rules! entity_record {
    (@base $ty:ty, $entity:expr, $state:expr, $field:ident, { $($extra:tt)* }) => {
        impl EntityRecord for $ty {
            const ENTITY_TYPE: EntityType = $entity;
            const STATE_TYPE: StateType = $state;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn last_updated(&self) -> i64 {
                self.last_updated
            }

            fn touch(&mut self, ts: i64) {
                self.last_updated = ts;
            }

            fn collection(state: &StoreState) -> &EntityCollection<Self> {
                &state.$field
            }

            fn collection_mut(state: &mut StoreState) -> &mut EntityCollection<Self> {
                &mut state.$field
            }

            $($extra)*
        }
    };
    ($ty:ty, $entity:expr, $state:expr, $field:ident) => {
        entity_record!(@base $ty, $entity, $state, $field, {});
    };
    ($ty:ty, $entity:expr, $state:expr, $field:ident, derived_of = $persistent:ident) => {
        entity_record!(@base $ty, $entity, $state, $field, {
            fn counterpart_present(state: &StoreState, id: &str) -> bool {
                state.$persistent.contains(id)
            }
        });
    };
    ($ty:ty, $entity:expr, $state:expr, $field:ident, derived = $derived:ident) => {
        entity_record!(@base $ty, $entity, $state, $field, {
            fn cascade_delete(state: &mut StoreState, id: &str) -> Option<(EntityType, StateType)> {
                state
                    .$derived
                    .remove(id)
                    .map(|_| ($entity, StateType::Derived))
            }
        });
    };
}

entity_record!(
    PersistentTable,
    EntityType::Table,
    StateType::Persistent,
    tables,
    derived = derived_tables
);
entity_record!(
    DerivedTable,
    EntityType::Table,
    StateType::Derived,
    derived_tables,
    derived_of = tables
);
entity_record!(
    PersistentModel,
    EntityType::Model,
    StateType::Persistent,
    models,
    derived = derived_models
);
entity_record!(
    DerivedModel,
    EntityType::Model,
    StateType::Derived,
    derived_models,
    derived_of = models
);
entity_record!(
    MetricsDefinition,
    EntityType::MetricsDefinition,
    StateType::Persistent,
    metrics_definitions
);
entity_record!(MeasureDefinition, EntityType::MeasureDefinition, StateType::Persistent, measures);
entity_record!(
    DimensionDefinition,
    EntityType::DimensionDefinition,
    StateType::Persistent,
    dimensions
);

/// 分发管线解析出的持久记录快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntitySnapshot {
    Table(PersistentTable),
    Model(PersistentModel),
    MetricsDefinition(MetricsDefinition),
    MeasureDefinition(MeasureDefinition),
    DimensionDefinition(DimensionDefinition),
}

impl EntitySnapshot {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntitySnapshot::Table(_) => EntityType::Table,
            EntitySnapshot::Model(_) => EntityType::Model,
            EntitySnapshot::MetricsDefinition(_) => EntityType::MetricsDefinition,
            EntitySnapshot::MeasureDefinition(_) => EntityType::MeasureDefinition,
            EntitySnapshot::DimensionDefinition(_) => EntityType::DimensionDefinition,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntitySnapshot::Table(r) => &r.id,
            EntitySnapshot::Model(r) => &r.id,
            EntitySnapshot::MetricsDefinition(r) => &r.id,
            EntitySnapshot::MeasureDefinition(r) => &r.id,
            EntitySnapshot::DimensionDefinition(r) => &r.id,
        }
    }
}
