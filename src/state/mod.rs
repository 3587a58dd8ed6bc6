pub mod entity;
pub mod factory;
pub mod store;

pub use entity::{
    DerivedModel, DerivedTable, DimensionDefinition, EntityRecord, EntitySnapshot, EntityStatus,
    EntityType, ExpressionError, MeasureDefinition, MetricsDefinition, PersistentModel,
    PersistentTable, ProfileColumn, StateType, ValidationState,
};
pub use store::{EntityStore, StoreAction, StoreError, StoreEvent};
