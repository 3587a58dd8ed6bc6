use crate::actions::ActionServices;
use crate::dispatch::{
    arg, opt_arg, wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget,
    RequestContext,
};
use crate::state::factory;
use crate::state::{DimensionDefinition, EntityType, MetricsDefinition};
use serde_json::Value;
use std::sync::Arc;

pub(crate) fn dimension_of(
    services: &ActionServices,
    metrics_def_id: &str,
    dimension_id: &str,
) -> Result<DimensionDefinition, ActionError> {
    services
        .store
        .get_by_id::<DimensionDefinition>(dimension_id)
        .filter(|d| d.metrics_def_id == metrics_def_id)
        .ok_or_else(|| {
            ActionError::entity(format!(
                "No dimension found for id={} in metrics definition {}",
                dimension_id, metrics_def_id
            ))
        })
}

pub async fn add_new_dimension(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let column: Option<String> = opt_arg(&args, 0, "dimensionColumn")?;
    let dimension = services.store.add(factory::new_dimension_definition(
        metrics_def_id,
        column.as_deref().unwrap_or_default(),
    ))?;
    services
        .store
        .update_with::<MetricsDefinition>(metrics_def_id, |d| {
            d.dimension_ids.push(dimension.id.clone())
        })?;
    ActionOutput::json(&dimension)
}

pub async fn update_dimension(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let dimension_id: String = arg(&args, 0, "dimensionId")?;
    let mut patch: Value = arg(&args, 1, "modifications")?;
    dimension_of(&services, metrics_def_id, &dimension_id)?;

    if let Value::Object(map) = &mut patch {
        map.remove("metricsDefId");
    }
    let dimension = services
        .store
        .update::<DimensionDefinition>(&dimension_id, patch)?;
    ActionOutput::json(&dimension)
}

pub async fn delete_dimension(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let dimension_id: String = arg(&args, 0, "dimensionId")?;
    dimension_of(&services, metrics_def_id, &dimension_id)?;

    services.store.delete::<DimensionDefinition>(&dimension_id)?;
    services
        .store
        .update_with::<MetricsDefinition>(metrics_def_id, |d| {
            d.dimension_ids.retain(|id| id != &dimension_id)
        })?;
    Ok(ActionOutput::empty())
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    let target = ContextTarget::Required(EntityType::MetricsDefinition);
    vec![
        ActionRegistration::new("addNewDimension", target, wrap(add_new_dimension)),
        ActionRegistration::new("updateDimension", target, wrap(update_dimension)),
        ActionRegistration::new("deleteDimension", target, wrap(delete_dimension)),
    ]
}
