use crate::actions::{measures, ActionServices};
use crate::dispatch::{
    arg, opt_arg, wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget,
    RequestContext,
};
use crate::state::factory;
use crate::state::{
    DimensionDefinition, EntityType, MeasureDefinition, MetricsDefinition,
};
use log::info;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn create_metrics_definition(
    services: ActionServices,
    _ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let label: Option<String> = opt_arg(&args, 0, "label")?;
    let label = label.filter(|l| !l.trim().is_empty()).unwrap_or_else(|| {
        format!(
            "metrics_{}",
            services.store.count::<MetricsDefinition>() + 1
        )
    });
    let def = services.store.add(factory::new_metrics_definition(&label))?;
    info!("📊 created metrics definition {} ({})", def.metric_def_label, def.id);
    ActionOutput::json(&def)
}

pub async fn update_metrics_definition(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let mut patch: Value = arg(&args, 0, "modifications")?;
    let before = services.metrics_definition(id)?;

    // measure / dimension 列表只能通过对应的 action 维护
    if let Value::Object(map) = &mut patch {
        map.remove("measureIds");
        map.remove("dimensionIds");
    }
    let updated = services.store.update::<MetricsDefinition>(id, patch)?;

    if updated.source_model_id != before.source_model_id {
        measures::revalidate_measures(&services, id).await;
    }
    ActionOutput::json(&services.metrics_definition(id)?)
}

pub async fn delete_metrics_definition(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    services.queue.cancel_owner(id);
    delete_children(&services, id)?;
    let def = services.store.delete::<MetricsDefinition>(id)?;
    Ok(ActionOutput::message(format!(
        "Deleted metrics definition {}",
        def.metric_def_label
    )))
}

fn delete_children(services: &ActionServices, id: &str) -> Result<(), ActionError> {
    for measure in services
        .store
        .get_many_by_field::<MeasureDefinition>("metricsDefId", &json!(id))
    {
        services.store.delete::<MeasureDefinition>(&measure.id)?;
    }
    for dimension in services
        .store
        .get_many_by_field::<DimensionDefinition>("metricsDefId", &json!(id))
    {
        services.store.delete::<DimensionDefinition>(&dimension.id)?;
    }
    services.store.update_with::<MetricsDefinition>(id, |d| {
        d.measure_ids.clear();
        d.dimension_ids.clear();
    })?;
    Ok(())
}

/// 根据 source model 的 profile 生成默认的 measure 与 dimension
pub async fn generate_measures_and_dimensions(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let def = services.metrics_definition(id)?;
    let (_, derived) = services.source_model(&def)?;

    delete_children(&services, id)?;

    let mut count = factory::new_measure_definition(id, "count(*)");
    count.label = "Total records".to_string();
    count.sql_name = "total_records".to_string();
    let count = services.store.add(count)?;

    let mut dimension_ids = Vec::new();
    for column in derived.profile.iter().filter(|c| c.is_text()) {
        let mut dimension = factory::new_dimension_definition(id, &column.name);
        dimension.label = column.name.clone();
        dimension_ids.push(services.store.add(dimension)?.id);
    }

    let time_dimension = def
        .time_dimension
        .clone()
        .filter(|t| derived.has_column(t))
        .or_else(|| {
            derived
                .profile
                .iter()
                .find(|c| c.is_temporal())
                .map(|c| c.name.clone())
        });

    let measure_id = count.id.clone();
    services.store.update_with::<MetricsDefinition>(id, move |d| {
        d.measure_ids = vec![measure_id];
        d.dimension_ids = dimension_ids;
        d.time_dimension = time_dimension;
    })?;

    measures::validate_measure(&services, id, &count.id, None).await?;

    let def = services.metrics_definition(id)?;
    let measures = services
        .store
        .get_many_by_field::<MeasureDefinition>("metricsDefId", &json!(id));
    let dimensions = services
        .store
        .get_many_by_field::<DimensionDefinition>("metricsDefId", &json!(id));
    ActionOutput::json(&json!({
        "metricsDefinition": def,
        "measures": measures,
        "dimensions": dimensions,
    }))
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    let target = ContextTarget::Required(EntityType::MetricsDefinition);
    vec![
        ActionRegistration::new(
            "createMetricsDefinition",
            ContextTarget::None,
            wrap(create_metrics_definition),
        ),
        ActionRegistration::new(
            "updateMetricsDefinition",
            target,
            wrap(update_metrics_definition),
        ),
        ActionRegistration::new(
            "deleteMetricsDefinition",
            target,
            wrap(delete_metrics_definition),
        ),
        ActionRegistration::new(
            "generateMeasuresAndDimensions",
            target,
            wrap(generate_measures_and_dimensions),
        ),
    ]
}
