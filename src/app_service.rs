use crate::app_state::AppEvent;
use crate::commands::ListTarget;
use crate::queue::DatabaseActionQueue;
use crate::state::{
    DerivedModel, DerivedTable, DimensionDefinition, EntityStore, MeasureDefinition,
    MetricsDefinition, PersistentModel, PersistentTable, ValidationState,
};
use tokio::sync::mpsc;

pub fn refresh_stats(queue: &DatabaseActionQueue, tx: &mpsc::UnboundedSender<AppEvent>) {
    let _ = tx.send(AppEvent::Stats(queue.stats()));
}

fn validation_mark(state: ValidationState) -> &'static str {
    match state {
        ValidationState::Pending => "…",
        ValidationState::Validating => "⟳",
        ValidationState::Ok => "✓",
        ValidationState::Error => "✗",
    }
}

/// 把 store 中某一类实体渲染成一行一条的摘要
pub fn list_entities(store: &EntityStore, target: ListTarget) -> Vec<String> {
    match target {
        ListTarget::Tables => store
            .list::<PersistentTable>()
            .into_iter()
            .map(|t| {
                let derived = store.get_by_id::<DerivedTable>(&t.id);
                let columns = derived.as_ref().map(|d| d.profile.len()).unwrap_or(0);
                let rows = derived
                    .and_then(|d| d.cardinality)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("{}  {} ({} 列, {} 行)", t.id, t.table_name, columns, rows)
            })
            .collect(),
        ListTarget::Models => store
            .list::<PersistentModel>()
            .into_iter()
            .map(|m| {
                let derived = store.get_by_id::<DerivedModel>(&m.id);
                let status = match derived.as_ref().and_then(|d| d.error.as_deref()) {
                    Some(err) => format!("错误: {}", err),
                    None => format!(
                        "{} 列",
                        derived.as_ref().map(|d| d.profile.len()).unwrap_or(0)
                    ),
                };
                format!("{}  {} [{}]  {}", m.id, m.name, status, m.query)
            })
            .collect(),
        ListTarget::Metrics => store
            .list::<MetricsDefinition>()
            .into_iter()
            .map(|d| {
                format!(
                    "{}  {} (model={}, time={}, {} measures, {} dimensions)",
                    d.id,
                    d.metric_def_label,
                    d.source_model_id.as_deref().unwrap_or("-"),
                    d.time_dimension.as_deref().unwrap_or("-"),
                    d.measure_ids.len(),
                    d.dimension_ids.len()
                )
            })
            .collect(),
        ListTarget::Measures => store
            .list::<MeasureDefinition>()
            .into_iter()
            .map(|m| {
                format!(
                    "{} {}  [{}] {} = {}",
                    validation_mark(m.expression_is_valid),
                    m.id,
                    m.metrics_def_id,
                    m.sql_name,
                    m.expression
                )
            })
            .collect(),
        ListTarget::Dimensions => store
            .list::<DimensionDefinition>()
            .into_iter()
            .map(|d| format!("{}  [{}] {}", d.id, d.metrics_def_id, d.dimension_column))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::factory;

    #[test]
    fn test_list_entities() {
        let store = EntityStore::new();
        assert!(list_entities(&store, ListTarget::Models).is_empty());

        let model = store.add(factory::new_model("orders", "select 1")).unwrap();
        store
            .add(factory::new_derived_model(&model))
            .unwrap();
        let def = store
            .add(factory::new_metrics_definition("revenue"))
            .unwrap();
        store
            .add(factory::new_measure_definition(&def.id, "sum(amount)"))
            .unwrap();

        let models = list_entities(&store, ListTarget::Models);
        assert_eq!(models.len(), 1);
        assert!(models[0].contains("orders"));

        let measures = list_entities(&store, ListTarget::Measures);
        assert!(measures[0].starts_with('…'));
        assert!(measures[0].contains("sum(amount)"));

        assert!(list_entities(&store, ListTarget::Metrics)[0].contains("revenue"));
    }
}
