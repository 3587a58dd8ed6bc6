use crate::actions::{measures, ActionServices};
use crate::dispatch::{
    arg, opt_arg, wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget,
    RequestContext,
};
use crate::engine::{EngineOperation, QueryError};
use crate::queue::QueueError;
use crate::state::factory;
use crate::state::{
    DerivedModel, DerivedTable, EntityStatus, EntityType, MetricsDefinition, PersistentModel,
    PersistentTable, ProfileColumn,
};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

/// 规范化查询文本：压缩空白并去掉结尾分号
pub fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_string()
}

fn engine_message(e: &QueueError) -> String {
    match e {
        QueueError::Query(QueryError::Database(msg)) => msg.clone(),
        other => other.to_string(),
    }
}

/// 读取表结构与行数，写回 DerivedTable
async fn profile_table(
    services: &ActionServices,
    table_id: &str,
) -> Result<DerivedTable, ActionError> {
    let table = services
        .store
        .get_by_id::<PersistentTable>(table_id)
        .ok_or_else(|| ActionError::entity(format!("No Table found for id={}", table_id)))?;
    services
        .store
        .update_with::<DerivedTable>(table_id, |d| {
            d.status = EntityStatus::Running;
            d.error = None;
        })?;

    let priority = services.priority_for(table_id);
    let profiled = async {
        let profile = services
            .run(
                table_id,
                priority,
                EngineOperation::ProfileColumns {
                    table_name: table.table_name.clone(),
                },
            )
            .await?
            .into_profile()?;
        let rows = services
            .run(
                table_id,
                priority,
                EngineOperation::RunQuery {
                    sql: format!(
                        "SELECT COUNT(*) AS cardinality FROM {}",
                        crate::engine::sql::quote_ident(&table.table_name)
                    ),
                    args: vec![],
                },
            )
            .await?
            .into_rows()?;
        let cardinality = rows
            .first()
            .and_then(|r| r.get("cardinality"))
            .and_then(Value::as_i64);
        Ok::<(Vec<ProfileColumn>, Option<i64>), QueueError>((profile, cardinality))
    }
    .await;

    if !services.store.contains::<DerivedTable>(table_id) {
        return Err(ActionError::entity(format!("No Table found for id={}", table_id)));
    }
    match profiled {
        Ok((profile, cardinality)) => {
            info!("✓ profiled table {} ({} columns)", table.table_name, profile.len());
            Ok(services.store.update_with::<DerivedTable>(table_id, |d| {
                d.profile = profile;
                d.cardinality = cardinality;
                d.status = EntityStatus::Idle;
                d.error = None;
            })?)
        }
        Err(e) => {
            warn!("✗ profile table {} failed: {}", table.table_name, e);
            let message = engine_message(&e);
            services.store.update_with::<DerivedTable>(table_id, |d| {
                d.status = EntityStatus::Error;
                d.error = Some(message);
            })?;
            Err(e.into())
        }
    }
}

pub async fn add_table(
    services: ActionServices,
    _ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let table_name: String = arg(&args, 0, "tableName")?;
    let path: Option<String> = opt_arg(&args, 1, "path")?;
    let table = factory::new_table(&table_name, path.as_deref().unwrap_or_default());

    let existing = services
        .store
        .get_many_by_field::<PersistentTable>("tableName", &json!(table.table_name));
    if !existing.is_empty() {
        return Err(ActionError::DuplicateEntity(format!(
            "Table {} already exists",
            table.table_name
        )));
    }

    let table = services.store.add(table)?;
    services.store.add(factory::new_derived_table(&table))?;
    let derived = profile_table(&services, &table.id).await?;
    ActionOutput::json(&json!({ "table": table, "derived": derived }))
}

pub async fn refresh_table_profile(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let derived = profile_table(&services, ctx.entity_id()?).await?;
    ActionOutput::json(&derived)
}

pub async fn delete_table(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    services.queue.cancel_owner(id);
    let table = services.store.delete::<PersistentTable>(id)?;
    Ok(ActionOutput::message(format!("Deleted table {}", table.table_name)))
}

pub async fn add_model(
    services: ActionServices,
    _ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let name: Option<String> = opt_arg(&args, 0, "name")?;
    let query: Option<String> = opt_arg(&args, 1, "query")?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("model_{}", services.store.count::<PersistentModel>() + 1));

    let model = services.store.add(factory::new_model(&name, ""))?;
    services.store.add(factory::new_derived_model(&model))?;

    if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
        apply_model_query(&services, &model.id, &query).await?;
    }
    let model = services
        .store
        .get_by_id::<PersistentModel>(&model.id)
        .ok_or_else(|| ActionError::entity(format!("No Model found for id={}", model.id)))?;
    ActionOutput::json(&model)
}

/// 更新模型查询：物化为视图、重新 profile，然后重新校验依赖它的 measure
async fn apply_model_query(
    services: &ActionServices,
    model_id: &str,
    query: &str,
) -> Result<Option<DerivedModel>, ActionError> {
    let model = services
        .store
        .update_with::<PersistentModel>(model_id, |m| m.query = query.to_string())?;
    let sanitized = sanitize_query(query);

    if sanitized.is_empty() {
        let derived = services.store.update_with::<DerivedModel>(model_id, |d| {
            d.sanitized_query = String::new();
            d.profile.clear();
            d.status = EntityStatus::Idle;
            d.error = None;
        })?;
        return Ok(Some(derived));
    }

    services.store.update_with::<DerivedModel>(model_id, |d| {
        d.sanitized_query = sanitized.clone();
        d.status = EntityStatus::Running;
        d.error = None;
    })?;

    let priority = services.priority_for(model_id);
    let result = async {
        services
            .run(
                model_id,
                priority,
                EngineOperation::MaterializeModel {
                    table_name: model.table_name.clone(),
                    query: sanitized.clone(),
                },
            )
            .await?;
        services
            .run(
                model_id,
                priority,
                EngineOperation::ProfileColumns {
                    table_name: model.table_name.clone(),
                },
            )
            .await?
            .into_profile()
            .map_err(QueueError::from)
    }
    .await;

    // await 之后重新读取：模型被删或查询已被改写时丢弃结果
    let current = services.store.get_by_id::<PersistentModel>(model_id);
    if current.as_ref().map(|m| m.query.as_str()) != Some(query) {
        debug!("discarding stale profile for model {}", model_id);
        return Ok(None);
    }

    let derived = match result {
        Ok(profile) => services.store.update_with::<DerivedModel>(model_id, |d| {
            d.profile = profile;
            d.status = EntityStatus::Idle;
            d.error = None;
        })?,
        Err(e) if matches!(e, QueueError::Superseded { .. }) => return Err(e.into()),
        Err(e) => {
            warn!("✗ model {} query failed: {}", model.table_name, e);
            let message = engine_message(&e);
            services.store.update_with::<DerivedModel>(model_id, |d| {
                d.profile.clear();
                d.status = EntityStatus::Error;
                d.error = Some(message);
            })?;
            return Err(e.into());
        }
    };

    let dependents = services
        .store
        .get_many_by_field::<MetricsDefinition>("sourceModelId", &json!(model_id));
    for def in dependents {
        measures::revalidate_measures(services, &def.id).await;
    }
    Ok(Some(derived))
}

pub async fn update_model_query(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let query: String = arg(&args, 0, "query")?;
    match apply_model_query(&services, ctx.entity_id()?, &query).await? {
        Some(derived) => ActionOutput::json(&derived),
        None => Ok(ActionOutput::message("Model query changed, result discarded")),
    }
}

pub async fn delete_model(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    services.queue.cancel_owner(id);
    let model = services.store.delete::<PersistentModel>(id)?;
    Ok(ActionOutput::message(format!("Deleted model {}", model.name)))
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    let table = ContextTarget::Required(EntityType::Table);
    let model = ContextTarget::Required(EntityType::Model);
    vec![
        ActionRegistration::new("addTable", ContextTarget::None, wrap(add_table)),
        ActionRegistration::new("refreshTableProfile", table, wrap(refresh_table_profile)),
        ActionRegistration::new("deleteTable", table, wrap(delete_table)),
        ActionRegistration::new("addModel", ContextTarget::None, wrap(add_model)),
        ActionRegistration::new("updateModelQuery", model, wrap(update_model_query)),
        ActionRegistration::new("deleteModel", model, wrap(delete_model)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_query() {
        assert_eq!(
            sanitize_query("select *\n  from   orders;\n"),
            "select * from orders"
        );
        assert_eq!(sanitize_query("  ; "), "");
    }
}
