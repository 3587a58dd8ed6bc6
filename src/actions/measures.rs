use crate::actions::ActionServices;
use crate::dispatch::{
    arg, opt_arg, wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget,
    ErrorKind, RequestContext,
};
use crate::engine::EngineOperation;
use crate::expression::parse_expression;
use crate::queue::{QueueError, QueuePriority};
use crate::state::factory;
use crate::state::{
    EntityType, ExpressionError, MeasureDefinition, MetricsDefinition, ValidationState,
};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureValidation {
    pub expression_is_valid: ValidationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression_validation_error: Option<ExpressionError>,
}

impl MeasureValidation {
    fn ok() -> Self {
        Self {
            expression_is_valid: ValidationState::Ok,
            expression_validation_error: None,
        }
    }

    fn error(err: ExpressionError) -> Self {
        Self {
            expression_is_valid: ValidationState::Error,
            expression_validation_error: Some(err),
        }
    }

    fn pending() -> Self {
        Self {
            expression_is_valid: ValidationState::Pending,
            expression_validation_error: None,
        }
    }
}

fn measure_of(
    services: &ActionServices,
    metrics_def_id: &str,
    measure_id: &str,
) -> Result<MeasureDefinition, ActionError> {
    services
        .store
        .get_by_id::<MeasureDefinition>(measure_id)
        .filter(|m| m.metrics_def_id == metrics_def_id)
        .ok_or_else(|| {
            ActionError::entity(format!(
                "No measure found for id={} in metrics definition {}",
                measure_id, metrics_def_id
            ))
        })
}

/// 校验 measure 表达式：PENDING -> VALIDATING -> OK / ERROR。
///
/// 本地解析失败或缺列时直接进入 ERROR，不会提交引擎校验。
/// 引擎校验按 metrics definition 归属入队，同一定义下后来的校验会取代尚未执行的校验。
pub async fn validate_measure(
    services: &ActionServices,
    metrics_def_id: &str,
    measure_id: &str,
    expression: Option<&str>,
) -> Result<MeasureValidation, ActionError> {
    let def = services.metrics_definition(metrics_def_id)?;
    let measure = measure_of(services, metrics_def_id, measure_id)?;
    let (model, derived) = services.source_model(&def)?;
    let expression = expression.unwrap_or(&measure.expression).to_string();
    // 校验的是另一段文本时不改动存储的状态
    let marked = expression == measure.expression;
    if marked {
        services.store.update_with::<MeasureDefinition>(measure_id, |m| {
            m.expression_is_valid = ValidationState::Validating;
        })?;
    }

    let parsed = parse_expression(&expression);
    let outcome = if !parsed.is_valid {
        MeasureValidation::error(ExpressionError::message(
            parsed.error.unwrap_or_else(|| "invalid expression".to_string()),
        ))
    } else {
        let missing = parsed.missing_columns(derived.profile.iter().map(|c| c.name.as_str()));
        if !missing.is_empty() {
            MeasureValidation::error(ExpressionError {
                message: None,
                missing_columns: Some(missing),
                missing_from: Some(model.table_name.clone()),
            })
        } else {
            let result = services
                .run(
                    metrics_def_id,
                    QueuePriority::ActiveEntity,
                    EngineOperation::ValidateExpression {
                        table_name: model.table_name.clone(),
                        expression: expression.clone(),
                    },
                )
                .await
                .and_then(|out| out.into_validation().map_err(QueueError::from));
            match result {
                Ok(None) => MeasureValidation::ok(),
                Ok(Some(msg)) if msg.trim().is_empty() => MeasureValidation::ok(),
                Ok(Some(msg)) => MeasureValidation::error(ExpressionError::message(msg)),
                Err(QueueError::Superseded { .. })
                | Err(QueueError::Cancelled { .. })
                | Err(QueueError::Closed) => MeasureValidation::pending(),
                Err(e) => {
                    warn!("✗ validate measure {} failed: {}", measure_id, e);
                    MeasureValidation::error(ExpressionError::message(e.to_string()))
                }
            }
        }
    };

    // await 之后重新读取，只有存储的表达式就是被校验的文本时才写回
    match services.store.get_by_id::<MeasureDefinition>(measure_id) {
        Some(current) if current.expression == expression => {
            let state = outcome.clone();
            services.store.update_with::<MeasureDefinition>(measure_id, move |m| {
                m.expression_is_valid = state.expression_is_valid;
                m.expression_validation_error = state.expression_validation_error;
            })?;
        }
        Some(current) => {
            debug!(
                "measure {} expression differs from validated text, result not stored",
                measure_id
            );
            if marked && current.expression_is_valid == ValidationState::Validating {
                services.store.update_with::<MeasureDefinition>(measure_id, |m| {
                    m.expression_is_valid = ValidationState::Pending;
                    m.expression_validation_error = None;
                })?;
            }
        }
        None => debug!("measure {} deleted during validation, result dropped", measure_id),
    }
    Ok(outcome)
}

/// 新增或修改 measure 后的校验；source model 还不存在时保持 PENDING，等视图读取时再校验
async fn validate_or_defer(
    services: &ActionServices,
    metrics_def_id: &str,
    measure_id: &str,
) -> Result<Option<MeasureValidation>, ActionError> {
    match validate_measure(services, metrics_def_id, measure_id, None).await {
        Ok(validation) => Ok(Some(validation)),
        Err(e) if e.kind() == ErrorKind::EntityError => {
            debug!("measure {} left pending: {}", measure_id, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// 依次重新校验某个 metrics definition 下的所有 measure，返回完成校验的数量
pub async fn revalidate_measures(services: &ActionServices, metrics_def_id: &str) -> usize {
    let ids: Vec<String> = services
        .store
        .get_many_by_field::<MeasureDefinition>("metricsDefId", &json!(metrics_def_id))
        .into_iter()
        .map(|m| m.id)
        .collect();
    let mut validated = 0;
    for id in ids {
        match validate_measure(services, metrics_def_id, &id, None).await {
            Ok(_) => validated += 1,
            Err(e) => {
                debug!("skip revalidation of {}: {}", id, e);
                // source model 缺失时后面的 measure 也无法校验，标记回 PENDING
                let reset = services.store.update_with::<MeasureDefinition>(&id, |m| {
                    if m.expression_is_valid == ValidationState::Validating {
                        m.expression_is_valid = ValidationState::Pending;
                    }
                });
                if let Err(e) = reset {
                    debug!("measure {} gone before reset: {}", id, e);
                }
            }
        }
    }
    validated
}

pub async fn add_new_measure(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let expression: Option<String> = opt_arg(&args, 0, "expression")?;
    let expression = expression.unwrap_or_default();

    let measure = services
        .store
        .add(factory::new_measure_definition(metrics_def_id, &expression))?;
    services
        .store
        .update_with::<MetricsDefinition>(metrics_def_id, |d| {
            d.measure_ids.push(measure.id.clone())
        })?;

    let mut data = serde_json::to_value(&measure).map_err(anyhow::Error::from)?;
    if !expression.trim().is_empty() {
        if let Some(validation) = validate_or_defer(&services, metrics_def_id, &measure.id).await? {
            if let (Value::Object(map), Value::Object(extra)) = (
                &mut data,
                serde_json::to_value(&validation).map_err(anyhow::Error::from)?,
            ) {
                map.extend(extra);
            }
        }
    }
    Ok(ActionOutput {
        message: None,
        data: Some(data),
    })
}

pub async fn update_measure(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let measure_id: String = arg(&args, 0, "measureId")?;
    let mut patch: Value = arg(&args, 1, "modifications")?;
    let before = measure_of(&services, metrics_def_id, &measure_id)?;

    // 归属和校验状态不能由客户端改写
    if let Value::Object(map) = &mut patch {
        for key in ["metricsDefId", "expressionIsValid", "expressionValidationError"] {
            map.remove(key);
        }
    }
    let updated = services
        .store
        .update::<MeasureDefinition>(&measure_id, patch)?;

    if updated.expression != before.expression {
        services.store.update_with::<MeasureDefinition>(&measure_id, |m| {
            m.expression_is_valid = ValidationState::Pending;
            m.expression_validation_error = None;
        })?;
        validate_or_defer(&services, metrics_def_id, &measure_id).await?;
    }

    let measure = measure_of(&services, metrics_def_id, &measure_id)?;
    ActionOutput::json(&measure)
}

pub async fn delete_measure(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let measure_id: String = arg(&args, 0, "measureId")?;
    measure_of(&services, metrics_def_id, &measure_id)?;

    services.store.delete::<MeasureDefinition>(&measure_id)?;
    services
        .store
        .update_with::<MetricsDefinition>(metrics_def_id, |d| {
            d.measure_ids.retain(|id| id != &measure_id)
        })?;
    Ok(ActionOutput::empty())
}

pub async fn validate_measure_expression(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let metrics_def_id = ctx.entity_id()?;
    let measure_id: String = arg(&args, 0, "measureId")?;
    let expression: Option<String> = opt_arg(&args, 1, "expression")?;
    let validation =
        validate_measure(&services, metrics_def_id, &measure_id, expression.as_deref()).await?;
    ActionOutput::json(&validation)
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    let target = ContextTarget::Required(EntityType::MetricsDefinition);
    vec![
        ActionRegistration::new("addNewMeasure", target, wrap(add_new_measure)),
        ActionRegistration::new("updateMeasure", target, wrap(update_measure)),
        ActionRegistration::new("deleteMeasure", target, wrap(delete_measure)),
        ActionRegistration::new(
            "validateMeasureExpression",
            target,
            wrap(validate_measure_expression),
        ),
    ]
}
