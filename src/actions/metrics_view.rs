use crate::actions::dimensions::dimension_of;
use crate::actions::{measures, messages, ordered_by_ids, ActionServices};
use crate::dispatch::{
    arg, wrap, ActionError, ActionOutput, ActionRegistration, ContextTarget, RequestContext,
};
use crate::engine::{
    BasicMeasure, EngineOperation, LeaderboardRequest, MetricsFilter, RollupGrain, Row,
    SortEntry, TimeSeriesRequest, TotalsRequest,
};
use crate::queue::QueuePriority;
use crate::state::{
    factory, DerivedModel, DimensionDefinition, EntityStatus, EntityType, MeasureDefinition,
    MetricsDefinition, PersistentModel, ValidationState,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsViewRequestTimeRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub granularity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsViewTimeSeriesRequest {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub time: MetricsViewRequestTimeRange,
    #[serde(default)]
    pub filter: Option<MetricsFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsViewTopListRequest {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub time: MetricsViewRequestTimeRange,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub sort: Vec<SortEntry>,
    #[serde(default)]
    pub filter: Option<MetricsFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsViewTotalsRequest {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub time: MetricsViewRequestTimeRange,
    #[serde(default)]
    pub filter: Option<MetricsFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

impl ColumnMeta {
    fn new(name: &str, column_type: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: column_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub interval: RollupGrain,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimensionMeta {
    pub name: String,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsViewMeta {
    pub id: String,
    pub name: String,
    pub time_dimension: TimeDimensionMeta,
    pub measures: Vec<MeasureDefinition>,
    pub dimensions: Vec<DimensionDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsViewResponse<T> {
    pub meta: Vec<ColumnMeta>,
    pub data: T,
}

/// 校验 metrics definition 能否用于视图：source model 存在且无错误、时间维度在 profile 中
fn checked_definition(
    services: &ActionServices,
    id: &str,
) -> Result<(MetricsDefinition, PersistentModel, DerivedModel, String), ActionError> {
    let def = services.metrics_definition(id)?;
    let (model, derived) = services.source_model(&def)?;
    if derived.error.is_some() || derived.status == EntityStatus::Error {
        return Err(ActionError::entity(messages::EXPLORER_SOURCE_MODEL_IS_INVALID));
    }
    let time_dimension = def
        .time_dimension
        .clone()
        .filter(|t| !t.is_empty() && derived.has_column(t))
        .ok_or_else(|| ActionError::entity(messages::EXPLORER_TIME_DIMENSION_DOESNT_EXIST))?;
    Ok((def, model, derived, time_dimension))
}

/// 只返回校验通过的 measure；仍是 PENDING 的先依次校验。
/// 没有 sqlName 的 measure 用 measure_<i> 命名
async fn valid_measures(
    services: &ActionServices,
    metrics_def_id: &str,
) -> Result<Vec<MeasureDefinition>, ActionError> {
    let pending: Vec<String> = services
        .store
        .get_many_by_field::<MeasureDefinition>("metricsDefId", &json!(metrics_def_id))
        .into_iter()
        .filter(|m| m.expression_is_valid == ValidationState::Pending)
        .map(|m| m.id)
        .collect();
    for measure_id in pending {
        measures::validate_measure(services, metrics_def_id, &measure_id, None).await?;
    }

    let def = services.metrics_definition(metrics_def_id)?;
    let all = services
        .store
        .get_many_by_field::<MeasureDefinition>("metricsDefId", &json!(metrics_def_id));
    Ok(ordered_by_ids(&def.measure_ids, all)
        .into_iter()
        .filter(|m| m.expression_is_valid == ValidationState::Ok)
        .enumerate()
        .map(|(index, mut m)| {
            m.sql_name = factory::fallback_measure_name(index, &m.sql_name);
            m
        })
        .collect())
}

/// 按 id 或 sqlName 选出请求的 measure；请求为空时返回全部有效 measure
async fn basic_measures(
    services: &ActionServices,
    metrics_def_id: &str,
    requested: &[String],
) -> Result<Vec<BasicMeasure>, ActionError> {
    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let selected: Vec<BasicMeasure> = valid_measures(services, metrics_def_id)
        .await?
        .into_iter()
        .filter(|m| {
            wanted.is_empty()
                || wanted.contains(m.id.as_str())
                || wanted.contains(m.sql_name.as_str())
        })
        .map(|m| BasicMeasure {
            id: m.id,
            expression: m.expression,
            sql_name: m.sql_name,
        })
        .collect();
    if selected.is_empty() {
        return Err(ActionError::validation(messages::NO_VALID_MEASURES));
    }
    Ok(selected)
}

fn valid_dimensions(
    services: &ActionServices,
    def: &MetricsDefinition,
    derived: &DerivedModel,
) -> Vec<DimensionDefinition> {
    let all = services
        .store
        .get_many_by_field::<DimensionDefinition>("metricsDefId", &json!(def.id));
    ordered_by_ids(&def.dimension_ids, all)
        .into_iter()
        .filter(|d| derived.has_column(&d.dimension_column))
        .collect()
}

async fn estimate_time_range(
    services: &ActionServices,
    metrics_def_id: &str,
    table_name: &str,
    column: &str,
) -> Result<TimeRange, ActionError> {
    let interval = services
        .run(
            metrics_def_id,
            QueuePriority::ActiveEntity,
            EngineOperation::EstimateRollupInterval {
                table_name: table_name.to_string(),
                column: column.to_string(),
            },
        )
        .await?
        .into_interval()?;
    Ok(TimeRange {
        interval: interval.rollup_interval,
        start: interval.min_value,
        end: interval.max_value,
    })
}

fn measure_meta(measures: &[BasicMeasure]) -> impl Iterator<Item = ColumnMeta> + '_ {
    measures.iter().map(|m| ColumnMeta::new(&m.sql_name, "DOUBLE"))
}

pub async fn get_metrics_view_meta(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    _args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let (def, model, _, time_dimension) = checked_definition(&services, id)?;

    let time_range =
        estimate_time_range(&services, id, &model.table_name, &time_dimension).await?;
    let measures = valid_measures(&services, id).await?;

    // await 之后重新读取
    let (def_now, _, derived, time_dimension) = checked_definition(&services, id)?;
    let meta = MetricsViewMeta {
        id: def.id,
        name: def_now.metric_def_label.clone(),
        time_dimension: TimeDimensionMeta {
            name: time_dimension,
            time_range,
        },
        measures,
        dimensions: valid_dimensions(&services, &def_now, &derived),
    };
    ActionOutput::json(&meta)
}

pub async fn get_metrics_view_time_series(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let request: MetricsViewTimeSeriesRequest = arg(&args, 0, "request")?;
    let (_, model, _, time_dimension) = checked_definition(&services, id)?;
    let measures = basic_measures(&services, id, &request.measures).await?;

    let grain = match request.time.granularity.as_deref().filter(|g| !g.is_empty()) {
        Some(g) => g.parse::<RollupGrain>()?,
        None => {
            estimate_time_range(&services, id, &model.table_name, &time_dimension)
                .await?
                .interval
        }
    };

    let rows = services
        .run(
            id,
            QueuePriority::ActiveEntity,
            EngineOperation::ComputeRollup(TimeSeriesRequest {
                table_name: model.table_name,
                timestamp_column: time_dimension,
                measures: measures.clone(),
                filter: request.filter,
                start: request.time.start,
                end: request.time.end,
                grain,
                limit: services.config.timeseries_limit,
            }),
        )
        .await?
        .into_rows()?;

    let meta = std::iter::once(ColumnMeta::new("ts", "TIMESTAMP"))
        .chain(measure_meta(&measures))
        .collect();
    ActionOutput::json(&MetricsViewResponse { meta, data: rows })
}

pub async fn get_metrics_view_top_list(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let dimension_id: String = arg(&args, 0, "dimensionId")?;
    let request: MetricsViewTopListRequest = arg(&args, 1, "request")?;
    let (_, model, derived, time_dimension) = checked_definition(&services, id)?;
    let dimension = dimension_of(&services, id, &dimension_id)?;
    if !derived.has_column(&dimension.dimension_column) {
        return Err(ActionError::entity(format!(
            "Dimension column {} does not exist in {}",
            dimension.dimension_column, model.table_name
        )));
    }
    let measures = basic_measures(&services, id, &request.measures).await?;

    // 每个维度各自一个 leaderboard，用维度 id 归属避免相互取代
    let rows: Vec<Row> = services
        .run(
            &dimension.id,
            QueuePriority::ActiveEntity,
            EngineOperation::Leaderboard(LeaderboardRequest {
                table_name: model.table_name,
                dimension_column: dimension.dimension_column.clone(),
                measures: measures.clone(),
                filter: request.filter,
                timestamp_column: Some(time_dimension),
                start: request.time.start,
                end: request.time.end,
                sort: request.sort,
                limit: request.limit.unwrap_or(services.config.toplist_limit),
                offset: request.offset.unwrap_or(0),
            }),
        )
        .await?
        .into_rows()?;

    let meta = std::iter::once(ColumnMeta::new(&dimension.dimension_column, "VARCHAR"))
        .chain(measure_meta(&measures))
        .collect();
    ActionOutput::json(&MetricsViewResponse { meta, data: rows })
}

pub async fn get_metrics_view_totals(
    services: ActionServices,
    ctx: Arc<RequestContext>,
    args: Vec<Value>,
) -> Result<ActionOutput, ActionError> {
    let id = ctx.entity_id()?;
    let request: MetricsViewTotalsRequest = arg(&args, 0, "request")?;
    let (_, model, _, time_dimension) = checked_definition(&services, id)?;
    let measures = basic_measures(&services, id, &request.measures).await?;

    let row = services
        .run(
            id,
            QueuePriority::ActiveEntity,
            EngineOperation::BigNumber(TotalsRequest {
                table_name: model.table_name,
                measures: measures.clone(),
                filter: request.filter,
                timestamp_column: Some(time_dimension),
                start: request.time.start,
                end: request.time.end,
            }),
        )
        .await?
        .into_row()?;

    let meta = measure_meta(&measures).collect();
    ActionOutput::json(&MetricsViewResponse { meta, data: row })
}

pub fn registrations() -> Vec<ActionRegistration<ActionServices>> {
    let target = ContextTarget::Required(EntityType::MetricsDefinition);
    vec![
        ActionRegistration::new("getMetricsViewMeta", target, wrap(get_metrics_view_meta)),
        ActionRegistration::new(
            "getMetricsViewTimeSeries",
            target,
            wrap(get_metrics_view_time_series),
        ),
        ActionRegistration::new(
            "getMetricsViewTopList",
            target,
            wrap(get_metrics_view_top_list),
        ),
        ActionRegistration::new(
            "getMetricsViewTotals",
            target,
            wrap(get_metrics_view_totals),
        ),
    ]
}
