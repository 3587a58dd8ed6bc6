use crate::state::ProfileColumn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub type Row = Map<String, Value>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(String),
    #[error("unexpected engine output for {0}")]
    UnexpectedOutput(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<sea_orm::DbErr> for QueryError {
    fn from(e: sea_orm::DbErr) -> Self {
        QueryError::Database(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupGrain {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl RollupGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupGrain::Minute => "minute",
            RollupGrain::Hour => "hour",
            RollupGrain::Day => "day",
            RollupGrain::Week => "week",
            RollupGrain::Month => "month",
            RollupGrain::Year => "year",
        }
    }

    /// 根据时间跨度（天）挑选合适的聚合粒度
    pub fn for_span_days(span_days: f64) -> Self {
        if span_days <= 2.0 {
            RollupGrain::Hour
        } else if span_days <= 90.0 {
            RollupGrain::Day
        } else if span_days <= 3.0 * 365.0 {
            RollupGrain::Week
        } else {
            RollupGrain::Month
        }
    }
}

impl fmt::Display for RollupGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollupGrain {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(RollupGrain::Minute),
            "hour" => Ok(RollupGrain::Hour),
            "day" => Ok(RollupGrain::Day),
            "week" => Ok(RollupGrain::Week),
            "month" => Ok(RollupGrain::Month),
            "year" => Ok(RollupGrain::Year),
            other => Err(QueryError::InvalidRequest(format!(
                "unknown granularity: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupInterval {
    pub rollup_interval: RollupGrain,
    pub min_value: Option<String>,
    pub max_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionValues {
    pub name: String,
    #[serde(default, rename = "in")]
    pub in_values: Vec<Value>,
    #[serde(default)]
    pub like: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsFilter {
    #[serde(default)]
    pub include: Vec<DimensionValues>,
    #[serde(default)]
    pub exclude: Vec<DimensionValues>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortEntry {
    pub name: String,
    pub direction: SortDirection,
}

/// 已通过校验、可以直接拼进 SQL 的 measure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicMeasure {
    pub id: String,
    pub expression: String,
    pub sql_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesRequest {
    pub table_name: String,
    pub timestamp_column: String,
    pub measures: Vec<BasicMeasure>,
    pub filter: Option<MetricsFilter>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub grain: RollupGrain,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsRequest {
    pub table_name: String,
    pub measures: Vec<BasicMeasure>,
    pub filter: Option<MetricsFilter>,
    pub timestamp_column: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRequest {
    pub table_name: String,
    pub dimension_column: String,
    pub measures: Vec<BasicMeasure>,
    pub filter: Option<MetricsFilter>,
    pub timestamp_column: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub sort: Vec<SortEntry>,
    pub limit: u64,
    pub offset: u64,
}

/// 发给分析引擎的一次具名操作
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOperation {
    RunQuery { sql: String, args: Vec<Value> },
    Execute { sql: String },
    MaterializeModel { table_name: String, query: String },
    ProfileColumns { table_name: String },
    ValidateExpression { table_name: String, expression: String },
    EstimateRollupInterval { table_name: String, column: String },
    ComputeRollup(TimeSeriesRequest),
    BigNumber(TotalsRequest),
    Leaderboard(LeaderboardRequest),
}

impl EngineOperation {
    /// 操作名，同时也是队列里 supersede 的 key 的一部分
    pub fn name(&self) -> &'static str {
        match self {
            EngineOperation::RunQuery { .. } => "runQuery",
            EngineOperation::Execute { .. } => "execute",
            EngineOperation::MaterializeModel { .. } => "materializeModel",
            EngineOperation::ProfileColumns { .. } => "profileColumns",
            EngineOperation::ValidateExpression { .. } => "validateMeasureExpression",
            EngineOperation::EstimateRollupInterval { .. } => "estimateIdealRollupInterval",
            EngineOperation::ComputeRollup(_) => "generateTimeSeries",
            EngineOperation::BigNumber(_) => "getBigNumber",
            EngineOperation::Leaderboard(_) => "getLeaderboardValues",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Rows(Vec<Row>),
    Row(Row),
    Profile(Vec<ProfileColumn>),
    Validation(Option<String>),
    Interval(RollupInterval),
    Done,
}

impl EngineOutput {
    pub fn into_rows(self) -> Result<Vec<Row>, QueryError> {
        match self {
            EngineOutput::Rows(rows) => Ok(rows),
            _ => Err(QueryError::UnexpectedOutput("rows")),
        }
    }

    pub fn into_row(self) -> Result<Row, QueryError> {
        match self {
            EngineOutput::Row(row) => Ok(row),
            _ => Err(QueryError::UnexpectedOutput("row")),
        }
    }

    pub fn into_profile(self) -> Result<Vec<ProfileColumn>, QueryError> {
        match self {
            EngineOutput::Profile(cols) => Ok(cols),
            _ => Err(QueryError::UnexpectedOutput("profile")),
        }
    }

    pub fn into_validation(self) -> Result<Option<String>, QueryError> {
        match self {
            EngineOutput::Validation(msg) => Ok(msg),
            _ => Err(QueryError::UnexpectedOutput("validation")),
        }
    }

    pub fn into_interval(self) -> Result<RollupInterval, QueryError> {
        match self {
            EngineOutput::Interval(interval) => Ok(interval),
            _ => Err(QueryError::UnexpectedOutput("interval")),
        }
    }
}

/// 单连接分析引擎。只允许通过 Action Queue 的 worker 调用，一次一条语句。
#[async_trait]
pub trait AnalyticsEngine: Send + Sync {
    async fn execute(&self, op: &EngineOperation) -> Result<EngineOutput, QueryError>;
}
