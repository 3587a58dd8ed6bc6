use crate::engine::connection::establish_connection;
use crate::engine::sql::{self, SqlQuery};
use crate::engine::types::{
    AnalyticsEngine, EngineOperation, EngineOutput, QueryError, RollupGrain, RollupInterval, Row,
};
use crate::state::ProfileColumn;
use async_trait::async_trait;
use log::debug;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, JsonValue,
    QueryResult, Statement,
};
use serde_json::Value;

/// 基于 SeaORM/SQLite 的分析引擎实现
pub struct SqliteEngine {
    db: DatabaseConnection,
}

impl SqliteEngine {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn connect(db_url: &str) -> Result<Self, DbErr> {
        Ok(Self::new(establish_connection(db_url).await?))
    }

    fn statement(sql: &str, args: &[Value]) -> Statement {
        Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            sql,
            args.iter().map(to_db_value).collect::<Vec<_>>(),
        )
    }

    async fn run_query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, QueryError> {
        let rows = JsonValue::find_by_statement(Self::statement(sql, args))
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn run_shaped(&self, query: &SqlQuery) -> Result<Vec<Row>, QueryError> {
        debug!("engine sql: {} {:?}", query.sql, query.args);
        let rows = self
            .db
            .query_all(Self::statement(&query.sql, &query.args))
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                query
                    .columns
                    .iter()
                    .map(|col| (col.clone(), read_value(row, col)))
                    .collect()
            })
            .collect())
    }

    async fn profile(&self, table_name: &str) -> Result<Vec<ProfileColumn>, QueryError> {
        let rows = self
            .db
            .query_all(Self::statement(
                sql::profile_columns_sql(),
                &[Value::String(table_name.to_string())],
            ))
            .await?;
        if rows.is_empty() {
            return Err(QueryError::Database(format!("no such table: {}", table_name)));
        }
        rows.iter()
            .map(|row| {
                let name: String = row.try_get("", "name")?;
                let column_type: Option<String> = row.try_get("", "type")?;
                Ok(ProfileColumn::new(name, column_type.unwrap_or_default()))
            })
            .collect::<Result<Vec<_>, DbErr>>()
            .map_err(QueryError::from)
    }

    async fn estimate_interval(
        &self,
        table_name: &str,
        column: &str,
    ) -> Result<RollupInterval, QueryError> {
        let row = self
            .db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                sql::rollup_interval_sql(table_name, column),
            ))
            .await?;
        let Some(row) = row else {
            return Ok(RollupInterval {
                rollup_interval: RollupGrain::Day,
                min_value: None,
                max_value: None,
            });
        };
        let min_value: Option<String> = row.try_get("", "min_value")?;
        let max_value: Option<String> = row.try_get("", "max_value")?;
        let span_days: Option<f64> = row.try_get("", "span_days").unwrap_or(None);
        Ok(RollupInterval {
            rollup_interval: span_days
                .map(RollupGrain::for_span_days)
                .unwrap_or(RollupGrain::Day),
            min_value,
            max_value,
        })
    }
}

#[async_trait]
impl AnalyticsEngine for SqliteEngine {
    async fn execute(&self, op: &EngineOperation) -> Result<EngineOutput, QueryError> {
        match op {
            EngineOperation::RunQuery { sql, args } => {
                Ok(EngineOutput::Rows(self.run_query(sql, args).await?))
            }
            EngineOperation::Execute { sql } => {
                self.db.execute_unprepared(sql).await?;
                Ok(EngineOutput::Done)
            }
            EngineOperation::MaterializeModel { table_name, query } => {
                let (drop_sql, create_sql) = sql::materialize_model_sql(table_name, query);
                self.db.execute_unprepared(&drop_sql).await?;
                self.db.execute_unprepared(&create_sql).await?;
                Ok(EngineOutput::Done)
            }
            EngineOperation::ProfileColumns { table_name } => {
                Ok(EngineOutput::Profile(self.profile(table_name).await?))
            }
            EngineOperation::ValidateExpression {
                table_name,
                expression,
            } => {
                let stmt = Statement::from_string(
                    DatabaseBackend::Sqlite,
                    sql::validate_expression_sql(table_name, expression),
                );
                // 引擎拒绝的表达式属于正常结果，返回错误文本
                match self.db.query_all(stmt).await {
                    Ok(_) => Ok(EngineOutput::Validation(None)),
                    Err(e) => Ok(EngineOutput::Validation(Some(e.to_string()))),
                }
            }
            EngineOperation::EstimateRollupInterval { table_name, column } => Ok(
                EngineOutput::Interval(self.estimate_interval(table_name, column).await?),
            ),
            EngineOperation::ComputeRollup(req) => {
                let query = sql::time_series_sql(req)?;
                Ok(EngineOutput::Rows(self.run_shaped(&query).await?))
            }
            EngineOperation::BigNumber(req) => {
                let query = sql::totals_sql(req)?;
                let row = self.run_shaped(&query).await?.into_iter().next().ok_or_else(|| {
                    QueryError::Database("no rows received from totals query".to_string())
                })?;
                Ok(EngineOutput::Row(row))
            }
            EngineOperation::Leaderboard(req) => {
                let query = sql::leaderboard_sql(req)?;
                Ok(EngineOutput::Rows(self.run_shaped(&query).await?))
            }
        }
    }
}

fn to_db_value(v: &Value) -> sea_orm::Value {
    match v {
        Value::Null => sea_orm::Value::String(None),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) => s.clone().into(),
        other => other.to_string().into(),
    }
}

/// SQLite 是动态类型，按 整数 -> 浮点 -> 文本 -> 布尔 的顺序尝试解码
fn read_value(row: &QueryResult, col: &str) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>>("", col) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>>("", col) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>>("", col) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>>("", col) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    Value::Null
}
