use crate::engine::types::{
    BasicMeasure, DimensionValues, LeaderboardRequest, MetricsFilter, QueryError, RollupGrain,
    SortDirection, TimeSeriesRequest, TotalsRequest,
};
use serde_json::Value;

/// 拼好的 SQL、绑定参数，以及结果集中需要读取的列名
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub args: Vec<Value>,
    pub columns: Vec<String>,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn validate_expression_sql(table_name: &str, expression: &str) -> String {
    format!("SELECT {} FROM {} LIMIT 0", expression, quote_ident(table_name))
}

pub fn profile_columns_sql() -> &'static str {
    "SELECT name, type FROM pragma_table_info(?)"
}

pub fn materialize_model_sql(table_name: &str, query: &str) -> (String, String) {
    let table = quote_ident(table_name);
    let query = query.trim().trim_end_matches(';');
    (
        format!("DROP VIEW IF EXISTS {}", table),
        format!("CREATE VIEW {} AS {}", table, query),
    )
}

pub fn rollup_interval_sql(table_name: &str, column: &str) -> String {
    let col = quote_ident(column);
    format!(
        "SELECT CAST(MIN({c}) AS TEXT) AS min_value, CAST(MAX({c}) AS TEXT) AS max_value, \
         (julianday(MAX({c})) - julianday(MIN({c}))) AS span_days FROM {t}",
        c = col,
        t = quote_ident(table_name)
    )
}

/// SQLite 没有 DATE_TRUNC，用 strftime/date 把时间截断到桶
pub fn time_bucket_expr(grain: RollupGrain, column: &str) -> String {
    let col = quote_ident(column);
    match grain {
        RollupGrain::Minute => format!("strftime('%Y-%m-%d %H:%M:00', {})", col),
        RollupGrain::Hour => format!("strftime('%Y-%m-%d %H:00:00', {})", col),
        RollupGrain::Day => format!("strftime('%Y-%m-%d', {})", col),
        RollupGrain::Week => format!("date({}, 'weekday 0', '-6 days')", col),
        RollupGrain::Month => format!("strftime('%Y-%m-01', {})", col),
        RollupGrain::Year => format!("strftime('%Y-01-01', {})", col),
    }
}

fn measure_selects(measures: &[BasicMeasure]) -> Vec<String> {
    measures
        .iter()
        .map(|m| format!("{} AS {}", m.expression, quote_ident(&m.sql_name)))
        .collect()
}

fn time_range_clause(
    timestamp_column: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    args: &mut Vec<Value>,
) -> String {
    let Some(col) = timestamp_column.filter(|c| !c.is_empty()) else {
        return String::new();
    };
    let mut clause = String::new();
    if let Some(start) = start.filter(|s| !s.is_empty()) {
        clause.push_str(&format!(" AND {} >= ?", quote_ident(col)));
        args.push(Value::String(start.to_string()));
    }
    if let Some(end) = end.filter(|s| !s.is_empty()) {
        clause.push_str(&format!(" AND {} < ?", quote_ident(col)));
        args.push(Value::String(end.to_string()));
    }
    clause
}

fn filter_value(val: &Value) -> Result<Value, QueryError> {
    match val {
        Value::String(_) | Value::Bool(_) | Value::Number(_) | Value::Null => Ok(val.clone()),
        other => Err(QueryError::InvalidRequest(format!(
            "filter error: value not supported: {}",
            other
        ))),
    }
}

fn condition_clause(
    cond: &DimensionValues,
    exclude: bool,
    args: &mut Vec<Value>,
) -> Result<String, QueryError> {
    let (prefix, joiner) = if exclude {
        ("NOT ", " AND ")
    } else {
        ("", " OR ")
    };
    let col = quote_ident(&cond.name);
    let mut clauses = Vec::new();

    if !cond.in_values.is_empty() {
        // null 单独用 IS [NOT] NULL 处理
        let mut placeholders = Vec::new();
        let mut has_null = false;
        for val in &cond.in_values {
            if val.is_null() {
                has_null = true;
                continue;
            }
            args.push(filter_value(val)?);
            placeholders.push("?");
        }
        if !placeholders.is_empty() {
            clauses.push(format!("{} {}IN ({})", col, prefix, placeholders.join(",")));
        }
        if has_null {
            clauses.push(format!("{} IS {}NULL", col, prefix));
        }
    }

    for val in &cond.like {
        args.push(filter_value(val)?);
        clauses.push(format!("{} {}LIKE ?", col, prefix));
    }

    if clauses.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(" AND ({})", clauses.join(joiner)))
}

pub fn filter_clause(
    filter: Option<&MetricsFilter>,
    args: &mut Vec<Value>,
) -> Result<String, QueryError> {
    let Some(filter) = filter else {
        return Ok(String::new());
    };
    let mut clause = String::new();
    for cond in &filter.include {
        clause.push_str(&condition_clause(cond, false, args)?);
    }
    for cond in &filter.exclude {
        clause.push_str(&condition_clause(cond, true, args)?);
    }
    Ok(clause)
}

pub fn time_series_sql(req: &TimeSeriesRequest) -> Result<SqlQuery, QueryError> {
    let mut args = Vec::new();
    let mut selects = vec![format!(
        "{} AS \"ts\"",
        time_bucket_expr(req.grain, &req.timestamp_column)
    )];
    selects.extend(measure_selects(&req.measures));

    let mut where_clause = "WHERE 1=1".to_string();
    where_clause.push_str(&time_range_clause(
        Some(&req.timestamp_column),
        req.start.as_deref(),
        req.end.as_deref(),
        &mut args,
    ));
    where_clause.push_str(&filter_clause(req.filter.as_ref(), &mut args)?);

    let sql = format!(
        "SELECT {} FROM {} {} GROUP BY 1 ORDER BY 1 LIMIT {}",
        selects.join(", "),
        quote_ident(&req.table_name),
        where_clause,
        req.limit
    );
    let mut columns = vec!["ts".to_string()];
    columns.extend(req.measures.iter().map(|m| m.sql_name.clone()));
    Ok(SqlQuery { sql, args, columns })
}

pub fn totals_sql(req: &TotalsRequest) -> Result<SqlQuery, QueryError> {
    if req.measures.is_empty() {
        return Err(QueryError::InvalidRequest(
            "totals need at least one measure".to_string(),
        ));
    }
    let mut args = Vec::new();
    let mut where_clause = "WHERE 1=1".to_string();
    where_clause.push_str(&time_range_clause(
        req.timestamp_column.as_deref(),
        req.start.as_deref(),
        req.end.as_deref(),
        &mut args,
    ));
    where_clause.push_str(&filter_clause(req.filter.as_ref(), &mut args)?);

    let sql = format!(
        "SELECT {} FROM {} {}",
        measure_selects(&req.measures).join(", "),
        quote_ident(&req.table_name),
        where_clause
    );
    let columns = req.measures.iter().map(|m| m.sql_name.clone()).collect();
    Ok(SqlQuery { sql, args, columns })
}

pub fn leaderboard_sql(req: &LeaderboardRequest) -> Result<SqlQuery, QueryError> {
    let mut args = Vec::new();
    let mut selects = vec![format!(
        "{} AS {}",
        quote_ident(&req.dimension_column),
        quote_ident(&req.dimension_column)
    )];
    selects.extend(measure_selects(&req.measures));

    let mut where_clause = "WHERE 1=1".to_string();
    where_clause.push_str(&time_range_clause(
        req.timestamp_column.as_deref(),
        req.start.as_deref(),
        req.end.as_deref(),
        &mut args,
    ));
    where_clause.push_str(&filter_clause(req.filter.as_ref(), &mut args)?);

    let mut columns = vec![req.dimension_column.clone()];
    columns.extend(req.measures.iter().map(|m| m.sql_name.clone()));

    // 排序字段只允许是结果集里的列，避免拼接任意 SQL
    let mut order = Vec::new();
    for entry in &req.sort {
        if !columns.contains(&entry.name) {
            return Err(QueryError::InvalidRequest(format!(
                "cannot sort by unknown column: {}",
                entry.name
            )));
        }
        let dir = match entry.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        order.push(format!("{} {}", quote_ident(&entry.name), dir));
    }
    if order.is_empty() {
        if let Some(first) = req.measures.first() {
            order.push(format!("{} DESC", quote_ident(&first.sql_name)));
        }
    }
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };

    let sql = format!(
        "SELECT {} FROM {} {} GROUP BY 1{} LIMIT {} OFFSET {}",
        selects.join(", "),
        quote_ident(&req.table_name),
        where_clause,
        order_clause,
        req.limit,
        req.offset
    );
    Ok(SqlQuery { sql, args, columns })
}
