use crate::state::entity::{
    DerivedModel, DerivedTable, DimensionDefinition, EntityStatus, MeasureDefinition,
    MetricsDefinition, PersistentModel, PersistentTable, ValidationState,
};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// 生成形如 8-4-4-4-12 的随机十六进制 id
pub fn new_entity_id() -> String {
    let raw: u128 = rand::thread_rng().gen();
    let hex = format!("{:032x}", raw);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// 去掉扩展名和目录，只保留文件名主体
pub fn extract_table_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[..idx].to_string(),
        _ => base.to_string(),
    }
}

/// 把任意名字转成可以直接用作 SQL 标识符的表名
pub fn sanitize_entity_name(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());
    let s = re.replace_all(name.trim(), "_").to_string();
    if s.is_empty() {
        return "_".to_string();
    }
    if s.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", s)
    } else {
        s
    }
}

pub fn clean_model_name(name: &str) -> String {
    name.trim().trim_end_matches(".sql").to_string()
}

pub fn new_table(table_name: &str, path: &str) -> PersistentTable {
    let name = sanitize_entity_name(table_name);
    PersistentTable {
        id: new_entity_id(),
        name: name.clone(),
        path: path.to_string(),
        table_name: name,
        source_type: None,
        last_updated: 0,
    }
}

pub fn new_derived_table(table: &PersistentTable) -> DerivedTable {
    DerivedTable {
        id: table.id.clone(),
        profile: Vec::new(),
        cardinality: None,
        status: EntityStatus::Idle,
        error: None,
        last_updated: 0,
    }
}

pub fn new_model(name: &str, query: &str) -> PersistentModel {
    let name = format!("{}.sql", clean_model_name(name));
    PersistentModel {
        id: new_entity_id(),
        table_name: sanitize_entity_name(&extract_table_name(&name)),
        name,
        query: query.to_string(),
        last_updated: 0,
    }
}

pub fn new_derived_model(model: &PersistentModel) -> DerivedModel {
    DerivedModel {
        id: model.id.clone(),
        // 不赋值，留给 profile 流程填写
        sanitized_query: String::new(),
        profile: Vec::new(),
        status: EntityStatus::Idle,
        error: None,
        last_updated: 0,
    }
}

pub fn new_metrics_definition(label: &str) -> MetricsDefinition {
    MetricsDefinition {
        id: new_entity_id(),
        metric_def_label: label.to_string(),
        source_model_id: None,
        time_dimension: None,
        measure_ids: Vec::new(),
        dimension_ids: Vec::new(),
        creation_time: Utc::now().timestamp_millis(),
        last_updated: 0,
    }
}

pub fn new_measure_definition(metrics_def_id: &str, expression: &str) -> MeasureDefinition {
    MeasureDefinition {
        id: new_entity_id(),
        metrics_def_id: metrics_def_id.to_string(),
        label: String::new(),
        expression: expression.to_string(),
        sql_name: String::new(),
        description: String::new(),
        format_preset: String::new(),
        expression_is_valid: ValidationState::Pending,
        expression_validation_error: None,
        creation_time: Utc::now().timestamp_millis(),
        last_updated: 0,
    }
}

pub fn new_dimension_definition(metrics_def_id: &str, column: &str) -> DimensionDefinition {
    DimensionDefinition {
        id: new_entity_id(),
        metrics_def_id: metrics_def_id.to_string(),
        dimension_column: column.to_string(),
        label: String::new(),
        description: String::new(),
        creation_time: Utc::now().timestamp_millis(),
        last_updated: 0,
    }
}

/// 未命名的 measure 在视图里用 measure_<i> 作为列名
pub fn fallback_measure_name(index: usize, sql_name: &str) -> String {
    if sql_name.trim().is_empty() {
        format!("measure_{}", index)
    } else {
        sql_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_table_name() {
        let m = new_model("my orders.sql", "");
        assert_eq!(m.name, "my orders.sql");
        assert_eq!(m.table_name, "my_orders");
        assert_eq!(sanitize_entity_name("2024-sales"), "_2024_sales");
        assert_eq!(extract_table_name("data/AdBids.csv"), "AdBids");
    }

    #[test]
    fn test_entity_ids_are_unique() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fallback_measure_name() {
        assert_eq!(fallback_measure_name(2, ""), "measure_2");
        assert_eq!(fallback_measure_name(2, "revenue"), "revenue");
    }
}
