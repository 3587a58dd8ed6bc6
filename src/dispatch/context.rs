use crate::dispatch::response::ActionError;
use crate::state::factory::new_entity_id;
use crate::state::EntitySnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 原始请求信息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub request_id: String,
    pub action: String,
    pub entity_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl RequestMeta {
    pub fn new(action: &str, entity_id: Option<&str>) -> Self {
        Self {
            request_id: new_entity_id(),
            action: action.to_string(),
            entity_id: entity_id.map(str::to_string),
            received_at: Utc::now(),
        }
    }
}

/// 分发时解析出的只读上下文。action 内部在 await 之后应重新读取 store，
/// 不要依赖这里的 record 快照。
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub id: Option<String>,
    pub record: Option<EntitySnapshot>,
    pub request: RequestMeta,
}

impl RequestContext {
    pub fn entity_id(&self) -> Result<&str, ActionError> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ActionError::argument(format!("{} requires an entity id", self.request.action))
            })
    }
}
