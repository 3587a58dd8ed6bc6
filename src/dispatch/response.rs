use crate::engine::QueryError;
use crate::queue::QueueError;
use crate::state::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    EntityError,
    ValidationError,
    QueryError,
    DuplicateEntityError,
    CancelledError,
    ArgumentError,
    UnknownActionError,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// 所有 action 的统一返回信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ResponseStatus,
    pub messages: Vec<ResponseMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResponse {
    pub fn success(output: ActionOutput) -> Self {
        let messages = output
            .message
            .into_iter()
            .map(|message| ResponseMessage {
                message_type: MessageType::Info,
                message,
                error_kind: None,
            })
            .collect();
        Self {
            status: ResponseStatus::Success,
            messages,
            data: output.data,
        }
    }

    pub fn failure(err: &ActionError) -> Self {
        Self {
            status: ResponseStatus::Failure,
            messages: vec![ResponseMessage {
                message_type: MessageType::Error,
                message: err.to_string(),
                error_kind: Some(err.kind()),
            }],
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.messages.iter().find_map(|m| m.error_kind)
    }

    pub fn first_message(&self) -> Option<&str> {
        self.messages.first().map(|m| m.message.as_str())
    }
}

/// action 成功时的结果：可选的提示信息与数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl ActionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
            data: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, ActionError> {
        let data = serde_json::to_value(value).map_err(anyhow::Error::from)?;
        Ok(Self {
            message: None,
            data: Some(data),
        })
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("{0}")]
    Entity(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Query(String),
    #[error("{0}")]
    DuplicateEntity(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    Argument(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Entity(_) => ErrorKind::EntityError,
            ActionError::Validation(_) => ErrorKind::ValidationError,
            ActionError::Query(_) => ErrorKind::QueryError,
            ActionError::DuplicateEntity(_) => ErrorKind::DuplicateEntityError,
            ActionError::Cancelled(_) => ErrorKind::CancelledError,
            ActionError::Argument(_) => ErrorKind::ArgumentError,
            ActionError::UnknownAction(_) => ErrorKind::UnknownActionError,
            ActionError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn entity(msg: impl Into<String>) -> Self {
        ActionError::Entity(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ActionError::Validation(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        ActionError::Argument(msg.into())
    }
}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEntity { .. } => ActionError::DuplicateEntity(e.to_string()),
            StoreError::InvalidPatch { .. } => ActionError::Argument(e.to_string()),
            StoreError::NotFound { .. } | StoreError::MissingCounterpart { .. } => {
                ActionError::Entity(e.to_string())
            }
        }
    }
}

impl From<QueryError> for ActionError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidRequest(_) => ActionError::Argument(e.to_string()),
            _ => ActionError::Query(e.to_string()),
        }
    }
}

impl From<QueueError> for ActionError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Query(q) => q.into(),
            QueueError::Panicked(_) => ActionError::Internal(anyhow::anyhow!(e.to_string())),
            QueueError::Superseded { .. } | QueueError::Cancelled { .. } | QueueError::Closed => {
                ActionError::Cancelled(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_json_shape() {
        let ok = ActionResponse::success(
            ActionOutput::json(&json!({"rows": 2})).unwrap().with_message("done"),
        );
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "status": "success",
                "messages": [{"type": "info", "message": "done"}],
                "data": {"rows": 2}
            })
        );

        let failed = ActionResponse::failure(&ActionError::entity("No Model found for id=m1"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({
                "status": "failure",
                "messages": [{
                    "type": "error",
                    "message": "No Model found for id=m1",
                    "errorKind": "EntityError"
                }]
            })
        );
    }

    #[test]
    fn test_error_conversions() {
        let dup: ActionError = StoreError::DuplicateEntity {
            entity_type: crate::state::EntityType::Table,
            id: "t1".into(),
        }
        .into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateEntityError);

        let superseded: ActionError = QueueError::Superseded {
            owner_id: "d1".into(),
            operation: "runQuery",
        }
        .into();
        assert_eq!(superseded.kind(), ErrorKind::CancelledError);

        let query: ActionError =
            QueueError::Query(QueryError::Database("no such table".into())).into();
        assert_eq!(query.kind(), ErrorKind::QueryError);
        assert_eq!(
            ActionError::from(QueueError::Panicked("boom".into())).kind(),
            ErrorKind::InternalError
        );
    }
}
