use crate::engine::QueryError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueuePriority {
    Inactive,     // 非当前实体
    Background,   // 后台刷新
    ActiveEntity, // 当前选中的实体
}

/// 队列项的归属与优先级
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub owner_id: String,
    pub priority: QueuePriority,
}

impl ActionDescriptor {
    pub fn new(owner_id: impl Into<String>, priority: QueuePriority) -> Self {
        Self {
            owner_id: owner_id.into(),
            priority,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("{operation} for {owner_id} was superseded by a newer request")]
    Superseded {
        owner_id: String,
        operation: &'static str,
    },
    #[error("pending work for {owner_id} was cancelled")]
    Cancelled { owner_id: String },
    #[error("action queue is closed")]
    Closed,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("engine operation panicked: {0}")]
    Panicked(String),
}

impl QueueError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, QueueError::Superseded { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub superseded: usize,
    pub cancelled: usize,
}
