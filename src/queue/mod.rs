pub mod model;
pub mod service;

pub use model::{ActionDescriptor, QueueError, QueuePriority, QueueStats};
pub use service::DatabaseActionQueue;
