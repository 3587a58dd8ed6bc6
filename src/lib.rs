pub mod actions;
pub mod app_service;
pub mod app_state;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod expression;
pub mod queue;
pub mod state;

pub use actions::{build_dispatcher, ActionServices};
pub use app_state::AppEvent;
pub use config::AppConfig;
