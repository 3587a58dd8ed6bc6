pub mod app_command;

pub use app_command::{AppCommand, ListTarget, HELP_TEXT};
