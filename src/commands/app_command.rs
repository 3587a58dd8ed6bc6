use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTarget {
    Tables,
    Models,
    Metrics,
    Measures,
    Dimensions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Dispatch {
        action: String,
        entity_id: Option<String>,
        args: Vec<Value>,
    },
    Activate {
        id: String,
    },
    List(ListTarget),
    Stats,
    Help,
    Quit,
    Unknown(String),
}

pub const HELP_TEXT: &str = "可用命令: dispatch <action> <entityId|-> [json-args] | active <id> | list <tables|models|metrics|measures|dimensions> | stats | help | quit";

const DISPATCH_USAGE: &str = "用法: dispatch <action> <entityId|-> [json-args]";

/// 切出第一个空白分隔的 token，返回 (token, 剩余部分)
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

fn parse_dispatch(rest: &str) -> AppCommand {
    let Some((action, rest)) = next_token(rest) else {
        return AppCommand::Unknown(DISPATCH_USAGE.to_string());
    };
    let (entity_id, rest) = match next_token(rest) {
        Some(("-", rest)) => (None, rest),
        Some((id, rest)) => (Some(id.to_string()), rest),
        None => (None, ""),
    };
    let raw = rest.trim();
    let args = if raw.is_empty() {
        Vec::new()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            Ok(single) => vec![single],
            Err(e) => return AppCommand::Unknown(format!("参数不是合法 JSON: {}", e)),
        }
    };
    AppCommand::Dispatch {
        action: action.to_string(),
        entity_id,
        args,
    }
}

impl FromStr for AppCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((head, rest)) = next_token(s) else {
            return Ok(AppCommand::Unknown("".to_string()));
        };

        match head {
            "dispatch" | "d" => Ok(parse_dispatch(rest)),
            "active" => match next_token(rest) {
                Some((id, _)) => Ok(AppCommand::Activate { id: id.to_string() }),
                None => Ok(AppCommand::Unknown("用法: active <id>".to_string())),
            },
            "list" | "ls" => match next_token(rest).map(|(t, _)| t) {
                Some("tables") => Ok(AppCommand::List(ListTarget::Tables)),
                Some("models") => Ok(AppCommand::List(ListTarget::Models)),
                Some("metrics") => Ok(AppCommand::List(ListTarget::Metrics)),
                Some("measures") => Ok(AppCommand::List(ListTarget::Measures)),
                Some("dimensions") => Ok(AppCommand::List(ListTarget::Dimensions)),
                _ => Ok(AppCommand::Unknown(
                    "用法: list <tables|models|metrics|measures|dimensions>".to_string(),
                )),
            },
            "stats" => Ok(AppCommand::Stats),
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            other => Ok(AppCommand::Unknown(format!("未知命令: {}", other))),
        }
    }
}
