use crate::commands::AppCommand;
use crate::dispatch::ActionResponse;
use crate::queue::QueueStats;
use crate::state::StoreEvent;
use std::str::FromStr;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum AppEvent {
    Log(String),
    Message(String),
    Error(String),
    Response {
        action: String,
        response: ActionResponse,
    },
    Listing(Vec<String>),
    Stats(QueueStats),
    Store(StoreEvent),
}

/// 命令行前端的状态：日志缓冲 + 最近一次队列统计
pub struct App {
    pub log_messages: Vec<String>,
    pub queue_stats: QueueStats,
    pub cmd_tx: mpsc::UnboundedSender<AppCommand>,
    pub show_store_events: bool,
}

impl App {
    pub fn new(session_info: Vec<String>, cmd_tx: mpsc::UnboundedSender<AppCommand>) -> App {
        let mut log_messages = vec!["应用已启动".to_string()];
        log_messages.extend(session_info);

        App {
            log_messages,
            queue_stats: QueueStats::default(),
            cmd_tx,
            show_store_events: false,
        }
    }

    pub fn add_log(&mut self, msg: String) {
        self.log_messages.push(msg);
    }

    /// 解析一行输入并发送给后台 Actor，返回 true 表示退出
    pub fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        let cmd = AppCommand::from_str(line)
            .unwrap_or_else(|_| AppCommand::Unknown(line.to_string()));
        let quit = cmd == AppCommand::Quit;
        if self.cmd_tx.send(cmd).is_err() {
            self.add_log("⚠ 后台任务已退出".to_string());
            return true;
        }
        quit
    }

    /// 把事件折叠进状态，返回需要打印的文本
    pub fn apply_event(&mut self, event: AppEvent) -> Option<String> {
        let line = match event {
            AppEvent::Log(msg) | AppEvent::Message(msg) => msg,
            AppEvent::Error(msg) => format!("✗ {}", msg),
            AppEvent::Response { action, response } => {
                let body = serde_json::to_string_pretty(&response)
                    .unwrap_or_else(|e| format!("<无法序列化响应: {}>", e));
                let mark = if response.is_success() { "✓" } else { "✗" };
                format!("{} {}\n{}", mark, action, body)
            }
            AppEvent::Listing(rows) => {
                if rows.is_empty() {
                    "(空)".to_string()
                } else {
                    rows.join("\n")
                }
            }
            AppEvent::Stats(stats) => {
                self.queue_stats = stats;
                format!(
                    "队列: 等待 {} | 运行 {} | 完成 {} | 失败 {} | 被取代 {} | 取消 {}",
                    stats.pending,
                    stats.running,
                    stats.completed,
                    stats.failed,
                    stats.superseded,
                    stats.cancelled
                )
            }
            AppEvent::Store(evt) => {
                if !self.show_store_events {
                    return None;
                }
                format!(
                    "· {:?} {} {:?} {}",
                    evt.action, evt.entity_type, evt.state_type, evt.id
                )
            }
        };
        self.log_messages.push(line.clone());
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityType, StateType, StoreAction};

    #[test]
    fn test_handle_line_sends_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut app = App::new(vec![], tx);

        assert!(!app.handle_line("   "));
        assert!(!app.handle_line("stats"));
        assert!(app.handle_line("quit"));

        assert_eq!(rx.try_recv().unwrap(), AppCommand::Stats);
        assert_eq!(rx.try_recv().unwrap(), AppCommand::Quit);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_event() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = App::new(vec![], tx);

        let stats = QueueStats {
            pending: 2,
            completed: 5,
            ..Default::default()
        };
        let line = app.apply_event(AppEvent::Stats(stats)).unwrap();
        assert!(line.contains("等待 2"));
        assert_eq!(app.queue_stats, stats);

        let store_event = StoreEvent {
            entity_type: EntityType::Model,
            state_type: StateType::Derived,
            action: StoreAction::UpdateEntity,
            id: "m1".to_string(),
        };
        assert!(app.apply_event(AppEvent::Store(store_event.clone())).is_none());
        app.show_store_events = true;
        assert!(app
            .apply_event(AppEvent::Store(store_event))
            .unwrap()
            .contains("m1"));

        let line = app
            .apply_event(AppEvent::Response {
                action: "addModel".to_string(),
                response: ActionResponse::success(crate::dispatch::ActionOutput::empty()),
            })
            .unwrap();
        assert!(line.starts_with("✓ addModel"));
    }
}
