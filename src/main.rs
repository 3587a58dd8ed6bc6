use bidesk::app_service::{list_entities, refresh_stats};
use bidesk::app_state::{App, AppEvent};
use bidesk::commands::{AppCommand, HELP_TEXT};
use bidesk::engine::SqliteEngine;
use bidesk::queue::DatabaseActionQueue;
use bidesk::state::EntityStore;
use bidesk::{build_dispatcher, ActionServices, AppConfig};
use chrono::Local;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn init_logging(log_dir: &Path) -> std::io::Result<()> {
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    std::fs::create_dir_all(log_dir)?;
    let log_file = std::fs::File::create(log_dir.join(format!("app-{}.log", ts)))?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file))) // 输出重定向到文件，不干扰命令行
        .filter_level(log::LevelFilter::Warn)
        .filter_module("bidesk", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    init_logging(&config.log_dir)?;

    let mut session_info = Vec::new();
    let current_dir = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    session_info.push(format!("当前工作目录: {}", current_dir.display()));

    // 初始化数据库
    session_info.push(format!("正在连接数据库: {}", config.database_url));
    let engine = match SqliteEngine::connect(&config.database_url).await {
        Ok(engine) => {
            session_info.push("✓ 数据库连接成功".to_string());
            engine
        }
        Err(e) => {
            error!("无法连接数据库: {}", e);
            eprintln!("无法连接数据库: {}", e);
            return Err(e.into());
        }
    };

    let store = Arc::new(EntityStore::new());
    let queue = DatabaseActionQueue::start(Arc::new(engine));
    let services = ActionServices::new(store.clone(), queue.clone(), config.clone());
    let dispatcher = Arc::new(build_dispatcher(services)?);
    session_info.push(format!(
        "✓ 已注册 {} 个 action",
        dispatcher.action_names().len()
    ));
    info!("🚀 bidesk 已启动, database={}", config.database_url);

    // 创建核心 Channel
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AppCommand>();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();

    // store 变更推送到前端
    {
        let mut store_rx = store.subscribe();
        let txc = evt_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = store_rx.recv().await {
                if txc.send(AppEvent::Store(evt)).is_err() {
                    break;
                }
            }
        });
    }

    // 单后台任务模型 (Actor)：命令在这里串行接收，action 各自 spawn 执行
    let actor = {
        let evt_tx_bg = evt_tx.clone();
        let queue_bg = queue.clone();
        let store_bg = store.clone();
        let dispatcher_bg = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    AppCommand::Dispatch {
                        action,
                        entity_id,
                        args,
                    } => {
                        let dispatcher = dispatcher_bg.clone();
                        let tx = evt_tx_bg.clone();
                        tokio::spawn(async move {
                            let response =
                                dispatcher.dispatch(&action, entity_id.as_deref(), args).await;
                            let _ = tx.send(AppEvent::Response { action, response });
                        });
                    }
                    AppCommand::Activate { id } => {
                        let dispatcher = dispatcher_bg.clone();
                        let tx = evt_tx_bg.clone();
                        tokio::spawn(async move {
                            let action = "setActiveEntity".to_string();
                            let response = dispatcher.dispatch(&action, Some(&id), vec![]).await;
                            let _ = tx.send(AppEvent::Response { action, response });
                        });
                    }
                    AppCommand::List(target) => {
                        let _ = evt_tx_bg.send(AppEvent::Listing(list_entities(&store_bg, target)));
                    }
                    AppCommand::Stats => refresh_stats(&queue_bg, &evt_tx_bg),
                    AppCommand::Help => {
                        let _ = evt_tx_bg.send(AppEvent::Message(HELP_TEXT.to_string()));
                    }
                    AppCommand::Quit => {
                        let _ = evt_tx_bg.send(AppEvent::Message("收到退出命令".to_string()));
                        break;
                    }
                    AppCommand::Unknown(msg) => {
                        let _ = evt_tx_bg.send(AppEvent::Error(msg));
                    }
                }
            }
            queue_bg.shutdown().await;
            info!("👋 action queue 已关闭");
        })
    };

    let mut app = App::new(session_info, cmd_tx);
    for line in &app.log_messages {
        println!("{}", line);
    }
    println!("{}", HELP_TEXT);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin 关闭等同于 quit
                    Ok(None) => "quit".to_string(),
                    Err(e) => {
                        error!("读取输入失败: {}", e);
                        "quit".to_string()
                    }
                };
                if app.handle_line(&line) {
                    break;
                }
            }
            Some(event) = evt_rx.recv() => {
                if let Some(text) = app.apply_event(event) {
                    println!("{}", text);
                }
            }
        }
    }

    if let Err(e) = actor.await {
        error!("后台任务异常退出: {}", e);
    }
    while let Ok(event) = evt_rx.try_recv() {
        if let Some(text) = app.apply_event(event) {
            println!("{}", text);
        }
    }

    Ok(())
}
