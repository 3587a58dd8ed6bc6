use log::{info, LevelFilter};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use std::time::Duration;

/// 建立分析引擎连接。
///
/// 引擎不支持在同一连接上并发执行语句，所有访问都经过 Action Queue 串行化，
/// 因此连接池固定为 1 条连接。
pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    // 启用 WAL 模式（内存库会忽略）
    let _ = db
        .execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;

    info!("Engine connection established: {}", db_url);

    Ok(db)
}
