//! MIA服务器主程序

mod config;

use clap::Parser;
use mia_core::Result;
use mia_database::{DatabasePool, ImageRepository, MemoryImageRepository, PgImageRepository};
use mia_ingest::UploadSessionManager;
use mia_storage::BlobStorage;
use mia_web::{AppState, WebServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber;

use crate::config::ServerConfig;

/// MIA服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "mia-server")]
#[command(about = "MIA (Medical Image Archive) 批量摄取服务器")]
struct Args {
    /// 监听主机
    #[arg(long)]
    host: Option<String>,

    /// 服务器端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 影像文件存储目录
    #[arg(short, long)]
    storage_dir: Option<String>,

    /// multipart上传暂存目录
    #[arg(long)]
    spool_dir: Option<String>,

    /// 数据库连接串
    #[arg(short, long)]
    database_url: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("启动MIA摄取服务器...");

    // 加载配置，命令行参数覆盖配置文件
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.web.host = host;
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }
    if let Some(storage_dir) = args.storage_dir {
        config.storage.root_path = storage_dir;
    }
    if let Some(spool_dir) = args.spool_dir {
        config.storage.spool_path = spool_dir;
    }
    if let Some(database_url) = args.database_url {
        config.database.url = Some(database_url);
    }

    info!("MIA服务器配置:");
    info!("  监听地址: {}:{}", config.web.host, config.web.port);
    info!("  存储目录: {}", config.storage.root_path);
    info!("  暂存目录: {}", config.storage.spool_path);
    info!("  块大小: {}", config.ingest.chunk_size);
    info!("  同步阈值: {}", config.ingest.sync_threshold);

    // 创建存储库：配置了数据库连接串则使用Postgres，否则退化为内存实现
    let repository: Arc<dyn ImageRepository> = match &config.database.url {
        Some(url) => {
            let pool = DatabasePool::connect(url, config.database.max_connections).await?;
            let repo = PgImageRepository::new(pool.pool().clone());
            repo.create_tables().await?;
            info!("数据库已连接并完成表初始化");
            Arc::new(repo)
        }
        None => {
            warn!("未配置数据库连接串，使用内存存储库（重启后数据丢失）");
            Arc::new(MemoryImageRepository::new())
        }
    };

    let storage = Arc::new(BlobStorage::new(&config.storage.root_path));
    let spool_dir = PathBuf::from(&config.storage.spool_path);
    tokio::fs::create_dir_all(&spool_dir).await?;

    let manager = Arc::new(UploadSessionManager::new(
        repository,
        storage,
        config.ingest.clone(),
    ));

    // 定期清理过期的终态会话
    let sweep_store = manager.progress_store();
    let sweep_interval = config.ingest.progress_retention().max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let removed = sweep_store.sweep();
            if removed > 0 {
                info!("清理了 {} 个过期会话", removed);
            }
        }
    });

    let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port)
        .parse()
        .map_err(|e| mia_core::MiaError::Config(format!("无效的监听地址: {}", e)))?;

    let state = AppState {
        manager,
        spool_dir,
    };

    // 启动Web服务器
    let server = WebServer::new(addr, state);
    if let Err(e) = server.run().await {
        error!("服务器启动失败: {}", e);
        return Err(e);
    }

    Ok(())
}
