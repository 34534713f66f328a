//! Web服务器

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use mia_core::{MiaError, Result};
use mia_ingest::UploadSessionManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{
    api_root, health, progress_handler, result_handler, upload_directory_handler, upload_handler,
};

/// HTTP层共享状态
#[derive(Clone)]
pub struct AppState {
    /// 上传会话管理器
    pub manager: Arc<UploadSessionManager>,
    /// multipart上传的暂存目录
    pub spool_dir: PathBuf,
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        let app = Self::create_app(state);

        Self { addr, app }
    }

    fn create_app(state: AppState) -> Router {
        Router::new()
            // 根路径
            .route("/", get(api_root))
            // 健康检查
            .route("/health", get(health))
            // API路由
            .nest("/api/v1", api_routes())
            .with_state(state)
            // 全局中间件
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    ),
            )
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| MiaError::Internal(format!("Web服务器启动失败: {}", e)))?;

        Ok(())
    }
}

/// API v1 路由
///
/// 单个文件的大小上限由校验器按配置执行，HTTP层不再限制请求体。
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/upload/directory", post(upload_directory_handler))
        .route("/upload/:id/progress", get(progress_handler))
        .route("/upload/:id/result", get(result_handler))
        .layer(DefaultBodyLimit::disable())
}
