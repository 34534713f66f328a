//! HTTP处理器

use crate::server::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use mia_core::{MiaError, UploadSession};
use mia_ingest::{collect_directory, IncomingFile, SubmitOutcome};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "MIA Ingest API",
        "version": "1.0.0",
        "status": "running",
        "endpoints": {
            "health": "/health",
            "upload": "/api/v1/upload",
            "upload_directory": "/api/v1/upload/directory",
            "progress": "/api/v1/upload/{id}/progress",
            "result": "/api/v1/upload/{id}/result"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": "1.0.0"
    }))
}

/// 批量上传处理器
///
/// multipart各部分按到达顺序流式写入暂存目录，再整批提交给
/// 会话管理器；小批次同步返回终态，大批次立即返回上传ID。
pub async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let batch_dir = state.spool_dir.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&batch_dir)
        .await
        .map_err(|e| MiaError::Storage(format!("创建暂存目录失败: {}", e)))?;

    let mut files = Vec::new();
    let mut index = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| MiaError::Validation(format!("读取multipart失败: {}", e)))?
    {
        let original_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("file-{:06}", index));

        // 一次只暂存一个部分的数据，写盘后立即释放
        let data = field
            .bytes()
            .await
            .map_err(|e| MiaError::Validation(format!("读取上传内容失败: {}", e)))?;
        let spool_path = batch_dir.join(format!("{:06}", index));
        tokio::fs::write(&spool_path, &data)
            .await
            .map_err(|e| MiaError::Storage(format!("写入暂存文件失败: {}", e)))?;
        let size = data.len() as u64;
        drop(data);

        files.push(IncomingFile {
            original_name,
            path: spool_path,
            size,
        });
        index += 1;
    }

    info!("收到上传请求: {} 个文件", files.len());
    let response = match state.manager.submit(files).await? {
        SubmitOutcome::Completed(session) => completed_response(&session),
        SubmitOutcome::Accepted { upload_id, status } => Json(json!({
            "upload_id": upload_id,
            "status": status,
        })),
    };
    Ok(response)
}

/// 目录摄取请求
#[derive(Debug, Deserialize)]
pub struct DirectoryUploadRequest {
    /// 外部生产者已投递文件的目录
    pub path: PathBuf,
}

/// 目录摄取处理器
///
/// 摄取一棵已落盘的目录树（例如网络推送接收端的投递目录），
/// 文件不经暂存复制，直接按所在位置处理。
pub async fn upload_directory_handler(
    State(state): State<AppState>,
    Json(request): Json<DirectoryUploadRequest>,
) -> ApiResult<impl IntoResponse> {
    let files = collect_directory(&request.path)?;
    info!("收到目录摄取请求: {:?} 共 {} 个文件", request.path, files.len());

    let response = match state.manager.submit(files).await? {
        SubmitOutcome::Completed(session) => completed_response(&session),
        SubmitOutcome::Accepted { upload_id, status } => Json(json!({
            "upload_id": upload_id,
            "status": status,
        })),
    };
    Ok(response)
}

/// 进度轮询处理器
pub async fn progress_handler(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let session = state.manager.progress(upload_id)?;
    Ok(Json(json!({
        "upload_id": session.id,
        "status": session.status,
        "total_files": session.total_files,
        "processed_files": session.processed_files,
        "successful_files": session.successful_files,
        "failed_files": session.failed_files,
        "current_study_label": session.current_study_label,
        "errors": session.errors,
        "warnings": session.warnings,
    })))
}

/// 结果获取处理器，仅在会话进入终态后有效
pub async fn result_handler(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let session = state.manager.result(upload_id)?;
    Ok(Json(json!({
        "upload_id": session.id,
        "status": session.status,
        "total_files": session.total_files,
        "successful_files": session.successful_files,
        "failed_files": session.failed_files,
        "outcomes": session.outcomes,
        "study_uids": session.study_uids,
        "new_studies": session.new_studies,
        "errors": session.errors,
        "warnings": session.warnings,
    })))
}

/// 同步路径的完成响应
fn completed_response(session: &UploadSession) -> Json<serde_json::Value> {
    let failed: Vec<_> = session
        .failed_entries()
        .into_iter()
        .map(|o| json!({ "filename": o.filename, "reason": o.reason }))
        .collect();

    Json(json!({
        "upload_id": session.id,
        "status": session.status,
        "total_files": session.total_files,
        "successful_files": session.successful_filenames(),
        "failed_files": failed,
        "study_uids": session.study_uids,
        "new_studies": session.new_studies,
        "warnings": session.warnings,
    }))
}

/// HTTP层错误包装，把`MiaError`映射为带JSON消息体的状态码
pub struct ApiError(MiaError);

/// HTTP处理器统一结果类型
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<MiaError> for ApiError {
    fn from(err: MiaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            MiaError::NotFound(_) => StatusCode::NOT_FOUND,
            MiaError::Validation(_)
            | MiaError::InvalidCandidate(_)
            | MiaError::Unreadable(_)
            | MiaError::MissingIdentifiers(_)
            | MiaError::DicomParse(_) => StatusCode::BAD_REQUEST,
            MiaError::DuplicateConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": true,
            "message": self.0.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let resp = ApiError(MiaError::NotFound("未知的上传ID".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError(MiaError::Validation("尚未结束".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError(MiaError::Database("连接中断".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
