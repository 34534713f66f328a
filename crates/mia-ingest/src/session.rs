//! 上传会话管理器
//!
//! 负责一次上传请求的完整生命周期：按批量大小决定同步或后台执行，
//! 驱动分块批处理器，并把进度快照写入进度存储。后台工作者由
//! 显式保留句柄的监督任务看护，崩溃时会话被标记为失败而不是
//! 永远停留在处理中。

use crate::config::IngestConfig;
use crate::files::IncomingFile;
use crate::processor::{BatchProcessor, ChunkDelta};
use crate::progress::ProgressStore;
use mia_core::{MiaError, Result, UploadEvent, UploadSession, UploadStatus};
use mia_database::ImageRepository;
use mia_dicom::{FileValidator, MetadataExtractor};
use mia_storage::BlobStorage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 提交一批文件的响应
#[derive(Debug)]
pub enum SubmitOutcome {
    /// 同步路径：批次已处理完，附终态快照
    Completed(UploadSession),
    /// 异步路径：批次已移交后台工作者
    Accepted {
        upload_id: Uuid,
        status: UploadStatus,
    },
}

/// 上传会话管理器
pub struct UploadSessionManager {
    store: Arc<ProgressStore>,
    processor: Arc<BatchProcessor>,
    config: IngestConfig,
    /// 每个后台上传的监督任务句柄，监督任务结束时自行注销
    supervisors: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl UploadSessionManager {
    /// 组装完整的摄取流水线
    pub fn new(
        repository: Arc<dyn ImageRepository>,
        storage: Arc<BlobStorage>,
        config: IngestConfig,
    ) -> Self {
        let validator = FileValidator::new(config.min_file_size, config.max_file_size);
        let processor = Arc::new(BatchProcessor::new(
            validator,
            MetadataExtractor::new(),
            storage,
            repository,
            config.chunk_size,
        ));
        let store = Arc::new(ProgressStore::new(config.progress_retention()));

        Self {
            store,
            processor,
            config,
            supervisors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 提交一批文件
    ///
    /// 不超过`sync_threshold`的批次在调用方上下文内联处理并返回终态；
    /// 更大的批次移交后台工作者，立即返回上传ID供轮询。
    pub async fn submit(&self, files: Vec<IncomingFile>) -> Result<SubmitOutcome> {
        let session = UploadSession::new(files.len());
        let upload_id = session.id;
        self.store.insert(session);

        if files.len() <= self.config.sync_threshold {
            info!("同步处理上传 {} ({} 个文件)", upload_id, files.len());
            run_batch(self.store.clone(), self.processor.clone(), upload_id, files).await;
            return Ok(SubmitOutcome::Completed(self.store.snapshot(upload_id)?));
        }

        info!("后台处理上传 {} ({} 个文件)", upload_id, files.len());
        let worker = {
            let store = self.store.clone();
            let processor = self.processor.clone();
            tokio::spawn(async move { run_batch(store, processor, upload_id, files).await })
        };

        // 监督任务持有工作者句柄：工作者panic时把会话标记为失败，
        // 而不是让轮询端永远看到处理中。插入与自行注销在同一把锁上
        // 串行，注销不会先于插入执行。
        let mut supervisors = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let supervisor = {
            let store = self.store.clone();
            let registry = self.supervisors.clone();
            tokio::spawn(async move {
                if let Err(join_err) = worker.await {
                    if join_err.is_panic() {
                        error!("上传 {} 的工作者异常退出", upload_id);
                        let marked = store.update(upload_id, |s| {
                            s.errors.push("处理批次的工作者异常退出".to_string());
                            if let Err(e) = s.apply_event(&UploadEvent::Aborted) {
                                warn!("无法标记会话失败: {}", e);
                            }
                        });
                        if let Err(e) = marked {
                            warn!("无法更新崩溃会话 {}: {}", upload_id, e);
                        }
                    }
                }
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&upload_id);
            })
        };
        supervisors.insert(upload_id, supervisor);
        drop(supervisors);

        let status = self.store.snapshot(upload_id)?.status;
        Ok(SubmitOutcome::Accepted { upload_id, status })
    }

    /// 读取进度快照
    pub fn progress(&self, upload_id: Uuid) -> Result<UploadSession> {
        self.store.snapshot(upload_id)
    }

    /// 读取最终结果，仅在会话进入终态后有效
    pub fn result(&self, upload_id: Uuid) -> Result<UploadSession> {
        let snapshot = self.store.snapshot(upload_id)?;
        if !snapshot.status.is_terminal() {
            return Err(MiaError::Validation(format!(
                "上传 {} 尚未结束，当前状态 {:?}",
                upload_id, snapshot.status
            )));
        }
        Ok(snapshot)
    }

    /// 等待一个后台上传结束（监督任务退出即工作者已退出）
    pub async fn wait(&self, upload_id: Uuid) -> Result<()> {
        let supervisor = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&upload_id);

        match supervisor {
            Some(handle) => {
                handle
                    .await
                    .map_err(|e| MiaError::Internal(format!("监督任务退出异常: {}", e)))?;
            }
            // 监督任务已自行注销：确认会话确实进入了终态
            None => {
                let snapshot = self.store.snapshot(upload_id)?;
                if !snapshot.status.is_terminal() {
                    return Err(MiaError::NotFound(format!("没有后台上传: {}", upload_id)));
                }
            }
        }
        Ok(())
    }

    /// 仍在登记中的监督任务数
    pub fn supervisor_count(&self) -> usize {
        self.supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 进度存储（用于周期性清理过期会话）
    pub fn progress_store(&self) -> Arc<ProgressStore> {
        self.store.clone()
    }
}

/// 执行一个批次并把进度写入进度存储
async fn run_batch(
    store: Arc<ProgressStore>,
    processor: Arc<BatchProcessor>,
    upload_id: Uuid,
    files: Vec<IncomingFile>,
) {
    if let Err(e) = store.update(upload_id, |s| {
        if let Err(e) = s.apply_event(&UploadEvent::Started) {
            warn!("会话 {} 启动转换失败: {}", upload_id, e);
        }
    }) {
        warn!("无法启动会话 {}: {}", upload_id, e);
        return;
    }

    let report = processor
        .process(&files, |delta| {
            let applied = store.update(upload_id, |s| apply_delta(s, delta));
            if let Err(e) = applied {
                warn!("上传 {} 进度写入失败: {}", upload_id, e);
            }
        })
        .await;

    let abort_reason = report.abort_reason.clone();
    let finished = store.update(upload_id, |s| {
        let event = match &abort_reason {
            Some(reason) => {
                s.errors.push(reason.clone());
                UploadEvent::Aborted
            }
            None => UploadEvent::Finished,
        };
        if let Err(e) = s.apply_event(&event) {
            warn!("会话 {} 终态转换失败: {}", upload_id, e);
        }
    });
    if let Err(e) = finished {
        warn!("无法终结会话 {}: {}", upload_id, e);
    }
}

/// 把一个块的进度增量并入会话
fn apply_delta(session: &mut UploadSession, delta: &ChunkDelta) {
    for outcome in &delta.outcomes {
        session.record_outcome(outcome.clone());
    }
    session.warnings.extend(delta.warnings.iter().cloned());
    for (uid, created) in &delta.studies {
        session.record_study(uid, *created);
    }
    if let Some(label) = &delta.current_study_label {
        session.current_study_label = Some(label.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mia_core::{ImageMetadata, PersistOutcome, StoredBlob, Study};
    use mia_database::MemoryImageRepository;
    use mia_dicom::fixtures::{write_instance, FixtureInstance};
    use std::path::PathBuf;
    use std::time::Duration;

    /// 在持久化时崩溃的仓库，用于演练工作者异常退出
    struct PanickingRepository;

    #[async_trait]
    impl ImageRepository for PanickingRepository {
        async fn persist_instance(
            &self,
            _metadata: &ImageMetadata,
            _blob: &StoredBlob,
        ) -> Result<PersistOutcome> {
            panic!("持久层崩溃");
        }

        async fn get_study_by_uid(&self, _study_uid: &str) -> Result<Option<Study>> {
            Ok(None)
        }

        async fn study_count(&self) -> Result<usize> {
            Ok(0)
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("mia-session-tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn wellformed(dir: &PathBuf, i: usize, study: &str) -> IncomingFile {
        let name = format!("img{:03}.dcm", i);
        let path = dir.join(&name);
        write_instance(
            &path,
            &FixtureInstance {
                study_uid: Some(study.to_string()),
                series_uid: Some(format!("{}.1", study)),
                sop_instance_uid: format!("{}.1.{}", study, i),
                modality: "CT".to_string(),
                patient_id: Some("PAT001".to_string()),
                patient_name: Some("Doe^John".to_string()),
                series_number: Some(1),
            },
        )
        .unwrap();
        IncomingFile::from_path(path, name).unwrap()
    }

    fn zero_byte(dir: &PathBuf, i: usize) -> IncomingFile {
        let name = format!("empty{:03}.dcm", i);
        let path = dir.join(&name);
        std::fs::write(&path, b"").unwrap();
        IncomingFile::from_path(path, name).unwrap()
    }

    fn manager(test: &str, config: IngestConfig) -> UploadSessionManager {
        let repo = Arc::new(MemoryImageRepository::new());
        let storage = Arc::new(BlobStorage::new(temp_dir(test).join("blobs")));
        UploadSessionManager::new(repo, storage, config)
    }

    fn small_config() -> IngestConfig {
        IngestConfig {
            chunk_size: 2,
            sync_threshold: 3,
            progress_retention_secs: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_threshold_boundary_sync_vs_async() {
        let dir = temp_dir("threshold");
        let manager = manager("threshold", small_config());

        // 恰好等于阈值：同步返回终态
        let files: Vec<_> = (0..3).map(|i| wellformed(&dir, i, "1.1")).collect();
        match manager.submit(files).await.unwrap() {
            SubmitOutcome::Completed(session) => {
                assert_eq!(session.status, UploadStatus::Completed);
                assert_eq!(session.total_files, 3);
                assert_eq!(session.successful_files, 3);
            }
            other => panic!("期望同步完成，实际 {:?}", other),
        }

        // 超过阈值一个：立即返回可轮询的上传ID
        let files: Vec<_> = (10..14).map(|i| wellformed(&dir, i, "2.2")).collect();
        match manager.submit(files).await.unwrap() {
            SubmitOutcome::Accepted { upload_id, status } => {
                assert!(matches!(
                    status,
                    UploadStatus::Queued | UploadStatus::Processing
                ));
                manager.wait(upload_id).await.unwrap();
                let session = manager.result(upload_id).unwrap();
                assert_eq!(session.status, UploadStatus::Completed);
                assert_eq!(session.successful_files, 4);
            }
            other => panic!("期望异步受理，实际 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_still_completes() {
        let dir = temp_dir("partial");
        let manager = manager("partial", small_config());

        let mut files: Vec<_> = (0..8).map(|i| wellformed(&dir, i, "3.3")).collect();
        files.push(zero_byte(&dir, 0));
        files.push(zero_byte(&dir, 1));

        let upload_id = match manager.submit(files).await.unwrap() {
            SubmitOutcome::Accepted { upload_id, .. } => upload_id,
            other => panic!("期望异步受理，实际 {:?}", other),
        };
        manager.wait(upload_id).await.unwrap();

        // 含无效文件的批次仍然正常完成，失败只反映在计数里
        let session = manager.result(upload_id).unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert_eq!(session.total_files, 10);
        assert_eq!(session.successful_files, 8);
        assert_eq!(session.failed_files, 2);
        for entry in session.failed_entries() {
            assert_eq!(entry.reason.as_deref(), Some("invalid-candidate"));
        }
    }

    #[tokio::test]
    async fn test_monotonic_progress_snapshots() {
        let dir = temp_dir("monotonic");
        let config = IngestConfig {
            chunk_size: 1,
            sync_threshold: 2,
            progress_retention_secs: 60,
            ..Default::default()
        };
        let manager = Arc::new(manager("monotonic", config));

        let files: Vec<_> = (0..12).map(|i| wellformed(&dir, i, "4.4")).collect();
        let upload_id = match manager.submit(files).await.unwrap() {
            SubmitOutcome::Accepted { upload_id, .. } => upload_id,
            other => panic!("期望异步受理，实际 {:?}", other),
        };

        let mut last = 0usize;
        loop {
            let snapshot = manager.progress(upload_id).unwrap();
            assert!(snapshot.processed_files >= last, "进度必须单调不减");
            assert!(snapshot.processed_files <= snapshot.total_files);
            assert_eq!(
                snapshot.successful_files + snapshot.failed_files,
                snapshot.processed_files
            );
            last = snapshot.processed_files;
            if snapshot.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let session = manager.result(upload_id).unwrap();
        assert_eq!(session.processed_files, 12);
        assert_eq!(session.successful_files + session.failed_files, 12);
    }

    #[tokio::test]
    async fn test_supervisor_registry_drains_after_completion() {
        let dir = temp_dir("drain");
        let manager = manager("drain", small_config());

        let mut ids = Vec::new();
        for batch in 0..5usize {
            let files: Vec<_> = (0..4)
                .map(|i| wellformed(&dir, batch * 10 + i, &format!("8.{}", batch)))
                .collect();
            match manager.submit(files).await.unwrap() {
                SubmitOutcome::Accepted { upload_id, .. } => ids.push(upload_id),
                other => panic!("期望异步受理，实际 {:?}", other),
            }
        }

        // 句柄随工作者结束自行注销，不随上传次数累积
        for _ in 0..500 {
            if manager.supervisor_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(manager.supervisor_count(), 0);

        for id in ids {
            assert_eq!(manager.result(id).unwrap().status, UploadStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_worker_panic_marks_session_failed() {
        let dir = temp_dir("panic");
        let storage = Arc::new(BlobStorage::new(dir.join("blobs")));
        let manager =
            UploadSessionManager::new(Arc::new(PanickingRepository), storage, small_config());

        let files: Vec<_> = (0..4).map(|i| wellformed(&dir, i, "9.9")).collect();
        let upload_id = match manager.submit(files).await.unwrap() {
            SubmitOutcome::Accepted { upload_id, .. } => upload_id,
            other => panic!("期望异步受理，实际 {:?}", other),
        };
        manager.wait(upload_id).await.unwrap();

        // 工作者崩溃不留下永远处于处理中的会话
        let session = manager.result(upload_id).unwrap();
        assert_eq!(session.status, UploadStatus::Failed);
        assert!(session.errors.iter().any(|e| e.contains("工作者异常退出")));
    }

    #[tokio::test]
    async fn test_large_batch_crosses_default_threshold() {
        let dir = temp_dir("large");
        // 默认配置：同步阈值100，块大小50
        let manager = manager("large", IngestConfig::default());

        let mut files: Vec<_> = (0..140).map(|i| wellformed(&dir, i, "7.7")).collect();
        for i in 0..10 {
            files.push(zero_byte(&dir, i));
        }

        let upload_id = match manager.submit(files).await.unwrap() {
            SubmitOutcome::Accepted { upload_id, .. } => upload_id,
            other => panic!("150个文件应走异步路径，实际 {:?}", other),
        };
        manager.wait(upload_id).await.unwrap();

        let session = manager.result(upload_id).unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert_eq!(session.total_files, 150);
        assert_eq!(session.successful_files, 140);
        assert_eq!(session.failed_files, 10);
        for entry in session.failed_entries() {
            assert_eq!(entry.reason.as_deref(), Some("invalid-candidate"));
        }
    }

    #[tokio::test]
    async fn test_result_for_unknown_id_is_not_found() {
        let manager = manager("early-result", small_config());
        let err = manager.result(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, MiaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_progress_expires_after_retention() {
        let dir = temp_dir("expiry");
        let config = IngestConfig {
            chunk_size: 2,
            sync_threshold: 10,
            progress_retention_secs: 0,
            ..Default::default()
        };
        let manager = manager("expiry", config);

        let files: Vec<_> = (0..2).map(|i| wellformed(&dir, i, "5.5")).collect();
        // 保留期为0：同步完成的会话立刻过期
        let err = manager.submit(files).await.unwrap_err();
        assert!(matches!(err, MiaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reupload_creates_no_new_studies() {
        let dir = temp_dir("idempotent");
        let manager = manager("idempotent", small_config());

        let files: Vec<_> = (0..3)
            .map(|i| wellformed(&dir, i, &format!("6.{}", i)))
            .collect();

        let first = match manager.submit(files.clone()).await.unwrap() {
            SubmitOutcome::Completed(session) => session,
            other => panic!("期望同步完成，实际 {:?}", other),
        };
        assert_eq!(first.successful_files, 3);
        assert_eq!(first.new_studies, 3);
        assert_eq!(first.study_uids.len(), 3);

        let second = match manager.submit(files).await.unwrap() {
            SubmitOutcome::Completed(session) => session,
            other => panic!("期望同步完成，实际 {:?}", other),
        };
        assert_eq!(second.successful_files, 3);
        assert_eq!(second.new_studies, 0);
        assert_eq!(second.study_uids.len(), 3);
    }
}
