//! 分块批处理器
//!
//! 将输入文件列表切为定长块，逐文件驱动 校验 → 提取 → 落盘 → 持久化，
//! 每个文件恰好产生一条结果记录。块结束时释放块内暂存并上报进度，
//! 峰值内存为O(块大小)而非O(文件总数)。

use crate::files::IncomingFile;
use mia_core::{FileOutcome, MiaError, PersistOutcome, Result};
use mia_dicom::{FileValidator, MetadataExtractor};
use mia_database::ImageRepository;
use mia_storage::BlobStorage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一个块处理完成后的进度增量
#[derive(Debug, Default)]
pub struct ChunkDelta {
    /// 块序号（从0开始）
    pub chunk_index: usize,
    /// 本块产生的逐文件结果（含中止时补记的skipped）
    pub outcomes: Vec<FileOutcome>,
    /// 本块产生的警告
    pub warnings: Vec<String>,
    /// 本块触及的检查 (检查UID, 是否新建)
    pub studies: Vec<(String, bool)>,
    /// 本块最后成功归属的检查标签
    pub current_study_label: Option<String>,
}

impl ChunkDelta {
    fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            ..Default::default()
        }
    }
}

/// 整批处理的聚合结果
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<FileOutcome>,
    pub warnings: Vec<String>,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 触及的检查UID（按首次出现排序，去重）
    pub study_uids: Vec<String>,
    /// 新建的检查数
    pub new_studies: usize,
    /// 会话级中止原因；None表示整批正常结束
    pub abort_reason: Option<String>,
}

impl BatchReport {
    fn absorb(&mut self, delta: &ChunkDelta) {
        for outcome in &delta.outcomes {
            match outcome.outcome {
                mia_core::OutcomeKind::Succeeded => self.successful += 1,
                mia_core::OutcomeKind::Failed => self.failed += 1,
                mia_core::OutcomeKind::Skipped => self.skipped += 1,
            }
        }
        self.outcomes.extend(delta.outcomes.iter().cloned());
        self.warnings.extend(delta.warnings.iter().cloned());
        for (uid, created) in &delta.studies {
            if *created {
                self.new_studies += 1;
            }
            if !self.study_uids.iter().any(|u| u == uid) {
                self.study_uids.push(uid.clone());
            }
        }
    }
}

/// 分块批处理器
pub struct BatchProcessor {
    validator: FileValidator,
    extractor: MetadataExtractor,
    storage: Arc<BlobStorage>,
    repository: Arc<dyn ImageRepository>,
    chunk_size: usize,
}

impl BatchProcessor {
    pub fn new(
        validator: FileValidator,
        extractor: MetadataExtractor,
        storage: Arc<BlobStorage>,
        repository: Arc<dyn ImageRepository>,
        chunk_size: usize,
    ) -> Self {
        Self {
            validator,
            extractor,
            storage,
            repository,
            chunk_size: chunk_size.max(1),
        }
    }

    /// 处理一批文件
    ///
    /// 文件按提交顺序处理；文件级/检查级失败只记录结果并继续，
    /// 会话级错误中止剩余批次，未处理的文件补记为skipped，
    /// 已记录的结果全部保留。每个块结束调用一次进度回调。
    pub async fn process(
        &self,
        files: &[IncomingFile],
        mut on_chunk: impl FnMut(&ChunkDelta),
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut abort: Option<String> = None;
        let mut idx = 0;
        let mut chunk_index = 0;

        info!(
            "开始批处理: {} 个文件, 块大小 {}",
            files.len(),
            self.chunk_size
        );

        while idx < files.len() && abort.is_none() {
            let end = (idx + self.chunk_size).min(files.len());
            let mut delta = ChunkDelta::new(chunk_index);

            while idx < end {
                let file = &files[idx];
                idx += 1;

                match self.ingest_one(file, &mut delta.warnings).await {
                    Ok((persisted, label)) => {
                        delta
                            .studies
                            .push((persisted.study_uid.clone(), persisted.study_created));
                        delta.current_study_label = Some(label);
                        delta
                            .outcomes
                            .push(FileOutcome::succeeded(&file.original_name));
                    }
                    Err(e) if e.is_session_fatal() => {
                        warn!("会话级错误，中止批次: {}", e);
                        delta
                            .outcomes
                            .push(FileOutcome::failed(&file.original_name, e.reason_code()));
                        abort = Some(e.to_string());
                        break;
                    }
                    Err(e) => {
                        debug!("文件处理失败: {}: {}", file.original_name, e);
                        delta
                            .outcomes
                            .push(FileOutcome::failed(&file.original_name, e.reason_code()));
                    }
                }
            }

            // 块内暂存随delta移交回调后释放，下一块从空暂存开始
            report.absorb(&delta);
            on_chunk(&delta);
            drop(delta);
            chunk_index += 1;
        }

        if let Some(reason) = abort {
            let mut delta = ChunkDelta::new(chunk_index);
            for file in &files[idx..] {
                delta
                    .outcomes
                    .push(FileOutcome::skipped(&file.original_name, "批次已中止"));
            }
            report.absorb(&delta);
            on_chunk(&delta);
            report.abort_reason = Some(reason);
        }

        info!(
            "批处理结束: 成功 {}, 失败 {}, 跳过 {}, 新建检查 {}",
            report.successful, report.failed, report.skipped, report.new_studies
        );
        report
    }

    /// 处理单个文件：校验 → 提取 → 落盘 → 持久化
    async fn ingest_one(
        &self,
        file: &IncomingFile,
        warnings: &mut Vec<String>,
    ) -> Result<(PersistOutcome, String)> {
        self.validator
            .classify(&file.path, &file.original_name, file.size)?;

        let extraction = self.extractor.extract(&file.path, &file.original_name)?;
        warnings.extend(extraction.warnings);
        let metadata = extraction.metadata;

        let data = tokio::fs::read(&file.path)
            .await
            .map_err(|e| MiaError::Storage(format!("读取待摄取文件失败: {}", e)))?;
        let blob = self.storage.store_image(&metadata, &data).await?;
        drop(data);

        let persisted = self.repository.persist_instance(&metadata, &blob).await?;

        let label = match (&metadata.patient_name, &metadata.study_description) {
            (Some(name), _) => format!("{} ({})", name, persisted.study_uid),
            (None, Some(desc)) => format!("{} ({})", desc, persisted.study_uid),
            (None, None) => persisted.study_uid.clone(),
        };
        Ok((persisted, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mia_core::OutcomeKind;
    use mia_database::MemoryImageRepository;
    use mia_dicom::fixtures::{write_instance, FixtureInstance};
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("mia-processor-tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn wellformed(dir: &PathBuf, name: &str, study: &str, series: &str, sop: &str) -> IncomingFile {
        let path = dir.join(name);
        write_instance(
            &path,
            &FixtureInstance {
                study_uid: Some(study.to_string()),
                series_uid: Some(series.to_string()),
                sop_instance_uid: sop.to_string(),
                modality: "CT".to_string(),
                patient_id: Some("PAT001".to_string()),
                patient_name: Some("Doe^John".to_string()),
                series_number: Some(1),
            },
        )
        .unwrap();
        IncomingFile::from_path(path, name).unwrap()
    }

    fn zero_byte(dir: &PathBuf, name: &str) -> IncomingFile {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        IncomingFile::from_path(path, name).unwrap()
    }

    fn garbage(dir: &PathBuf, name: &str) -> IncomingFile {
        let path = dir.join(name);
        std::fs::write(&path, vec![0x55u8; 512]).unwrap();
        IncomingFile::from_path(path, name).unwrap()
    }

    fn processor(repo: Arc<MemoryImageRepository>, test: &str, chunk_size: usize) -> BatchProcessor {
        let storage = Arc::new(BlobStorage::new(temp_dir(test).join("blobs")));
        BatchProcessor::new(
            FileValidator::default(),
            MetadataExtractor::new(),
            storage,
            repo,
            chunk_size,
        )
    }

    fn mixed_batch(dir: &PathBuf) -> Vec<IncomingFile> {
        vec![
            wellformed(dir, "a.dcm", "1.1", "1.1.1", "1.1.1.1"),
            wellformed(dir, "b.dcm", "1.1", "1.1.1", "1.1.1.2"),
            zero_byte(dir, "empty1.dcm"),
            wellformed(dir, "c.dcm", "2.2", "2.2.1", "2.2.1.1"),
            garbage(dir, "noise.dcm"),
            zero_byte(dir, "empty2.dcm"),
            wellformed(dir, "d.dcm", "3.3", "3.3.1", "3.3.1.1"),
        ]
    }

    #[tokio::test]
    async fn test_mixed_batch_outcomes_in_order() {
        let dir = temp_dir("mixed");
        let repo = Arc::new(MemoryImageRepository::new());
        let files = mixed_batch(&dir);

        let report = processor(repo.clone(), "mixed", 3).process(&files, |_| {}).await;

        assert!(report.abort_reason.is_none());
        assert_eq!(report.successful, 4);
        assert_eq!(report.failed, 3);
        assert_eq!(report.skipped, 0);
        // 守恒律：每个输入文件恰好一条结果，顺序与提交一致
        assert_eq!(report.outcomes.len(), files.len());
        let names: Vec<_> = report.outcomes.iter().map(|o| o.filename.as_str()).collect();
        assert_eq!(
            names,
            vec!["a.dcm", "b.dcm", "empty1.dcm", "c.dcm", "noise.dcm", "empty2.dcm", "d.dcm"]
        );

        // 失败原因使用类型化原因码
        assert_eq!(report.outcomes[2].reason.as_deref(), Some("invalid-candidate"));
        assert_eq!(report.outcomes[4].reason.as_deref(), Some("unreadable"));

        // 同检查的两个文件归入一行
        assert_eq!(report.study_uids, vec!["1.1", "2.2", "3.3"]);
        assert_eq!(report.new_studies, 3);
        assert_eq!(repo.study_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_chunk_size_invariance() {
        for (i, chunk_size) in [1usize, 3, 7, 64].iter().enumerate() {
            let dir = temp_dir(&format!("invariance-{}", i));
            let repo = Arc::new(MemoryImageRepository::new());
            let files = mixed_batch(&dir);

            let report = processor(repo, &format!("invariance-{}", i), *chunk_size)
                .process(&files, |_| {})
                .await;

            assert_eq!(report.successful, 4, "chunk_size={}", chunk_size);
            assert_eq!(report.failed, 3, "chunk_size={}", chunk_size);
            assert_eq!(report.outcomes.len(), 7, "chunk_size={}", chunk_size);
            assert_eq!(report.study_uids, vec!["1.1", "2.2", "3.3"]);
        }
    }

    #[tokio::test]
    async fn test_chunk_callback_runs_per_chunk() {
        let dir = temp_dir("callback");
        let repo = Arc::new(MemoryImageRepository::new());
        let files = mixed_batch(&dir); // 7 个文件

        let mut chunks = Vec::new();
        processor(repo, "callback", 3)
            .process(&files, |delta| chunks.push(delta.outcomes.len()))
            .await;

        assert_eq!(chunks, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_reupload_attaches_to_existing_studies() {
        let dir = temp_dir("reupload");
        let repo = Arc::new(MemoryImageRepository::new());
        let files = vec![
            wellformed(&dir, "a.dcm", "1.1", "1.1.1", "1.1.1.1"),
            wellformed(&dir, "b.dcm", "2.2", "2.2.1", "2.2.1.1"),
            wellformed(&dir, "c.dcm", "3.3", "3.3.1", "3.3.1.1"),
        ];

        let p = processor(repo.clone(), "reupload", 50);
        let first = p.process(&files, |_| {}).await;
        assert_eq!(first.successful, 3);
        assert_eq!(first.new_studies, 3);

        // 再次摄取同样的文件：附着到已有检查，不新建
        let second = p.process(&files, |_| {}).await;
        assert_eq!(second.successful, 3);
        assert_eq!(second.new_studies, 0);
        assert_eq!(repo.study_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_session_abort_preserves_outcomes_and_skips_rest() {
        let dir = temp_dir("abort");
        let repo = Arc::new(MemoryImageRepository::new());
        let files = vec![
            wellformed(&dir, "a.dcm", "1.1", "1.1.1", "1.1.1.1"),
            wellformed(&dir, "b.dcm", "1.1", "1.1.1", "1.1.1.2"),
            wellformed(&dir, "c.dcm", "2.2", "2.2.1", "2.2.1.1"),
            wellformed(&dir, "d.dcm", "3.3", "3.3.1", "3.3.1.1"),
            wellformed(&dir, "e.dcm", "4.4", "4.4.1", "4.4.1.1"),
            wellformed(&dir, "f.dcm", "5.5", "5.5.1", "5.5.1.1"),
        ];

        // 第一块正常结束后注入存储中断
        let inject = repo.clone();
        let report = processor(repo, "abort", 2)
            .process(&files, move |delta| {
                if delta.chunk_index == 0 {
                    inject.inject_failure(true);
                }
            })
            .await;

        assert!(report.abort_reason.is_some());
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(report.outcomes[2].reason.as_deref(), Some("database-error"));
        assert_eq!(report.outcomes[3].outcome, OutcomeKind::Skipped);
        // 已成功的文件不回滚
        assert_eq!(report.study_uids, vec!["1.1"]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let repo = Arc::new(MemoryImageRepository::new());
        let report = processor(repo, "empty", 10).process(&[], |_| {}).await;

        assert!(report.abort_reason.is_none());
        assert_eq!(report.outcomes.len(), 0);
    }
}
