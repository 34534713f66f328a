//! 内存持久层实现
//!
//! 与PostgreSQL实现保持相同的get-or-create语义，用于测试和
//! 未配置数据库的开发模式。带可切换的故障注入开关以演练
//! 会话级中止路径。

use crate::repository::ImageRepository;
use async_trait::async_trait;
use chrono::Utc;
use mia_core::{
    ImageInstance, ImageMetadata, MiaError, PersistOutcome, Result, Series, StoredBlob, Study,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// study_uid -> Study
    studies: HashMap<String, Study>,
    /// (study_id, series_uid) -> Series
    series: HashMap<(Uuid, String), Series>,
    /// (series_id, sop_instance_uid) -> ImageInstance
    instances: HashMap<(Uuid, String), ImageInstance>,
}

/// 内存影像仓库
#[derive(Default)]
pub struct MemoryImageRepository {
    inner: Mutex<Inner>,
    fail_injected: AtomicBool,
}

impl MemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开/关闭模拟的存储中断
    pub fn inject_failure(&self, fail: bool) {
        self.fail_injected.store(fail, Ordering::SeqCst);
    }

    /// 实例总数（测试辅助）
    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    /// 序列总数（测试辅助）
    pub fn series_count(&self) -> usize {
        self.lock().series.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn persist_instance(
        &self,
        metadata: &ImageMetadata,
        blob: &StoredBlob,
    ) -> Result<PersistOutcome> {
        if self.fail_injected.load(Ordering::SeqCst) {
            return Err(MiaError::Database("模拟存储中断".to_string()));
        }

        let study_uid = required_uid(&metadata.study_uid, "检查UID")?;
        let series_uid = required_uid(&metadata.series_uid, "序列UID")?;
        let sop_instance_uid = required_uid(&metadata.sop_instance_uid, "SOP实例UID")?;

        // 单锁覆盖三级写入，等价于单文件事务
        let mut inner = self.lock();
        let now = Utc::now();

        let mut study_created = false;
        let study_id = match inner.studies.get(&study_uid) {
            Some(study) => study.id,
            None => {
                let study = Study {
                    id: Uuid::new_v4(),
                    study_uid: study_uid.clone(),
                    patient_id: metadata.patient_id.clone(),
                    patient_name: metadata.patient_name.clone(),
                    patient_sex: metadata.patient_sex.clone(),
                    patient_birth_date: metadata.patient_birth_date.clone(),
                    modality: metadata.modality.clone().unwrap_or_else(|| "OT".to_string()),
                    description: metadata.study_description.clone(),
                    study_date: metadata.study_date.clone(),
                    created_at: now,
                    updated_at: now,
                };
                let id = study.id;
                inner.studies.insert(study_uid.clone(), study);
                study_created = true;
                id
            }
        };

        let series_key = (study_id, series_uid.clone());
        let mut series_created = false;
        let series_id = match inner.series.get(&series_key) {
            Some(series) => series.id,
            None => {
                let series = Series {
                    id: Uuid::new_v4(),
                    series_uid: series_uid.clone(),
                    study_id,
                    modality: metadata.modality.clone().unwrap_or_else(|| "OT".to_string()),
                    series_number: metadata.series_number,
                    description: metadata.series_description.clone(),
                    created_at: now,
                };
                let id = series.id;
                inner.series.insert(series_key, series);
                series_created = true;
                id
            }
        };

        let instance_key = (series_id, sop_instance_uid.clone());
        let mut instance_created = false;
        let instance_id = match inner.instances.get_mut(&instance_key) {
            Some(instance) => {
                // 重复实例：更新载荷位置，不另起一行
                instance.storage_path = blob.storage_path.clone();
                instance.file_size = blob.file_size;
                instance.content_digest = blob.content_digest.clone();
                instance.id
            }
            None => {
                let instance = ImageInstance {
                    id: Uuid::new_v4(),
                    sop_instance_uid: sop_instance_uid.clone(),
                    series_id,
                    instance_number: metadata.instance_number,
                    rows: metadata.rows,
                    columns: metadata.columns,
                    pixel_spacing: metadata.pixel_spacing.clone(),
                    slice_thickness: metadata.slice_thickness.clone(),
                    storage_path: blob.storage_path.clone(),
                    file_size: blob.file_size,
                    content_digest: blob.content_digest.clone(),
                    created_at: now,
                };
                let id = instance.id;
                inner.instances.insert(instance_key, instance);
                instance_created = true;
                id
            }
        };

        Ok(PersistOutcome {
            study_id,
            series_id,
            instance_id,
            study_uid,
            study_created,
            series_created,
            instance_created,
        })
    }

    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>> {
        Ok(self.lock().studies.get(study_uid).cloned())
    }

    async fn study_count(&self) -> Result<usize> {
        Ok(self.lock().studies.len())
    }
}

fn required_uid(uid: &Option<String>, name: &str) -> Result<String> {
    uid.as_deref()
        .filter(|u| !u.trim().is_empty())
        .map(|u| u.to_string())
        .ok_or_else(|| MiaError::MissingIdentifiers(format!("缺少{}", name)))
}
