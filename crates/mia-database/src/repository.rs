//! 持久层接口定义

use async_trait::async_trait;
use mia_core::{ImageMetadata, PersistOutcome, Result, StoredBlob, Study};

/// 层次化影像仓库
///
/// 契约：`persist_instance`对单个文件的Study→Series→Image写入
/// 整体成功或整体回滚；同一UID并发写入按get-or-create消解，
/// 依赖底层存储的唯一性约束而非应用级全局锁。
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// 以一个事务持久化单个影像实例的三级归属
    async fn persist_instance(
        &self,
        metadata: &ImageMetadata,
        blob: &StoredBlob,
    ) -> Result<PersistOutcome>;

    /// 按检查UID查找检查
    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>>;

    /// 当前检查总数
    async fn study_count(&self) -> Result<usize>;
}
