//! 影像载荷存储管理

use mia_core::{ImageMetadata, MiaError, Result, StoredBlob};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 存储管理器
///
/// 载荷按 `<检查UID>/<序列UID>/<SOP实例UID>.dcm` 的层次布局落盘，
/// 同一实例重复写入覆盖同一路径（与持久层的幂等upsert一致）。
pub struct BlobStorage {
    base_path: PathBuf,
}

impl BlobStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// 存储一个影像载荷，返回其存储位置与内容摘要
    pub async fn store_image(&self, metadata: &ImageMetadata, data: &[u8]) -> Result<StoredBlob> {
        let relative = self.relative_path(metadata)?;
        let full_path = self.base_path.join(&relative);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MiaError::Storage(format!("创建存储目录失败: {}", e)))?;
        }

        tokio::fs::write(&full_path, data)
            .await
            .map_err(|e| MiaError::Storage(format!("写入载荷失败 {:?}: {}", full_path, e)))?;

        let digest = format!("{:x}", Sha256::digest(data));
        debug!("载荷已存储: {:?} ({} 字节)", full_path, data.len());

        Ok(StoredBlob {
            storage_path: relative.to_string_lossy().to_string(),
            file_size: data.len() as i64,
            content_digest: digest,
        })
    }

    /// 读取一个已存储的载荷
    pub async fn get_file(&self, storage_path: &str) -> Result<Vec<u8>> {
        let full_path = self.base_path.join(storage_path);
        let data = tokio::fs::read(&full_path)
            .await
            .map_err(|e| MiaError::Storage(format!("读取载荷失败 {:?}: {}", full_path, e)))?;
        Ok(data)
    }

    /// 根据归组标识生成层次化相对路径
    fn relative_path(&self, metadata: &ImageMetadata) -> Result<PathBuf> {
        let study = metadata
            .study_uid
            .as_deref()
            .ok_or_else(|| MiaError::Storage("缺少检查UID，无法寻址".to_string()))?;
        let series = metadata
            .series_uid
            .as_deref()
            .ok_or_else(|| MiaError::Storage("缺少序列UID，无法寻址".to_string()))?;
        let instance = metadata
            .sop_instance_uid
            .as_deref()
            .ok_or_else(|| MiaError::Storage("缺少SOP实例UID，无法寻址".to_string()))?;

        Ok(Path::new(&sanitize(study))
            .join(sanitize(series))
            .join(format!("{}.dcm", sanitize(instance))))
    }
}

/// UID理论上只含数字和点，对异常字符做路径安全替换
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(study: &str, series: &str, sop: &str) -> ImageMetadata {
        ImageMetadata {
            study_uid: Some(study.to_string()),
            series_uid: Some(series.to_string()),
            sop_instance_uid: Some(sop.to_string()),
            ..Default::default()
        }
    }

    fn temp_storage(name: &str) -> BlobStorage {
        let dir = std::env::temp_dir().join("mia-storage-tests").join(name);
        BlobStorage::new(dir)
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let storage = temp_storage("roundtrip");
        let meta = metadata("1.2.3", "1.2.3.4", "1.2.3.4.5");

        let blob = storage.store_image(&meta, b"payload-bytes").await.unwrap();
        assert_eq!(blob.file_size, 13);
        assert_eq!(blob.storage_path, "1.2.3/1.2.3.4/1.2.3.4.5.dcm");
        assert_eq!(blob.content_digest.len(), 64);

        let data = storage.get_file(&blob.storage_path).await.unwrap();
        assert_eq!(data, b"payload-bytes");
    }

    #[tokio::test]
    async fn test_same_instance_overwrites_same_path() {
        let storage = temp_storage("overwrite");
        let meta = metadata("1.2.3", "1.2.3.4", "1.2.3.4.6");

        let first = storage.store_image(&meta, b"v1").await.unwrap();
        let second = storage.store_image(&meta, b"v2").await.unwrap();
        assert_eq!(first.storage_path, second.storage_path);

        let data = storage.get_file(&second.storage_path).await.unwrap();
        assert_eq!(data, b"v2");
    }

    #[tokio::test]
    async fn test_missing_identifiers_rejected() {
        let storage = temp_storage("missing");
        let meta = ImageMetadata::default();

        let err = storage.store_image(&meta, b"x").await.unwrap_err();
        assert!(matches!(err, MiaError::Storage(_)));
    }

    #[test]
    fn test_sanitize_path_components() {
        assert_eq!(sanitize("1.2.840"), "1.2.840");
        assert_eq!(sanitize("../escape"), ".._escape");
    }
}
