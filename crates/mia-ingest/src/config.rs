//! 摄取配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 摄取流水线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// 每块处理的文件数，决定峰值内存上界
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 同步/后台执行的文件数分界
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: usize,
    /// 终态会话在进度存储中保留的秒数
    #[serde(default = "default_progress_retention_secs")]
    pub progress_retention_secs: u64,
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 候选文件最小大小（字节），低于此值视为占位文件
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
}

fn default_chunk_size() -> usize {
    50
}

fn default_sync_threshold() -> usize {
    100
}

fn default_progress_retention_secs() -> u64 {
    3600
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_min_file_size() -> u64 {
    132
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            sync_threshold: default_sync_threshold(),
            progress_retention_secs: default_progress_retention_secs(),
            max_file_size: default_max_file_size(),
            min_file_size: default_min_file_size(),
        }
    }
}

impl IngestConfig {
    /// 终态会话保留时长
    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }
}
