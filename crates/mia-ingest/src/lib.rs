//! # MIA摄取模块
//!
//! 批量摄取流水线：分块批处理器、上传会话管理器与进度存储。
//! 一次上传的文件经 校验 → 提取 → 落盘 → 持久化 逐个处理，
//! 峰值内存以块大小为界，单文件失败不中断整批。

pub mod config;
pub mod files;
pub mod processor;
pub mod progress;
pub mod session;

pub use config::IngestConfig;
pub use files::{collect_directory, IncomingFile};
pub use processor::{BatchProcessor, BatchReport, ChunkDelta};
pub use progress::ProgressStore;
pub use session::{SubmitOutcome, UploadSessionManager};
