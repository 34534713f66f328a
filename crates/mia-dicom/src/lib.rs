//! # MIA DICOM
//!
//! 文件候选校验与元数据提取：以廉价启发式筛选可摄取文件，
//! 按命名策略顺序解析DICOM头并提取归组标识。

pub mod extractor;
pub mod validator;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use extractor::{Extraction, ExtractionStrategy, MetadataExtractor};
pub use validator::FileValidator;
