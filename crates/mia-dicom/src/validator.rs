//! 文件候选校验模块
//!
//! 用廉价启发式（扩展名、大小、可选的头部魔数）判断文件是否值得
//! 完整解析。策略是宽容的：宁可多解析一次，也不丢弃可用影像。

use mia_core::{MiaError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// DICOM文件前导区长度（128字节前导 + "DICM"魔数）
pub const DICOM_PREAMBLE_LEN: usize = 132;

/// 可识别的影像文件扩展名
const KNOWN_EXTENSIONS: [&str; 5] = ["dcm", "dicom", "dcm30", "ima", "img"];

/// 文件候选校验器
#[derive(Debug, Clone)]
pub struct FileValidator {
    /// 最小候选大小，低于此值视为占位/空文件
    min_file_size: u64,
    /// 单文件大小上限
    max_file_size: u64,
}

impl Default for FileValidator {
    fn default() -> Self {
        Self::new(DICOM_PREAMBLE_LEN as u64, 2 * 1024 * 1024 * 1024)
    }
}

impl FileValidator {
    /// 创建新的候选校验器
    pub fn new(min_file_size: u64, max_file_size: u64) -> Self {
        Self {
            min_file_size,
            max_file_size,
        }
    }

    /// 判断一个文件是否为可摄取候选
    ///
    /// 无副作用，不破坏性消费文件内容；拒绝时返回`InvalidCandidate`。
    pub fn classify(&self, path: &Path, original_name: &str, size: u64) -> Result<()> {
        if size == 0 {
            return Err(MiaError::InvalidCandidate(format!(
                "空文件: {}",
                original_name
            )));
        }
        if size < self.min_file_size {
            return Err(MiaError::InvalidCandidate(format!(
                "文件过小 ({} 字节 < {} 字节): {}",
                size, self.min_file_size, original_name
            )));
        }
        if size > self.max_file_size {
            return Err(MiaError::InvalidCandidate(format!(
                "文件超过大小上限 ({} 字节 > {} 字节): {}",
                size, self.max_file_size, original_name
            )));
        }

        match extension_of(original_name) {
            Extension::Known(ext) => {
                debug!("按扩展名接受候选文件: {} ({})", original_name, ext);
                Ok(())
            }
            Extension::None => {
                debug!("接受无扩展名候选文件: {}", original_name);
                Ok(())
            }
            Extension::Unknown(_) => {
                // 未知扩展名：先探测头部魔数，否则按大小兜底接受
                if Self::has_dicom_signature(path) {
                    debug!("按DICM魔数接受候选文件: {}", original_name);
                } else {
                    debug!("按大小兜底接受候选文件: {}", original_name);
                }
                Ok(())
            }
        }
    }

    /// 非破坏性探测文件头部是否带有DICM魔数
    ///
    /// 只读取前132字节；读取失败一律视为无魔数，留给后续策略处理。
    pub fn has_dicom_signature(path: &Path) -> bool {
        let mut header = [0u8; DICOM_PREAMBLE_LEN];
        match File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
            Ok(()) => &header[128..DICOM_PREAMBLE_LEN] == b"DICM",
            Err(_) => false,
        }
    }
}

/// 扩展名分类结果
enum Extension {
    Known(String),
    Unknown(String),
    None,
}

/// 提取小写扩展名，压缩变体（.gz）剥壳后再判断
fn extension_of(name: &str) -> Extension {
    let lower = name.to_ascii_lowercase();
    let base = lower.strip_suffix(".gz").unwrap_or(&lower);

    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            if KNOWN_EXTENSIONS.contains(&ext) {
                Extension::Known(ext.to_string())
            } else {
                Extension::Unknown(ext.to_string())
            }
        }
        _ => Extension::None,
    }
}
