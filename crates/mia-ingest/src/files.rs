//! 待摄取文件的描述与收集

use mia_core::{MiaError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 一个待摄取的候选文件
///
/// 载荷已落在磁盘上（上传暂存目录或外部生产者的投递目录），
/// 流水线按需读取，不在提交时整体载入内存。
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// 对用户呈现的文件名（多级目录摄取时为相对路径）
    pub original_name: String,
    /// 磁盘上的实际位置
    pub path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
}

impl IncomingFile {
    /// 从磁盘路径构建
    pub fn from_path(path: PathBuf, original_name: impl Into<String>) -> Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        Ok(Self {
            original_name: original_name.into(),
            path,
            size,
        })
    }
}

/// 递归收集一个目录树下的全部文件
///
/// 结果按相对路径排序，保证同一目录树的多次摄取顺序一致。
pub fn collect_directory(root: &Path) -> Result<Vec<IncomingFile>> {
    if !root.is_dir() {
        return Err(MiaError::Validation(format!("不是目录: {:?}", root)));
    }

    let mut files = Vec::new();
    visit(root, root, &mut files)?;
    files.sort_by(|a, b| a.original_name.cmp(&b.original_name));

    debug!("目录收集完成: {:?} 共 {} 个文件", root, files.len());
    Ok(files)
}

fn visit(root: &Path, dir: &Path, out: &mut Vec<IncomingFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            visit(root, &path, out)?;
        } else if file_type.is_file() {
            let original_name = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let size = entry.metadata()?.len();
            out.push(IncomingFile {
                original_name,
                path,
                size,
            });
        }
    }
    Ok(())
}
