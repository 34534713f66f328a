//! 错误定义模块

use thiserror::Error;

/// MIA系统统一错误类型
#[derive(Error, Debug)]
pub enum MiaError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM解析错误: {0}")]
    DicomParse(String),

    #[error("非候选文件: {0}")]
    InvalidCandidate(String),

    #[error("文件不可读: {0}")]
    Unreadable(String),

    #[error("缺少必要标识符: {0}")]
    MissingIdentifiers(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("重复冲突: {0}")]
    DuplicateConflict(String),

    #[error("完整性错误: {0}")]
    Integrity(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl MiaError {
    /// 返回文件级失败的标准原因码（kebab-case，用于FileOutcome.reason）
    pub fn reason_code(&self) -> &'static str {
        match self {
            MiaError::InvalidCandidate(_) => "invalid-candidate",
            MiaError::Unreadable(_) => "unreadable",
            MiaError::MissingIdentifiers(_) => "missing-identifiers",
            MiaError::Storage(_) => "storage-error",
            MiaError::DuplicateConflict(_) => "duplicate-conflict",
            MiaError::Integrity(_) => "integrity-error",
            MiaError::Database(_) => "database-error",
            _ => "internal-error",
        }
    }

    /// 会话级错误会中止整个批次，文件级错误只记录单个文件的结果
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, MiaError::Database(_) | MiaError::Internal(_))
    }
}

/// MIA系统统一结果类型
pub type Result<T> = std::result::Result<T, MiaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            MiaError::InvalidCandidate("x".into()).reason_code(),
            "invalid-candidate"
        );
        assert_eq!(MiaError::Unreadable("x".into()).reason_code(), "unreadable");
        assert_eq!(
            MiaError::DuplicateConflict("x".into()).reason_code(),
            "duplicate-conflict"
        );
    }

    #[test]
    fn test_session_fatal() {
        assert!(MiaError::Database("连接中断".into()).is_session_fatal());
        assert!(!MiaError::Unreadable("坏文件".into()).is_session_fatal());
        assert!(!MiaError::Storage("写入失败".into()).is_session_fatal());
    }
}
