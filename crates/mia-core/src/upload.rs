//! 上传会话模型
//!
//! 管理一次批量上传的完整生命周期状态转换与进度计数

use crate::{MiaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 上传会话状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,     // 已接受，等待处理
    Processing, // 工作者处理中
    Completed,  // 正常结束（允许包含失败文件）
    Failed,     // 整批中止
}

impl UploadStatus {
    /// 终态会话不再被写入
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// 上传状态转换事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UploadEvent {
    Started,
    Finished,
    Aborted,
}

/// 上传状态机
#[derive(Debug)]
pub struct UploadStateMachine {
    transitions: HashMap<(UploadStatus, UploadEvent), UploadStatus>,
}

impl UploadStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((UploadStatus::Queued, UploadEvent::Started), UploadStatus::Processing);
        transitions.insert((UploadStatus::Processing, UploadEvent::Finished), UploadStatus::Completed);
        transitions.insert((UploadStatus::Queued, UploadEvent::Aborted), UploadStatus::Failed);
        transitions.insert((UploadStatus::Processing, UploadEvent::Aborted), UploadStatus::Failed);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: &UploadStatus, event: &UploadEvent) -> bool {
        self.transitions.contains_key(&(from.clone(), event.clone()))
    }

    /// 执行状态转换
    pub fn transition(&self, from: &UploadStatus, event: &UploadEvent) -> Result<UploadStatus> {
        match self.transitions.get(&(from.clone(), event.clone())) {
            Some(to) => Ok(to.clone()),
            None => Err(MiaError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }
}

impl Default for UploadStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个文件的处理结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    Skipped,
}

/// 文件处理结果记录，每个输入文件恰好产生一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub filename: String,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileOutcome {
    pub fn succeeded(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            outcome: OutcomeKind::Succeeded,
            reason: None,
        }
    }

    pub fn failed(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            outcome: OutcomeKind::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn skipped(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            outcome: OutcomeKind::Skipped,
            reason: Some(reason.into()),
        }
    }
}

/// 上传会话快照
///
/// 单写多读：只有执行该批次的工作者修改会话，轮询端只读克隆。
/// 进入终态后不再变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub status: UploadStatus,
    pub total_files: usize,
    pub processed_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub current_study_label: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// 按提交顺序追加的逐文件结果
    pub outcomes: Vec<FileOutcome>,
    /// 本次上传触及的检查UID（去重，按首次出现排序）
    pub study_uids: Vec<String>,
    /// 本次上传新建的检查数
    pub new_studies: usize,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// 创建处于排队状态的新会话
    pub fn new(total_files: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: UploadStatus::Queued,
            total_files,
            processed_files: 0,
            successful_files: 0,
            failed_files: 0,
            current_study_label: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            outcomes: Vec::new(),
            study_uids: Vec::new(),
            new_studies: 0,
            created_at: Utc::now(),
        }
    }

    /// 应用状态转换事件
    pub fn apply_event(&mut self, event: &UploadEvent) -> Result<()> {
        let machine = UploadStateMachine::new();
        self.status = machine.transition(&self.status, event)?;
        Ok(())
    }

    /// 追加一个文件结果并维护计数
    ///
    /// 不变量：processed <= total 且单调递增；
    /// successful + failed == processed（skipped不计入processed）。
    pub fn record_outcome(&mut self, outcome: FileOutcome) {
        match outcome.outcome {
            OutcomeKind::Succeeded => {
                self.successful_files += 1;
                self.processed_files += 1;
            }
            OutcomeKind::Failed => {
                self.failed_files += 1;
                self.processed_files += 1;
            }
            OutcomeKind::Skipped => {}
        }
        debug_assert!(self.processed_files <= self.total_files);
        debug_assert_eq!(self.successful_files + self.failed_files, self.processed_files);
        self.outcomes.push(outcome);
    }

    /// 记录触及的检查UID
    pub fn record_study(&mut self, study_uid: &str, newly_created: bool) {
        if newly_created {
            self.new_studies += 1;
        }
        if !self.study_uids.iter().any(|uid| uid == study_uid) {
            self.study_uids.push(study_uid.to_string());
        }
    }

    /// 成功文件名列表
    pub fn successful_filenames(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Succeeded)
            .map(|o| o.filename.clone())
            .collect()
    }

    /// 失败文件及原因列表
    pub fn failed_entries(&self) -> Vec<&FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Failed)
            .collect()
    }
}
