//! 进度存储
//!
//! 以上传ID为键保存最新的会话快照：每个上传一个写者（工作者），
//! 任意多个读者（轮询端）。外层锁只在查找条目时短暂持有，
//! 修改走每键独立的锁，互不相关的上传不会相互争用。

use mia_core::{MiaError, Result, UploadSession};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

struct SessionEntry {
    session: UploadSession,
    /// 进入终态的时刻，驱动保留期过期
    terminal_at: Option<Instant>,
}

/// 上传进度存储
pub struct ProgressStore {
    entries: RwLock<HashMap<Uuid, Arc<RwLock<SessionEntry>>>>,
    retention: Duration,
}

impl ProgressStore {
    /// 创建进度存储，终态条目超过保留期后过期
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// 登记一个新会话
    pub fn insert(&self, session: UploadSession) {
        let id = session.id;
        let entry = Arc::new(RwLock::new(SessionEntry {
            session,
            terminal_at: None,
        }));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
    }

    /// 由工作者修改会话
    ///
    /// 终态会话不可再修改；进入终态的时刻在此记录。
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut UploadSession)) -> Result<()> {
        let entry = self.lookup(id)?;
        let mut guard = entry.write().unwrap_or_else(PoisonError::into_inner);

        if guard.session.status.is_terminal() {
            return Err(MiaError::Validation(format!("上传 {} 已处于终态", id)));
        }

        f(&mut guard.session);

        if guard.session.status.is_terminal() && guard.terminal_at.is_none() {
            guard.terminal_at = Some(Instant::now());
        }
        Ok(())
    }

    /// 读取最近一次提交的会话快照
    ///
    /// 未知ID或已过保留期的条目返回`NotFound`（过期条目顺带移除）。
    pub fn snapshot(&self, id: Uuid) -> Result<UploadSession> {
        let entry = self.lookup(id)?;
        let guard = entry.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(terminal_at) = guard.terminal_at {
            if terminal_at.elapsed() > self.retention {
                drop(guard);
                self.remove(id);
                return Err(MiaError::NotFound(format!("未知的上传ID: {}", id)));
            }
        }
        Ok(guard.session.clone())
    }

    /// 清除所有过期的终态条目，返回清除数量
    pub fn sweep(&self) -> usize {
        let expired: Vec<Uuid> = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|(_, entry)| {
                    let guard = entry.read().unwrap_or_else(PoisonError::into_inner);
                    guard
                        .terminal_at
                        .map(|t| t.elapsed() > self.retention)
                        .unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let removed = expired.len();
        if removed > 0 {
            debug!("清除 {} 个过期的上传会话", removed);
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in expired {
                entries.remove(&id);
            }
        }
        removed
    }

    /// 当前持有的条目数
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: Uuid) -> Result<Arc<RwLock<SessionEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| MiaError::NotFound(format!("未知的上传ID: {}", id)))
    }

    fn remove(&self, id: Uuid) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
