//! 共享上下文存储
//!
//! 跨任务知识日志：仅监督循环在结果集成后追加；处理器执行前拿到（可能裁剪过的）快照。
//! 每个完成任务至多追加一条，增长线性；裁剪策略可插拔，不容忍无界增长。

use std::sync::Arc;

use serde::Serialize;

use crate::core::task::TaskId;

/// 上下文条目：哪个任务产出了什么
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub task_id: TaskId,
    pub summary: String,
    /// 记录时间（毫秒时间戳）
    pub recorded_at: i64,
}

/// 处理器看到的快照
pub type ContextSnapshot = Arc<Vec<ContextEntry>>;

/// 裁剪策略：从完整日志生成快照用的视图
pub trait ContextPruner: Send + Sync {
    fn prune(&self, entries: &[ContextEntry]) -> Vec<ContextEntry>;

    /// 策略名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 不裁剪：快照即全量日志
#[derive(Debug, Default)]
pub struct KeepAllPruner;

impl ContextPruner for KeepAllPruner {
    fn prune(&self, entries: &[ContextEntry]) -> Vec<ContextEntry> {
        entries.to_vec()
    }

    fn name(&self) -> &'static str {
        "keep_all"
    }
}

/// 保留最近 K 条，更早的条目折叠为一条压缩摘要
#[derive(Debug)]
pub struct RecentWindowPruner {
    keep_last: usize,
}

impl RecentWindowPruner {
    pub fn new(keep_last: usize) -> Self {
        Self {
            keep_last: keep_last.max(1),
        }
    }
}

impl ContextPruner for RecentWindowPruner {
    fn prune(&self, entries: &[ContextEntry]) -> Vec<ContextEntry> {
        if entries.len() <= self.keep_last {
            return entries.to_vec();
        }
        let elided = entries.len() - self.keep_last;
        let mut pruned = Vec::with_capacity(self.keep_last + 1);
        pruned.push(ContextEntry {
            task_id: "compacted".to_string(),
            summary: format!("[{} earlier entries compacted]", elided),
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
        pruned.extend_from_slice(&entries[elided..]);
        pruned
    }

    fn name(&self) -> &'static str {
        "recent_window"
    }
}

/// 追加式共享上下文
pub struct SharedContext {
    entries: Vec<ContextEntry>,
    pruner: Box<dyn ContextPruner>,
}

impl SharedContext {
    pub fn new(pruner: Box<dyn ContextPruner>) -> Self {
        tracing::debug!(pruner = pruner.name(), "shared context created");
        Self {
            entries: Vec::new(),
            pruner,
        }
    }

    /// 按配置选择裁剪策略：keep_last 为 None 时不裁剪
    pub fn from_config(keep_last: Option<usize>) -> Self {
        match keep_last {
            Some(k) => Self::new(Box::new(RecentWindowPruner::new(k))),
            None => Self::new(Box::new(KeepAllPruner)),
        }
    }

    /// 追加一条（仅监督循环调用）
    pub fn append(&mut self, task_id: &str, summary: impl Into<String>) {
        self.entries.push(ContextEntry {
            task_id: task_id.to_string(),
            summary: summary.into(),
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    /// 生成处理器可读的快照
    pub fn snapshot(&self) -> ContextSnapshot {
        Arc::new(self.pruner.prune(&self.entries))
    }

    /// 日志总条数（未裁剪）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
