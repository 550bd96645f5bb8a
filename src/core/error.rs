//! 编排错误类型
//!
//! 与监督循环配合：HandlerError 按 retryable 决定重试；UnroutableTask / LoopDetected 永不自动重试，
//! 进入终局报告；ConvergenceForced 标记被强制终止打断的在途任务。

use thiserror::Error;

use crate::core::task::{Capability, TaskId};

/// 处理器错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// 瞬态错误（网络抖动、超时、限流），按策略重试
    Transient,
    /// 永久错误（输入非法、能力不足），不重试
    Permanent,
}

/// 处理器执行失败：类别 + 是否可重试 + 描述
#[derive(Debug, Clone, Error)]
#[error("handler failed ({kind:?}, retryable={retryable}): {message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl HandlerError {
    /// 瞬态错误，默认可重试
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Transient,
            retryable: true,
            message: message.into(),
        }
    }

    /// 永久错误，不可重试
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Permanent,
            retryable: false,
            message: message.into(),
        }
    }

    /// 覆盖 retryable 标记（如瞬态但明确不值得重试的场景）
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// 编排运行过程中可能出现的错误
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// 没有处理器达到匹配阈值；路由器从不猜测
    #[error("no handler clears match threshold for task {task_id} (required: {required:?})")]
    UnroutableTask {
        task_id: TaskId,
        required: Vec<Capability>,
    },

    /// 同一签名的子任务重复出现超过上限
    #[error("loop detected: signature '{signature}' pushed {count} times (limit {limit})")]
    LoopDetected {
        signature: String,
        count: u32,
        limit: u32,
    },

    /// 运行被收敛管理器强制终止，该任务未能完成
    #[error("run forcibly terminated before task {task_id} finished: {reason}")]
    ConvergenceForced { task_id: TaskId, reason: String },

    /// 升级链走完仍无响应
    #[error("escalation chain exhausted after {tiers_attempted} tiers for task {task_id}")]
    EscalationExhausted {
        task_id: TaskId,
        tiers_attempted: usize,
    },

    /// 边界集已空
    #[error("frontier is empty")]
    EmptyFrontier,
}
