//! 通道式人工处理器
//!
//! 人工裁决能力的进程内适配：execute 阻塞等待回复通道上的下一条 HumanReply，
//! 升级网关的逐级超时在外层生效。发送端交给接入方（TUI、Web、聊天集成等）。

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::core::context::ContextSnapshot;
use crate::core::error::HandlerError;
use crate::core::router::{CostClass, Handler, HandlerDescriptor, SpeedClass};
use crate::core::task::{Capability, Task, TaskResult};

/// 人工回复
#[derive(Debug, Clone)]
pub struct HumanReply {
    pub summary: String,
    pub approved: Option<bool>,
}

impl HumanReply {
    pub fn approve(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            approved: Some(true),
        }
    }

    pub fn reject(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            approved: Some(false),
        }
    }
}

/// 等待 mpsc 通道回复的人工裁决处理器
pub struct ChannelHumanHandler {
    name: String,
    replies: Mutex<mpsc::UnboundedReceiver<HumanReply>>,
}

impl ChannelHumanHandler {
    /// 返回处理器与回复发送端
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedSender<HumanReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                replies: Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl Handler for ChannelHumanHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new(self.name.clone(), vec![Capability::HumanJudgment])
            .with_cost(CostClass::High)
            .with_speed(SpeedClass::Slow)
            .with_description("Human judgment backed by an in-process reply channel")
    }

    async fn execute(
        &self,
        task: &Task,
        _context: ContextSnapshot,
        _deadline: Duration,
    ) -> Result<TaskResult, HandlerError> {
        let mut replies = self.replies.lock().await;
        match replies.recv().await {
            Some(reply) => {
                tracing::info!(task_id = %task.id, approved = ?reply.approved, "human reply received");
                let mut result = TaskResult::new(reply.summary);
                result.approved = reply.approved;
                Ok(result)
            }
            None => Err(HandlerError::permanent("human reply channel closed")),
        }
    }
}
