//! 人工升级网关
//!
//! 包装人工裁决类处理器：每级有自己的超时，超时即推进到下一级，走完整条链仍无响应
//! 则返回 EscalationExhausted。升级期间占用一个并发槽位，但不会阻塞其他在途任务
//! （网关在派发 future 内部运行）。

use tokio::time::timeout;

use crate::config::EscalationTier;
use crate::core::context::ContextSnapshot;
use crate::core::error::OrchestratorError;
use crate::core::router::HandlerRegistry;
use crate::core::task::{Task, TaskResult};

/// 单级升级的状态（审计日志用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// 等待本级响应
    Awaiting,
    /// 本级已响应
    Responded,
    /// 本级超时
    TimedOut,
}

/// 按序走升级链的网关
pub struct HumanEscalationGateway {
    chain: Vec<EscalationTier>,
}

impl HumanEscalationGateway {
    pub fn new(chain: Vec<EscalationTier>) -> Self {
        Self { chain }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// 将任务交给升级链：逐级等待，超时推进一级
    pub async fn escalate(
        &self,
        task: &Task,
        registry: &HandlerRegistry,
        snapshot: ContextSnapshot,
    ) -> Result<TaskResult, OrchestratorError> {
        for (tier_index, tier) in self.chain.iter().enumerate() {
            let handler = match registry.get(&tier.handler_id) {
                Some(h) => h,
                None => {
                    tracing::warn!(
                        task_id = %task.id,
                        tier = tier_index,
                        handler_id = %tier.handler_id,
                        "escalation tier references unknown handler, advancing"
                    );
                    continue;
                }
            };

            tracing::info!(
                task_id = %task.id,
                tier = tier_index,
                handler_id = %tier.handler_id,
                timeout_secs = tier.timeout_secs,
                state = ?EscalationState::Awaiting,
                "escalation tier engaged"
            );

            match timeout(
                tier.timeout(),
                handler.execute(task, snapshot.clone(), tier.timeout()),
            )
            .await
            {
                Ok(Ok(result)) => {
                    tracing::info!(
                        task_id = %task.id,
                        tier = tier_index,
                        state = ?EscalationState::Responded,
                        "escalation tier responded"
                    );
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        task_id = %task.id,
                        tier = tier_index,
                        error = %e,
                        "escalation tier failed, advancing"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        task_id = %task.id,
                        tier = tier_index,
                        state = ?EscalationState::TimedOut,
                        "escalation tier timed out, advancing"
                    );
                }
            }
        }

        Err(OrchestratorError::EscalationExhausted {
            task_id: task.id.clone(),
            tiers_attempted: self.chain.len(),
        })
    }
}
