//! Echo 处理器（测试用）

use std::time::Duration;

use async_trait::async_trait;

use crate::core::context::ContextSnapshot;
use crate::core::error::HandlerError;
use crate::core::router::{CostClass, Handler, HandlerDescriptor, SpeedClass};
use crate::core::task::{Capability, Task, TaskResult};

/// Echo 处理器：回显任务描述，不分解子任务
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new("echo", vec![Capability::DeterministicExecute])
            .with_cost(CostClass::Low)
            .with_speed(SpeedClass::Fast)
            .with_description("Echo the task description (for testing)")
    }

    async fn execute(
        &self,
        task: &Task,
        _context: ContextSnapshot,
        _deadline: Duration,
    ) -> Result<TaskResult, HandlerError> {
        Ok(TaskResult::new(task.description.clone()).with_artifact(task.description.clone()))
    }
}
