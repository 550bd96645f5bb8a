//! 脚本化处理器（无需外部服务即可跑通编排流程）
//!
//! 行为由调用方传入的脚本函数决定：返回结果、分解子任务或注入失败；
//! 可选 delay 模拟模型调用/网络延迟。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::context::ContextSnapshot;
use crate::core::error::HandlerError;
use crate::core::router::{CostClass, Handler, HandlerDescriptor, SpeedClass};
use crate::core::task::{Capability, Task, TaskResult};

type ScriptFn = dyn Fn(&Task) -> Result<TaskResult, HandlerError> + Send + Sync;

/// 脚本化处理器：能力标签与行为都由调用方配置
pub struct ScriptedHandler {
    name: String,
    tags: Vec<Capability>,
    cost_class: CostClass,
    speed_class: SpeedClass,
    delay: Option<Duration>,
    script: Box<ScriptFn>,
}

impl ScriptedHandler {
    pub fn new(
        name: impl Into<String>,
        tags: Vec<Capability>,
        script: impl Fn(&Task) -> Result<TaskResult, HandlerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            cost_class: CostClass::Low,
            speed_class: SpeedClass::Fast,
            delay: None,
            script: Box::new(script),
        }
    }

    /// 模拟执行耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_cost(mut self, cost: CostClass) -> Self {
        self.cost_class = cost;
        self
    }

    pub fn with_speed(mut self, speed: SpeedClass) -> Self {
        self.speed_class = speed;
        self
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new(self.name.clone(), self.tags.clone())
            .with_cost(self.cost_class)
            .with_speed(self.speed_class)
            .with_description("Scripted handler driven by a caller-supplied function")
    }

    async fn execute(
        &self,
        task: &Task,
        _context: ContextSnapshot,
        _deadline: Duration,
    ) -> Result<TaskResult, HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(task)
    }
}
