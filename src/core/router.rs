//! 处理器注册与路由
//!
//! 所有执行能力实现 Handler trait（descriptor / execute），由 HandlerRegistry 按注册顺序存储，
//! Router 按能力标签给每个处理器打分：得分为任务所需标签被覆盖的比例，最高者胜出，
//! 平手取注册顺序靠前者；没有处理器达到阈值时返回 UnroutableTask——路由器从不猜测。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::context::ContextSnapshot;
use crate::core::error::{HandlerError, OrchestratorError};
use crate::core::task::{Capability, Task, TaskResult};

/// 相对成本等级（诊断元数据，不参与路由打分）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostClass {
    Low,
    Medium,
    High,
}

/// 相对速度等级（诊断元数据，不参与路由打分）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Fast,
    Moderate,
    Slow,
}

/// 处理器自述：名称、能力标签、成本/速度等级
///
/// description 仅作诊断展示，路由只比较 capability_tags。
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub name: String,
    pub capability_tags: Vec<Capability>,
    pub cost_class: CostClass,
    pub speed_class: SpeedClass,
    pub description: String,
}

impl HandlerDescriptor {
    pub fn new(name: impl Into<String>, capability_tags: Vec<Capability>) -> Self {
        Self {
            name: name.into(),
            capability_tags,
            cost_class: CostClass::Medium,
            speed_class: SpeedClass::Moderate,
            description: String::new(),
        }
    }

    pub fn with_cost(mut self, cost: CostClass) -> Self {
        self.cost_class = cost;
        self
    }

    pub fn with_speed(mut self, speed: SpeedClass) -> Self {
        self.speed_class = speed;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 执行能力契约：执行一个任务，返回结果或带类别的错误
///
/// deadline 是监督循环同时在外层施加的截止时间，处理器可据此提前让步。
#[async_trait]
pub trait Handler: Send + Sync {
    fn descriptor(&self) -> HandlerDescriptor;

    async fn execute(
        &self,
        task: &Task,
        context: ContextSnapshot,
        deadline: Duration,
    ) -> Result<TaskResult, HandlerError>;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.descriptor().name)
            .finish()
    }
}

/// 处理器注册表：保持注册顺序（路由平手时的决胜依据）
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl Handler + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// 按名称查找（升级链按 handler_id 定位）
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|h| h.descriptor().name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter()
    }
}

/// 能力路由器
pub struct Router {
    min_match_threshold: f64,
}

impl Router {
    pub fn new(min_match_threshold: f64) -> Self {
        Self {
            min_match_threshold,
        }
    }

    /// 任务所需标签被 descriptor 覆盖的比例；无要求时任何处理器都是 1.0
    fn score(descriptor: &HandlerDescriptor, required: &[Capability]) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = required
            .iter()
            .filter(|cap| descriptor.capability_tags.contains(cap))
            .count();
        matched as f64 / required.len() as f64
    }

    /// 选出得分最高的处理器；全部低于阈值时返回 UnroutableTask
    pub fn route(
        &self,
        task: &Task,
        registry: &HandlerRegistry,
    ) -> Result<Arc<dyn Handler>, OrchestratorError> {
        let mut best: Option<(f64, Arc<dyn Handler>)> = None;
        for handler in registry.iter() {
            let descriptor = handler.descriptor();
            let score = Self::score(&descriptor, &task.required_capabilities);
            if score < self.min_match_threshold {
                continue;
            }
            // 严格大于才替换：平手保留注册顺序靠前者
            let better = match &best {
                Some((best_score, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((score, handler.clone()));
            }
        }
        match best {
            Some((score, handler)) => {
                let descriptor = handler.descriptor();
                tracing::debug!(
                    task_id = %task.id,
                    handler = %descriptor.name,
                    score,
                    cost = ?descriptor.cost_class,
                    speed = ?descriptor.speed_class,
                    "task routed"
                );
                Ok(handler)
            }
            None => Err(OrchestratorError::UnroutableTask {
                task_id: task.id.clone(),
                required: task.required_capabilities.clone(),
            }),
        }
    }
}
