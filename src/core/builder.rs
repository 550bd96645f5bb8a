//! 运行构建器：统一的提交入口
//!
//! 一次运行的全部可变状态（边界集、共享上下文、执行图、循环检测表）都在 submit 时创建并
//! 由该运行的监督任务独占，多个运行可完全独立并行，互不污染。

use std::sync::Arc;

use crate::config::RunConfig;
use crate::core::graph::GraphExporter;
use crate::core::router::HandlerRegistry;
use crate::core::supervisor::{Rescorer, RunHandle, Supervisor};
use crate::core::task::ChildSpec;

/// 运行构建器：配置 + 处理器注册表 + 可选钩子
pub struct RunBuilder {
    config: RunConfig,
    registry: HandlerRegistry,
    rescorer: Option<Arc<dyn Rescorer>>,
    exporter: Option<Arc<dyn GraphExporter>>,
}

impl RunBuilder {
    pub fn new(config: RunConfig, registry: HandlerRegistry) -> Self {
        Self {
            config,
            registry,
            rescorer: None,
            exporter: None,
        }
    }

    /// 可选：每次集成后刷新边界集得分
    pub fn with_rescorer(mut self, rescorer: impl Rescorer + 'static) -> Self {
        self.rescorer = Some(Arc::new(rescorer));
        self
    }

    /// 可选：运行结束时导出执行图
    pub fn with_exporter(mut self, exporter: impl GraphExporter + 'static) -> Self {
        self.exporter = Some(Arc::new(exporter));
        self
    }

    /// 提交初始任务，启动监督循环
    pub fn submit(self, initial: ChildSpec) -> RunHandle {
        Supervisor::new(
            self.config,
            self.registry,
            initial,
            self.rescorer,
            self.exporter,
        )
        .spawn()
    }
}

/// 便捷函数：无钩子直接提交
pub fn submit(initial: ChildSpec, config: RunConfig, registry: HandlerRegistry) -> RunHandle {
    RunBuilder::new(config, registry).submit(initial)
}
