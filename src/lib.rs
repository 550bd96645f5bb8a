//! Swarm - Rust 自适应任务编排引擎
//!
//! 模块划分：
//! - **config**: 运行配置加载（TOML + 环境变量）
//! - **core**: 编排核心（任务与边界集、策略选择、处理器路由、收敛判定、循环检测、共享上下文、执行图、人工升级、监督循环）
//! - **handlers**: 内置执行能力（echo、脚本化、通道式人工处理）
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod handlers;
pub mod observability;

pub use crate::config::{load_config, RunConfig};
pub use crate::core::{
    submit, Capability, ChildSpec, ExecutionGraph, Handler, HandlerDescriptor, HandlerError,
    HandlerRegistry, RunBuilder, RunHandle, RunReport, RunStatus, Strategy, Task, TaskResult,
    TerminationReason,
};
