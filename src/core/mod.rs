//! 编排核心：任务与边界集、策略选择、处理器路由、收敛判定、循环检测、共享上下文、执行图、人工升级、监督循环

pub mod builder;
pub mod context;
pub mod convergence;
pub mod error;
pub mod escalation;
pub mod frontier;
pub mod graph;
pub mod loop_detector;
pub mod router;
pub mod supervisor;
pub mod task;

pub use builder::{submit, RunBuilder};
pub use context::{ContextEntry, ContextPruner, ContextSnapshot, SharedContext};
pub use convergence::{
    ConvergenceManager, ConvergenceState, ResourceBound, RunStatus, TerminationReason, Verdict,
};
pub use error::{HandlerError, HandlerErrorKind, OrchestratorError};
pub use escalation::{EscalationState, HumanEscalationGateway};
pub use frontier::{Frontier, PushOutcome, Strategy};
pub use graph::{ExecutionGraph, GraphExporter, GraphNode};
pub use loop_detector::LoopDetector;
pub use router::{CostClass, Handler, HandlerDescriptor, HandlerRegistry, Router, SpeedClass};
pub use supervisor::{Rescorer, RunCounters, RunHandle, RunReport, TaskFailure};
pub use task::{Capability, ChildSpec, Task, TaskId, TaskResult, TaskStatus};
