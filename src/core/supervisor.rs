//! 执行监督循环
//!
//! 编排核心的主控循环：每轮先问收敛管理器是否继续；继续则从边界集按策略取任务填满并发窗口，
//! 并发派发到各自路由的处理器；任意一个在途任务完成即串行集成其结果
//! （共享上下文、执行图、子任务批量入队——四个共享结构只在本循环的单一任务中变更，无细粒度锁）。
//! 失败走重试策略；重试耗尽按配置标记失败或转人工升级链。
//!
//! 取消语义：越过全局截止时间或被显式 cancel 后不再发起新派发，宽限期内等待在途任务收尾，
//! 之后发出尽力而为的取消信号并定稿运行报告。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{LoopPolicy, RetrySection, RunConfig};
use crate::core::context::{ContextSnapshot, SharedContext};
use crate::core::convergence::{
    ConvergenceManager, ConvergenceState, RunStatus, TerminationReason, Verdict,
};
use crate::core::error::{HandlerError, OrchestratorError};
use crate::core::escalation::HumanEscalationGateway;
use crate::core::frontier::{Frontier, PushOutcome, Strategy};
use crate::core::graph::{ExecutionGraph, GraphExporter};
use crate::core::loop_detector::LoopDetector;
use crate::core::router::{Handler, HandlerRegistry, Router};
use crate::core::task::{Capability, ChildSpec, Task, TaskId, TaskResult, TaskStatus};

/// 任务得分刷新钩子：每次集成后对边界集整体重打分（Best-First / Beam 场景）
pub trait Rescorer: Send + Sync {
    fn score(&self, task: &Task) -> f64;
}

/// 在途任务的结局（派发 future 的返回值）
enum DispatchOutcome {
    Success {
        handler: String,
        result: TaskResult,
        attempts: u32,
        escalated: bool,
        duration_ms: u64,
    },
    Failure {
        error: OrchestratorError,
        attempts: u32,
        escalated: bool,
        duration_ms: u64,
    },
}

type DispatchFuture = Pin<Box<dyn Future<Output = (Task, DispatchOutcome)> + Send>>;

/// 终局报告中的单条失败记录（含完整任务上下文）
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub objective: String,
    pub depth: u32,
    pub attempts: u32,
    pub error: String,
}

/// 运行计数器快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounters {
    pub iterations: u64,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub escalated_tasks: usize,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    /// Iterative Deepening 的加深轮数
    pub deepening_rounds: u32,
}

/// 终局运行报告
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub reason: TerminationReason,
    pub artifacts: Vec<String>,
    pub graph: ExecutionGraph,
    pub counters: RunCounters,
    pub failures: Vec<TaskFailure>,
}

/// 一次运行的句柄
pub struct RunHandle {
    join: JoinHandle<RunReport>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// 等待运行结束并取回报告
    pub async fn await_result(self) -> RunReport {
        self.join.await.expect("supervisor task panicked")
    }

    /// 请求取消：停止新派发，宽限期后尽力取消在途任务
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// 监督器：持有一次运行的全部可变状态，状态只在 run() 的单一任务内变更
pub(crate) struct Supervisor {
    config: RunConfig,
    registry: HandlerRegistry,
    router: Router,
    frontier: Frontier,
    detector: LoopDetector,
    context: SharedContext,
    graph: ExecutionGraph,
    convergence: ConvergenceManager,
    state: ConvergenceState,
    gateway: Arc<HumanEscalationGateway>,
    cancel: CancellationToken,
    rescorer: Option<Arc<dyn Rescorer>>,
    exporter: Option<Arc<dyn GraphExporter>>,
    initial_spec: ChildSpec,
    root_task: Option<Task>,
    /// 循环检测命中且 loop_policy = escalate 的分支，等待占用窗口槽位
    pending_escalations: Vec<Task>,
    artifacts: Vec<String>,
    failures: Vec<TaskFailure>,
    completed: usize,
    failed: usize,
    escalated: usize,
    deepening_rounds: u32,
    /// fail_fast 下首个失败分支
    fatal: Option<TaskId>,
}

impl Supervisor {
    pub(crate) fn new(
        config: RunConfig,
        registry: HandlerRegistry,
        initial_spec: ChildSpec,
        rescorer: Option<Arc<dyn Rescorer>>,
        exporter: Option<Arc<dyn GraphExporter>>,
    ) -> Self {
        let frontier = Frontier::new(config.run.strategy, &config.strategy);
        let detector = LoopDetector::new(config.run.state_revisit_limit);
        let context = SharedContext::from_config(config.context.keep_last);
        let convergence = ConvergenceManager::new(&config.run, &config.convergence);
        let gateway = Arc::new(HumanEscalationGateway::new(config.escalation.chain.clone()));
        let router = Router::new(config.routing.min_match_threshold);
        Self {
            config,
            registry,
            router,
            frontier,
            detector,
            context,
            graph: ExecutionGraph::new(),
            convergence,
            state: ConvergenceState::new(),
            gateway,
            cancel: CancellationToken::new(),
            rescorer,
            exporter,
            initial_spec,
            root_task: None,
            pending_escalations: Vec::new(),
            artifacts: Vec::new(),
            failures: Vec::new(),
            completed: 0,
            failed: 0,
            escalated: 0,
            deepening_rounds: 0,
            fatal: None,
        }
    }

    /// 启动监督循环，返回运行句柄
    pub(crate) fn spawn(self) -> RunHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());
        RunHandle { join, cancel }
    }

    async fn run(mut self) -> RunReport {
        self.seed_root();
        let mut in_flight: FuturesUnordered<DispatchFuture> = FuturesUnordered::new();

        let reason = loop {
            if self.cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            if let Some(task_id) = self.fatal.take() {
                break TerminationReason::FatalBranchFailure { task_id };
            }

            match self.convergence.evaluate(
                &self.state,
                self.frontier.is_empty() && self.pending_escalations.is_empty(),
                in_flight.len(),
            ) {
                Verdict::Stop(reason) => {
                    if self.should_deepen(&reason) {
                        self.start_deepening_round();
                        continue;
                    }
                    break reason;
                }
                Verdict::RequestApproval => {
                    self.push_approval_task();
                    continue;
                }
                Verdict::RequestRefinement => {
                    self.push_refinement_round();
                    continue;
                }
                Verdict::Continue => {}
            }

            self.fill_window(&mut in_flight);

            if in_flight.is_empty() {
                // 窗口空且边界集已抽干（全部不可路由等情形）：回到收敛判定
                continue;
            }

            // 先完成者先集成；集成期间不派发新任务。
            // 同时监听全局截止时间与取消信号，避免被长在途任务拖过硬上限。
            let remaining = self
                .config
                .time_limit()
                .map(|limit| limit.saturating_sub(self.state.elapsed()));
            let cancel = self.cancel.clone();
            let next = tokio::select! {
                biased;
                next = in_flight.next() => next,
                _ = cancel.cancelled() => None,
                _ = sleep_or_pending(remaining) => None,
            };
            if let Some((task, outcome)) = next {
                self.integrate(task, outcome);
            }
        };

        if !in_flight.is_empty() {
            self.drain_in_flight(&mut in_flight).await;
        }

        self.finalize(reason)
    }

    /// 初始任务入队：根任务同样经过循环检测登记
    fn seed_root(&mut self) {
        let root = Task::root(self.initial_spec.clone());
        let _ = self
            .detector
            .admit(&root.objective, &root.description);
        self.graph.add_root(&root);
        self.root_task = Some(root.clone());
        self.frontier.push(root);
        tracing::info!(
            strategy = ?self.frontier.strategy(),
            parallelism = self.config.run.parallelism_level,
            "run seeded"
        );
    }

    /// 用待升级分支和边界集任务填满并发窗口
    fn fill_window(&mut self, in_flight: &mut FuturesUnordered<DispatchFuture>) {
        let window = self.config.run.parallelism_level.max(1);

        while in_flight.len() < window {
            if let Some(task) = self.pending_escalations.pop() {
                in_flight.push(self.escalation_future(task));
                continue;
            }
            let mut task = match self.frontier.pop() {
                Ok(t) => t,
                Err(_) => break,
            };
            task.status = TaskStatus::Dispatched;
            self.graph.set_status(&task.id, TaskStatus::Dispatched);

            match self.router.route(&task, &self.registry) {
                Ok(handler) => {
                    in_flight.push(self.dispatch_future(task, handler));
                }
                Err(err) => {
                    // 不可路由从不重试，直接进入终局报告
                    self.record_terminal_failure(task, TaskStatus::Failed, &err, 0);
                }
            }
        }
    }

    fn dispatch_future(&self, task: Task, handler: Arc<dyn Handler>) -> DispatchFuture {
        let snapshot = self.context.snapshot();
        let deadline = self.config.handler_deadline();
        let retry = self.config.retry.clone();
        let escalate_on_failure =
            self.config.escalation.escalate_on_failure && !self.gateway.is_empty();
        let gateway = Arc::clone(&self.gateway);
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        Box::pin(execute_with_retry(
            task,
            handler,
            snapshot,
            deadline,
            retry,
            escalate_on_failure,
            gateway,
            registry,
            cancel,
        ))
    }

    /// 循环检测命中且配置为升级的分支：直接交升级链裁决
    fn escalation_future(&self, task: Task) -> DispatchFuture {
        let snapshot = self.context.snapshot();
        let gateway = Arc::clone(&self.gateway);
        let registry = self.registry.clone();
        Box::pin(async move {
            let start = Instant::now();
            let outcome = match gateway.escalate(&task, &registry, snapshot).await {
                Ok(result) => DispatchOutcome::Success {
                    handler: "escalation_chain".to_string(),
                    result,
                    attempts: 1,
                    escalated: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                },
                Err(error) => DispatchOutcome::Failure {
                    error,
                    attempts: 1,
                    escalated: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                },
            };
            (task, outcome)
        })
    }

    /// 串行集成一个在途任务的结局
    fn integrate(&mut self, mut task: Task, outcome: DispatchOutcome) {
        self.state.iterations += 1;

        match outcome {
            DispatchOutcome::Success {
                handler,
                result,
                attempts,
                escalated,
                duration_ms,
            } => {
                task.attempts = attempts;
                task.status = TaskStatus::Completed;
                task.result = Some(result.summary.clone());

                self.state.tokens_used += result.tokens_used;
                if let Some(quality) = result.quality {
                    self.state.quality_score = Some(quality);
                }
                if result.approved == Some(true) {
                    self.state.approval_granted = true;
                }

                self.context.append(&task.id, result.summary.clone());
                self.graph
                    .record_completion(&task.id, &handler, &result.summary);
                self.artifacts.extend(result.artifacts.iter().cloned());
                self.completed += 1;
                if escalated {
                    self.escalated += 1;
                }

                audit_log(&task.id, &handler, true, attempts, duration_ms);

                let child_cost = task.cost_so_far + result.tokens_used as f64;
                self.push_children(&task, result.children, child_cost);

                if let Some(rescorer) = self.rescorer.clone() {
                    self.frontier.rescore_all(|t| rescorer.score(t));
                }
            }
            DispatchOutcome::Failure {
                error,
                attempts,
                escalated,
                duration_ms,
            } => {
                let status = if escalated {
                    TaskStatus::Escalated
                } else {
                    TaskStatus::Failed
                };
                audit_log(&task.id, "-", false, attempts, duration_ms);
                self.record_terminal_failure(task, status, &error, attempts);
            }
        }
    }

    /// 原子批量推入分解出的子任务，保持策略定义的兄弟顺序
    fn push_children(&mut self, parent: &Task, children: Vec<ChildSpec>, child_cost: f64) {
        for spec in children {
            match self.detector.admit(&spec.objective, &spec.description) {
                Ok(()) => {
                    let child = Task::child_of(parent, spec, child_cost);
                    match self.frontier.push(child.clone()) {
                        PushOutcome::Accepted => self.graph.add_child(&child),
                        PushOutcome::DepthCapped => {
                            // 深度上限拒绝由边界集计数，加深重启时重新探索
                        }
                        PushOutcome::BeamPruned => {
                            tracing::debug!(task_id = %child.id, "child permanently discarded by beam");
                        }
                        PushOutcome::Duplicate => {
                            tracing::debug!(task_id = %child.id, "duplicate child ignored");
                        }
                    }
                }
                Err(OrchestratorError::LoopDetected {
                    signature,
                    count,
                    limit,
                }) => {
                    self.graph.record_cycle(&parent.id, &signature, count);
                    let err = OrchestratorError::LoopDetected {
                        signature,
                        count,
                        limit,
                    };
                    let mut child = Task::child_of(parent, spec, child_cost);
                    match self.config.escalation.loop_policy {
                        LoopPolicy::Fail => {
                            self.graph.add_child(&child);
                            self.record_terminal_failure(child, TaskStatus::Failed, &err, 0);
                        }
                        LoopPolicy::Escalate => {
                            tracing::warn!(
                                parent_id = %parent.id,
                                error = %err,
                                "loop detected, branch handed to escalation chain"
                            );
                            child.status = TaskStatus::Escalated;
                            self.graph.add_child(&child);
                            self.pending_escalations.push(child);
                        }
                    }
                }
                Err(other) => {
                    tracing::error!(error = %other, "unexpected loop detector error");
                }
            }
        }
    }

    /// 终局失败记录：图、失败列表与 fail_fast 判定
    fn record_terminal_failure(
        &mut self,
        mut task: Task,
        status: TaskStatus,
        error: &OrchestratorError,
        attempts: u32,
    ) {
        task.attempts = attempts;
        task.status = status;
        tracing::warn!(task_id = %task.id, error = %error, "task terminal failure");
        self.graph
            .record_failure(&task.id, status, &error.to_string());
        self.failures.push(TaskFailure {
            task_id: task.id.clone(),
            objective: task.objective.clone(),
            depth: task.depth,
            attempts,
            error: error.to_string(),
        });
        if status == TaskStatus::Escalated {
            self.escalated += 1;
        } else {
            self.failed += 1;
        }
        if self.config.run.fail_fast && self.fatal.is_none() {
            self.fatal = Some(task.id);
        }
    }

    /// 收敛要求审批：生成一次人工审批任务
    fn push_approval_task(&mut self) {
        self.state.approval_requested = true;
        let root = self.root_task.clone().expect("root seeded before approval");
        let spec = ChildSpec::new(
            format!("approve: {}", root.objective),
            "grant or withhold final approval for the run outcome",
        )
        .with_capability(Capability::HumanJudgment);
        let _ = self.detector.admit(&spec.objective, &spec.description);
        let task = Task::child_of(&root, spec, 0.0);
        self.graph.add_child(&task);
        self.frontier.push(task);
        tracing::info!("approval task generated");
    }

    /// 质量未达标：生成一轮细化任务（同样受循环检测约束）
    fn push_refinement_round(&mut self) {
        self.state.refinement_rounds += 1;
        let root = self.root_task.clone().expect("root seeded before refinement");
        let spec = ChildSpec::new(
            format!("refine: {}", root.objective),
            root.description.clone(),
        )
        .with_priority(root.priority);
        let spec = root
            .required_capabilities
            .iter()
            .fold(spec, |s, cap| s.with_capability(*cap));

        match self.detector.admit(&spec.objective, &spec.description) {
            Ok(()) => {
                let task = Task::child_of(&root, spec, 0.0);
                self.graph.add_child(&task);
                self.frontier.push(task);
                tracing::info!(
                    round = self.state.refinement_rounds,
                    "refinement round generated"
                );
            }
            Err(err) => {
                // 细化任务自身触发循环检测：记录后交由下一轮收敛判定收场
                self.graph.record_cycle(&root.id, &err.to_string(), 0);
                tracing::warn!(error = %err, "refinement task rejected by loop detector");
            }
        }
    }

    /// Iterative Deepening：边界集耗尽但存在被深度上限拒绝的探索空间时加深重启
    fn should_deepen(&self, reason: &TerminationReason) -> bool {
        matches!(
            reason,
            TerminationReason::GoalComplete | TerminationReason::QualityBelowThreshold { .. }
        ) && self.frontier.strategy() == Strategy::IterativeDeepening
            && self.frontier.capped_pushes() > 0
            && self.frontier.depth_cap().unwrap_or(u32::MAX) < self.config.strategy.max_depth_cap
    }

    fn start_deepening_round(&mut self) {
        let new_cap = self.frontier.depth_cap().unwrap_or(0) + 1;
        self.deepening_rounds += 1;
        self.frontier.reset_for_deepening(new_cap);
        self.detector.reset();
        self.graph = ExecutionGraph::new();
        // 共享上下文与资源计数跨轮保留，资源上限仍然有效
        self.seed_root();
        tracing::info!(round = self.deepening_rounds, cap = new_cap, "deepening restart");
    }

    /// 宽限期内等待在途任务；超时后发出尽力而为的取消信号并收完残余
    async fn drain_in_flight(&mut self, in_flight: &mut FuturesUnordered<DispatchFuture>) {
        let grace = tokio::time::sleep(self.config.grace_period());
        tokio::pin!(grace);

        loop {
            tokio::select! {
                _ = &mut grace => {
                    tracing::info!("grace period elapsed, signalling cancellation to in-flight tasks");
                    self.cancel.cancel();
                    break;
                }
                next = in_flight.next() => match next {
                    Some((task, outcome)) => self.integrate(task, outcome),
                    None => return,
                }
            }
        }

        // 取消信号后派发 future 会快速返回 ConvergenceForced
        while let Some((task, outcome)) = in_flight.next().await {
            self.integrate(task, outcome);
        }
    }

    fn finalize(mut self, reason: TerminationReason) -> RunReport {
        // 边界集耗尽但没有任何任务成功：按失败运行报告
        let status = if matches!(reason, TerminationReason::GoalComplete)
            && self.completed == 0
            && !self.failures.is_empty()
        {
            RunStatus::Failed
        } else {
            reason.status()
        };
        let counters = RunCounters {
            iterations: self.state.iterations,
            completed_tasks: self.completed,
            failed_tasks: self.failed,
            escalated_tasks: self.escalated,
            tokens_used: self.state.tokens_used,
            elapsed_ms: self.state.elapsed().as_millis() as u64,
            deepening_rounds: self.deepening_rounds,
        };
        tracing::info!(
            status = ?status,
            reason = %reason,
            completed = counters.completed_tasks,
            failed = counters.failed_tasks,
            escalated = counters.escalated_tasks,
            tokens = counters.tokens_used,
            "run finalized"
        );

        if let Some(exporter) = self.exporter.take() {
            if let Err(e) = exporter.export(&self.graph) {
                tracing::warn!(exporter = exporter.name(), error = %e, "graph export failed");
            }
        }

        RunReport {
            status,
            reason,
            artifacts: self.artifacts,
            graph: self.graph,
            counters,
            failures: self.failures,
        }
    }
}

/// 带重试的处理器调用：瞬态错误指数退避，重试耗尽按配置转升级链
#[allow(clippy::too_many_arguments)]
async fn execute_with_retry(
    mut task: Task,
    handler: Arc<dyn Handler>,
    snapshot: ContextSnapshot,
    deadline: Duration,
    retry: RetrySection,
    escalate_on_failure: bool,
    gateway: Arc<HumanEscalationGateway>,
    registry: HandlerRegistry,
    cancel: CancellationToken,
) -> (Task, DispatchOutcome) {
    let start = Instant::now();
    let handler_name = handler.descriptor().name;
    let max_attempts = retry.max_attempts.max(1);
    let mut attempts = 0;

    let final_error: HandlerError = loop {
        attempts += 1;
        task.attempts = attempts;

        let execution =
            tokio::time::timeout(deadline, handler.execute(&task, snapshot.clone(), deadline));
        let attempt_result = tokio::select! {
            biased;
            result = execution => Some(result),
            _ = cancel.cancelled() => None,
        };
        let attempt_result = match attempt_result {
            Some(result) => result,
            None => {
                let outcome = DispatchOutcome::Failure {
                    error: OrchestratorError::ConvergenceForced {
                        task_id: task.id.clone(),
                        reason: "cancelled while in flight".to_string(),
                    },
                    attempts,
                    escalated: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                return (task, outcome);
            }
        };

        let error = match attempt_result {
            Ok(Ok(result)) => {
                let outcome = DispatchOutcome::Success {
                    handler: handler_name,
                    result,
                    attempts,
                    escalated: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                return (task, outcome);
            }
            Ok(Err(e)) => e,
            Err(_) => HandlerError::transient(format!(
                "handler '{}' exceeded deadline of {:?}",
                handler_name, deadline
            )),
        };

        if error.retryable && attempts < max_attempts {
            let backoff = Duration::from_millis(retry.backoff_base_ms << (attempts - 1).min(16));
            tracing::debug!(
                task_id = %task.id,
                handler = %handler_name,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "transient handler failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            continue;
        }
        break error;
    };

    // 重试耗尽：按配置转人工升级链或标记失败
    if escalate_on_failure {
        tracing::info!(task_id = %task.id, "retries exhausted, escalating");
        let outcome = match gateway.escalate(&task, &registry, snapshot).await {
            Ok(result) => DispatchOutcome::Success {
                handler: "escalation_chain".to_string(),
                result,
                attempts,
                escalated: true,
                duration_ms: start.elapsed().as_millis() as u64,
            },
            Err(error) => DispatchOutcome::Failure {
                error,
                attempts,
                escalated: true,
                duration_ms: start.elapsed().as_millis() as u64,
            },
        };
        return (task, outcome);
    }

    let outcome = DispatchOutcome::Failure {
        error: OrchestratorError::Handler(final_error),
        attempts,
        escalated: false,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    (task, outcome)
}

/// 有期限则睡到期限，无期限则永远挂起（select 分支用）
async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// 每次派发结局输出一条结构化审计日志（JSON）
fn audit_log(task_id: &str, handler: &str, ok: bool, attempts: u32, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "dispatch_audit",
        "task": task_id,
        "handler": handler,
        "ok": ok,
        "attempts": attempts,
        "duration_ms": duration_ms,
    });
    tracing::info!(audit = %audit.to_string(), "dispatch");
}
