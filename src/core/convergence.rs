//! 收敛管理
//!
//! 每轮迭代按固定优先级检查终止条件（先命中者即为终止原因）：
//! 1. 资源上限（迭代数 / 墙钟 / token 预算）→ 强制终止
//! 2. 要求的人工审批未取得 → 保持运行并生成一次审批任务；审批被拒则终止
//! 3. 质量未达标且无待执行任务 → 按策略生成细化任务，或接受为自然收敛
//! 4. 边界集空且无在途任务 → 目标完成
//!
//! 终止时必须能报告命中的判据与当时的精确计数。

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{ConvergenceSection, RunSection};
use crate::core::task::TaskId;

/// 运行期计数器，仅监督循环更新
#[derive(Debug, Clone)]
pub struct ConvergenceState {
    /// 已集成的结果数
    pub iterations: u64,
    pub started_at: Instant,
    /// 累计 token 消耗
    pub tokens_used: u64,
    /// 最近一次观测到的质量得分
    pub quality_score: Option<f64>,
    /// 人工审批是否已取得
    pub approval_granted: bool,
    /// 是否已生成过审批任务（只生成一次）
    pub approval_requested: bool,
    /// 已生成的细化任务轮数
    pub refinement_rounds: u32,
}

impl ConvergenceState {
    pub fn new() -> Self {
        Self {
            iterations: 0,
            started_at: Instant::now(),
            tokens_used: 0,
            quality_score: None,
            approval_granted: false,
            approval_requested: false,
            refinement_rounds: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ConvergenceState {
    fn default() -> Self {
        Self::new()
    }
}

/// 命中的资源上限与当时的计数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResourceBound {
    Iterations { used: u64, limit: u64 },
    WallClock { elapsed_secs: u64, limit_secs: u64 },
    TokenBudget { used: u64, limit: u64 },
}

/// 终止原因
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TerminationReason {
    /// 资源上限命中，强制终止
    ResourceBounds(ResourceBound),
    /// 质量未达标且无法生成更多工作，作为自然收敛接受
    QualityBelowThreshold { score: f64, threshold: f64 },
    /// 边界集耗尽，目标完成
    GoalComplete,
    /// 审批任务已执行但未授予审批
    ApprovalWithheld,
    /// 调用方显式取消
    Cancelled,
    /// fail_fast 配置下某分支失败
    FatalBranchFailure { task_id: TaskId },
}

impl TerminationReason {
    /// 终止原因决定运行状态
    pub fn status(&self) -> RunStatus {
        match self {
            TerminationReason::GoalComplete | TerminationReason::QualityBelowThreshold { .. } => {
                RunStatus::NaturalConvergence
            }
            TerminationReason::ResourceBounds(_)
            | TerminationReason::ApprovalWithheld
            | TerminationReason::Cancelled => RunStatus::ForcedTermination,
            TerminationReason::FatalBranchFailure { .. } => RunStatus::Failed,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ResourceBounds(ResourceBound::Iterations { used, limit }) => {
                write!(f, "resource_bounds: iterations {used}/{limit}")
            }
            TerminationReason::ResourceBounds(ResourceBound::WallClock {
                elapsed_secs,
                limit_secs,
            }) => write!(f, "resource_bounds: wall clock {elapsed_secs}s/{limit_secs}s"),
            TerminationReason::ResourceBounds(ResourceBound::TokenBudget { used, limit }) => {
                write!(f, "resource_bounds: token budget {used}/{limit}")
            }
            TerminationReason::QualityBelowThreshold { score, threshold } => {
                write!(f, "quality_below_threshold: {score:.2} < {threshold:.2}")
            }
            TerminationReason::GoalComplete => write!(f, "goal_complete"),
            TerminationReason::ApprovalWithheld => write!(f, "approval_withheld"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
            TerminationReason::FatalBranchFailure { task_id } => {
                write!(f, "fatal_branch_failure: {task_id}")
            }
        }
    }
}

/// 运行最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    NaturalConvergence,
    ForcedTermination,
    Failed,
}

/// 每轮评估的裁决
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// 继续运行
    Continue,
    /// 生成一次审批任务以保持终止判定开放
    RequestApproval,
    /// 质量未达标，生成一轮细化任务
    RequestRefinement,
    /// 终止，附原因
    Stop(TerminationReason),
}

/// 多判据收敛管理器
pub struct ConvergenceManager {
    max_iterations: u64,
    time_limit: Option<Duration>,
    token_budget: Option<u64>,
    quality_threshold: Option<f64>,
    require_approval: bool,
    max_refinement_rounds: u32,
}

impl ConvergenceManager {
    pub fn new(run: &RunSection, convergence: &ConvergenceSection) -> Self {
        Self {
            max_iterations: run.max_iterations,
            time_limit: run.time_limit_secs.map(Duration::from_secs),
            token_budget: run.token_budget,
            quality_threshold: convergence.quality_threshold,
            require_approval: convergence.require_approval,
            max_refinement_rounds: convergence.max_refinement_rounds,
        }
    }

    /// 固定优先级评估；frontier_empty / in_flight 来自监督循环的当前视图
    pub fn evaluate(
        &self,
        state: &ConvergenceState,
        frontier_empty: bool,
        in_flight: usize,
    ) -> Verdict {
        // 1. 资源上限：无论是否还有工作都立即强制终止
        if state.iterations >= self.max_iterations {
            return Verdict::Stop(TerminationReason::ResourceBounds(
                ResourceBound::Iterations {
                    used: state.iterations,
                    limit: self.max_iterations,
                },
            ));
        }
        if let Some(limit) = self.time_limit {
            let elapsed = state.elapsed();
            if elapsed >= limit {
                return Verdict::Stop(TerminationReason::ResourceBounds(
                    ResourceBound::WallClock {
                        elapsed_secs: elapsed.as_secs(),
                        limit_secs: limit.as_secs(),
                    },
                ));
            }
        }
        if let Some(budget) = self.token_budget {
            if state.tokens_used >= budget {
                return Verdict::Stop(TerminationReason::ResourceBounds(
                    ResourceBound::TokenBudget {
                        used: state.tokens_used,
                        limit: budget,
                    },
                ));
            }
        }

        // 还有待执行或在途工作：继续
        if !frontier_empty || in_flight > 0 {
            return Verdict::Continue;
        }

        // 2. 审批判据先于质量判据
        if self.require_approval && !state.approval_granted {
            if !state.approval_requested {
                return Verdict::RequestApproval;
            }
            return Verdict::Stop(TerminationReason::ApprovalWithheld);
        }

        // 3. 质量判据
        if let Some(threshold) = self.quality_threshold {
            let score = state.quality_score.unwrap_or(0.0);
            if score < threshold {
                if state.refinement_rounds < self.max_refinement_rounds {
                    return Verdict::RequestRefinement;
                }
                return Verdict::Stop(TerminationReason::QualityBelowThreshold {
                    score,
                    threshold,
                });
            }
        }

        // 4. 自然收敛
        Verdict::Stop(TerminationReason::GoalComplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(run: RunSection, conv: ConvergenceSection) -> ConvergenceManager {
        ConvergenceManager::new(&run, &conv)
    }

    #[test]
    fn test_iteration_bound_fires_first() {
        let m = manager(
            RunSection {
                max_iterations: 5,
                ..RunSection::default()
            },
            ConvergenceSection::default(),
        );
        let mut state = ConvergenceState::new();
        state.iterations = 5;
        // 即便边界集已空（本可自然收敛），资源判据优先
        let verdict = m.evaluate(&state, true, 0);
        assert_eq!(
            verdict,
            Verdict::Stop(TerminationReason::ResourceBounds(
                ResourceBound::Iterations { used: 5, limit: 5 }
            ))
        );
    }

    #[test]
    fn test_token_budget_bound() {
        let m = manager(
            RunSection {
                token_budget: Some(1000),
                ..RunSection::default()
            },
            ConvergenceSection::default(),
        );
        let mut state = ConvergenceState::new();
        state.tokens_used = 1500;
        assert!(matches!(
            m.evaluate(&state, false, 2),
            Verdict::Stop(TerminationReason::ResourceBounds(
                ResourceBound::TokenBudget { used: 1500, limit: 1000 }
            ))
        ));
    }

    #[test]
    fn test_wall_clock_bound() {
        let m = manager(
            RunSection {
                time_limit_secs: Some(0),
                ..RunSection::default()
            },
            ConvergenceSection::default(),
        );
        let state = ConvergenceState::new();
        assert!(matches!(
            m.evaluate(&state, false, 0),
            Verdict::Stop(TerminationReason::ResourceBounds(ResourceBound::WallClock { .. }))
        ));
    }

    #[test]
    fn test_pending_work_continues() {
        let m = manager(RunSection::default(), ConvergenceSection::default());
        let state = ConvergenceState::new();
        assert_eq!(m.evaluate(&state, false, 0), Verdict::Continue);
        assert_eq!(m.evaluate(&state, true, 2), Verdict::Continue);
    }

    #[test]
    fn test_empty_frontier_is_goal_complete() {
        let m = manager(RunSection::default(), ConvergenceSection::default());
        let state = ConvergenceState::new();
        assert_eq!(
            m.evaluate(&state, true, 0),
            Verdict::Stop(TerminationReason::GoalComplete)
        );
    }

    #[test]
    fn test_approval_requested_once_then_withheld() {
        let m = manager(
            RunSection::default(),
            ConvergenceSection {
                require_approval: true,
                ..ConvergenceSection::default()
            },
        );
        let mut state = ConvergenceState::new();
        assert_eq!(m.evaluate(&state, true, 0), Verdict::RequestApproval);

        state.approval_requested = true;
        assert_eq!(
            m.evaluate(&state, true, 0),
            Verdict::Stop(TerminationReason::ApprovalWithheld)
        );

        state.approval_granted = true;
        assert_eq!(
            m.evaluate(&state, true, 0),
            Verdict::Stop(TerminationReason::GoalComplete)
        );
    }

    #[test]
    fn test_quality_shortfall_requests_refinement_then_accepts() {
        let m = manager(
            RunSection::default(),
            ConvergenceSection {
                quality_threshold: Some(0.9),
                max_refinement_rounds: 1,
                ..ConvergenceSection::default()
            },
        );
        let mut state = ConvergenceState::new();
        state.quality_score = Some(0.4);
        assert_eq!(m.evaluate(&state, true, 0), Verdict::RequestRefinement);

        state.refinement_rounds = 1;
        assert_eq!(
            m.evaluate(&state, true, 0),
            Verdict::Stop(TerminationReason::QualityBelowThreshold {
                score: 0.4,
                threshold: 0.9
            })
        );

        state.quality_score = Some(0.95);
        assert_eq!(
            m.evaluate(&state, true, 0),
            Verdict::Stop(TerminationReason::GoalComplete)
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TerminationReason::GoalComplete.status(),
            RunStatus::NaturalConvergence
        );
        assert_eq!(
            TerminationReason::Cancelled.status(),
            RunStatus::ForcedTermination
        );
        assert_eq!(
            TerminationReason::FatalBranchFailure {
                task_id: "task_x".into()
            }
            .status(),
            RunStatus::Failed
        );
    }
}
