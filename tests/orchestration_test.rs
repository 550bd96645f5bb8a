//! 编排集成测试：通过 submit 接口端到端驱动监督循环

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use swarm::config::{ConvergenceSection, EscalationTier, RunConfig, RunSection, StrategySection};
use swarm::core::{
    ContextSnapshot, GraphExporter, Handler, HandlerDescriptor, HandlerError, HandlerRegistry,
    ResourceBound, RunStatus, Strategy, TerminationReason,
};
use swarm::handlers::{ChannelHumanHandler, EchoHandler, HumanReply, ScriptedHandler};
use swarm::{submit, Capability, ChildSpec, RunBuilder, Task, TaskResult};

fn config_with(run: RunSection) -> RunConfig {
    swarm::observability::try_init();
    RunConfig {
        run,
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn test_zero_child_task_reaches_goal_complete() {
    swarm::observability::try_init();
    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);

    let initial = ChildSpec::new("echo once", "hello frontier")
        .with_capability(Capability::DeterministicExecute);
    let report = submit(initial, RunConfig::default(), registry)
        .await_result()
        .await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.reason, TerminationReason::GoalComplete);
    assert_eq!(report.counters.completed_tasks, 1);
    assert_eq!(report.counters.iterations, 1);
    assert_eq!(report.artifacts, vec!["hello frontier".to_string()]);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_max_iterations_stops_infinite_generator_at_exactly_five() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let mut registry = HandlerRegistry::new();
    // 每个任务都分解出一个新的子任务：无限生成器
    registry.register(ScriptedHandler::new(
        "generator",
        vec![Capability::DeterministicExecute],
        move |_task| {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(TaskResult::new(format!("step {n} done")).with_children(vec![
                ChildSpec::new(format!("step {}", n + 1), format!("work item {}", n + 1))
                    .with_capability(Capability::DeterministicExecute),
            ]))
        },
    ));

    let config = config_with(RunSection {
        max_iterations: 5,
        parallelism_level: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("step 0", "work item 0")
        .with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::ForcedTermination);
    assert_eq!(
        report.reason,
        TerminationReason::ResourceBounds(ResourceBound::Iterations { used: 5, limit: 5 })
    );
    assert_eq!(report.counters.iterations, 5);
}

/// 记录并发水位的处理器
struct GaugeHandler {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for GaugeHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new("gauge", vec![Capability::FastClassify])
    }

    async fn execute(
        &self,
        task: &Task,
        _context: ContextSnapshot,
        _deadline: Duration,
    ) -> Result<TaskResult, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskResult::new(format!("classified {}", task.objective)))
    }
}

#[tokio::test]
async fn test_parallelism_window_caps_inflight_tasks() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "decomposer",
        vec![Capability::DeterministicExecute],
        |_task| {
            let children = (0..10)
                .map(|i| {
                    ChildSpec::new(format!("item {i}"), format!("independent item {i}"))
                        .with_capability(Capability::FastClassify)
                })
                .collect();
            Ok(TaskResult::new("decomposed into 10 items").with_children(children))
        },
    ));
    registry.register(GaugeHandler {
        current: current.clone(),
        peak: peak.clone(),
    });

    let config = config_with(RunSection {
        parallelism_level: 3,
        ..RunSection::default()
    });
    let initial =
        ChildSpec::new("batch", "ten independent items").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    // 根任务 + 10 个子任务全部到达终态
    assert_eq!(report.counters.completed_tasks, 11);
    assert!(report.failures.is_empty());
    // 任意时刻在途不超过并发窗口
    assert!(peak.load(Ordering::SeqCst) <= 3, "peak was {}", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_loop_detector_force_fails_repeating_branch() {
    let mut registry = HandlerRegistry::new();
    // 每次都提出一模一样的子任务：第 4 次入队被拒
    registry.register(ScriptedHandler::new(
        "repeater",
        vec![Capability::DeterministicExecute],
        |_task| {
            Ok(TaskResult::new("again").with_children(vec![ChildSpec::new(
                "repeat step",
                "identical payload",
            )
            .with_capability(Capability::DeterministicExecute)]))
        },
    ));

    let config = config_with(RunSection {
        parallelism_level: 1,
        state_revisit_limit: 3,
        ..RunSection::default()
    });
    let initial =
        ChildSpec::new("repeat step", "identical payload").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    // 根 + 两次重复执行成功，第 4 个同签名子任务被拒
    assert_eq!(report.counters.completed_tasks, 3);
    assert_eq!(report.counters.failed_tasks, 1);
    assert_eq!(report.graph.cycle_records().len(), 1);
    assert!(report.failures[0].error.contains("loop detected"));
}

#[tokio::test]
async fn test_classify_scenario_dequeues_in_push_order() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "decomposer",
        vec![Capability::DeterministicExecute],
        |_task| {
            let children = ["milk", "bread", "shampoo"]
                .iter()
                .map(|item| {
                    ChildSpec::new(format!("classify {item}"), format!("grocery item: {item}"))
                        .with_capability(Capability::FastClassify)
                })
                .collect();
            Ok(TaskResult::new("split shopping list").with_children(children))
        },
    ));
    for name in ["classifier_a", "classifier_b", "classifier_c"] {
        let order = order.clone();
        registry.register(ScriptedHandler::new(
            name,
            vec![Capability::FastClassify],
            move |task| {
                order.lock().unwrap().push(task.objective.clone());
                Ok(TaskResult::new(format!("{}: classified", task.objective)))
            },
        ));
    }

    let config = config_with(RunSection {
        strategy: Strategy::Bfs,
        parallelism_level: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("classify [milk, bread, shampoo]", "shopping list")
        .with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.counters.completed_tasks, 4);
    let seen = order.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec!["classify milk", "classify bread", "classify shampoo"]
    );
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "flaky",
        vec![Capability::ExternalLookup],
        move |_task| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::transient("upstream 503"))
            } else {
                Ok(TaskResult::new("lookup succeeded"))
            }
        },
    ));

    let mut config = RunConfig::default();
    config.retry.max_attempts = 3;
    config.retry.backoff_base_ms = 10;
    let initial = ChildSpec::new("lookup", "flaky upstream").with_capability(Capability::ExternalLookup);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.counters.completed_tasks, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "strict",
        vec![Capability::DeterministicExecute],
        move |_task| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::permanent("malformed input"))
        },
    ));

    let mut config = RunConfig::default();
    config.retry.max_attempts = 3;
    let initial = ChildSpec::new("doomed", "bad payload").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    // 根任务失败且没有任何完成任务：运行整体视为失败
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.counters.failed_tasks, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(report.failures[0].error.contains("malformed input"));
}

#[tokio::test]
async fn test_unroutable_task_surfaces_in_report() {
    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);

    let initial = ChildSpec::new("think hard", "requires reasoning").with_capability(Capability::DeepReason);
    let report = submit(initial, RunConfig::default(), registry)
        .await_result()
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("no handler clears match threshold"));
}

#[tokio::test]
async fn test_branch_failure_degrades_only_that_branch() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "decomposer",
        vec![Capability::DeterministicExecute],
        |_task| {
            Ok(TaskResult::new("two branches").with_children(vec![
                ChildSpec::new("good branch", "succeeds").with_capability(Capability::FastClassify),
                ChildSpec::new("bad branch", "fails").with_capability(Capability::ExternalLookup),
            ]))
        },
    ));
    registry.register(ScriptedHandler::new(
        "classifier",
        vec![Capability::FastClassify],
        |task| Ok(TaskResult::new(format!("{} handled", task.objective))),
    ));
    registry.register(ScriptedHandler::new(
        "broken_lookup",
        vec![Capability::ExternalLookup],
        |_task| Err(HandlerError::permanent("service gone")),
    ));

    let config = config_with(RunSection {
        parallelism_level: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("split", "two branches").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    // 坏分支只拖垮自己
    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.counters.completed_tasks, 2);
    assert_eq!(report.counters.failed_tasks, 1);
}

#[tokio::test]
async fn test_fail_fast_turns_branch_failure_fatal() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "broken",
        vec![Capability::DeterministicExecute],
        |_task| Err(HandlerError::permanent("fatal input")),
    ));

    let config = config_with(RunSection {
        fail_fast: true,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("doomed", "payload").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(matches!(
        report.reason,
        TerminationReason::FatalBranchFailure { .. }
    ));
}

#[tokio::test]
async fn test_exhausted_retries_escalate_to_human_chain() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "broken_lookup",
        vec![Capability::ExternalLookup],
        |_task| Err(HandlerError::permanent("service gone")),
    ));
    // 第一级保持沉默（超时推进），第二级立即批复
    let (silent, _silent_tx) = ChannelHumanHandler::new("first_line");
    registry.register(silent);
    let (responsive, responsive_tx) = ChannelHumanHandler::new("second_line");
    responsive_tx
        .send(HumanReply::approve("manually resolved"))
        .unwrap();
    registry.register(responsive);

    let mut config = RunConfig::default();
    config.escalation.escalate_on_failure = true;
    config.escalation.chain = vec![
        EscalationTier {
            handler_id: "first_line".to_string(),
            timeout_secs: 1,
        },
        EscalationTier {
            handler_id: "second_line".to_string(),
            timeout_secs: 5,
        },
    ];
    let initial = ChildSpec::new("lookup", "dead upstream").with_capability(Capability::ExternalLookup);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.counters.completed_tasks, 1);
    assert_eq!(report.counters.escalated_tasks, 1);
}

#[tokio::test]
async fn test_required_approval_generates_approval_task() {
    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);
    let (reviewer, reviewer_tx) = ChannelHumanHandler::new("reviewer");
    reviewer_tx
        .send(HumanReply::approve("run outcome approved"))
        .unwrap();
    registry.register(reviewer);

    let config = RunConfig {
        convergence: ConvergenceSection {
            require_approval: true,
            ..ConvergenceSection::default()
        },
        ..RunConfig::default()
    };
    let initial = ChildSpec::new("do work", "payload").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.reason, TerminationReason::GoalComplete);
    // 原任务 + 自动生成的审批任务
    assert_eq!(report.counters.completed_tasks, 2);
}

#[tokio::test]
async fn test_quality_shortfall_triggers_refinement_round() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "writer",
        vec![Capability::DeepReason],
        |task| {
            if task.objective.starts_with("refine:") {
                Ok(TaskResult::new("revised draft").with_quality(0.95))
            } else {
                Ok(TaskResult::new("first draft").with_quality(0.5))
            }
        },
    ));

    let config = RunConfig {
        convergence: ConvergenceSection {
            quality_threshold: Some(0.9),
            max_refinement_rounds: 2,
            ..ConvergenceSection::default()
        },
        ..RunConfig::default()
    };
    let initial = ChildSpec::new("draft report", "write it").with_capability(Capability::DeepReason);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.reason, TerminationReason::GoalComplete);
    assert_eq!(report.counters.completed_tasks, 2);
}

#[tokio::test]
async fn test_quality_shortfall_accepted_when_no_refinement_allowed() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "writer",
        vec![Capability::DeepReason],
        |_task| Ok(TaskResult::new("draft").with_quality(0.5)),
    ));

    let config = RunConfig {
        convergence: ConvergenceSection {
            quality_threshold: Some(0.9),
            max_refinement_rounds: 0,
            ..ConvergenceSection::default()
        },
        ..RunConfig::default()
    };
    let initial = ChildSpec::new("draft report", "write it").with_capability(Capability::DeepReason);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(
        report.reason,
        TerminationReason::QualityBelowThreshold {
            score: 0.5,
            threshold: 0.9
        }
    );
}

#[tokio::test]
async fn test_token_budget_bound_reports_exact_counters() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "expensive",
        vec![Capability::DeepReason],
        |_task| {
            Ok(TaskResult::new("burned tokens")
                .with_tokens(600)
                .with_children(vec![
                    ChildSpec::new("more work", "next").with_capability(Capability::DeepReason)
                ]))
        },
    ));

    let config = config_with(RunSection {
        token_budget: Some(1000),
        parallelism_level: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("start", "expensive work").with_capability(Capability::DeepReason);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::ForcedTermination);
    assert_eq!(
        report.reason,
        TerminationReason::ResourceBounds(ResourceBound::TokenBudget {
            used: 1200,
            limit: 1000
        })
    );
}

#[tokio::test]
async fn test_cancel_forces_termination() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        ScriptedHandler::new("slow", vec![Capability::DeterministicExecute], |_task| {
            Ok(TaskResult::new("done"))
        })
        .with_delay(Duration::from_secs(30)),
    );

    let config = config_with(RunSection {
        grace_period_secs: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("slow job", "payload").with_capability(Capability::DeterministicExecute);
    let handle = submit(initial, config, registry);

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let report = handle.await_result().await;

    assert_eq!(report.status, RunStatus::ForcedTermination);
    assert_eq!(report.reason, TerminationReason::Cancelled);
    assert!(report
        .failures
        .iter()
        .any(|f| f.error.contains("forcibly terminated")));
}

#[tokio::test]
async fn test_beam_discards_low_priority_siblings() {
    let executed = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "decomposer",
        vec![Capability::DeterministicExecute],
        |_task| {
            let children = [("a", 1.0), ("b", 4.0), ("c", 3.0), ("d", 2.0)]
                .iter()
                .map(|(name, priority)| {
                    ChildSpec::new(format!("branch {name}"), format!("candidate {name}"))
                        .with_capability(Capability::FastClassify)
                        .with_priority(*priority)
                })
                .collect();
            Ok(TaskResult::new("four candidates").with_children(children))
        },
    ));
    let executed_clone = executed.clone();
    registry.register(ScriptedHandler::new(
        "classifier",
        vec![Capability::FastClassify],
        move |task| {
            executed_clone.lock().unwrap().push(task.objective.clone());
            Ok(TaskResult::new("ok"))
        },
    ));

    let config = RunConfig {
        run: RunSection {
            strategy: Strategy::Beam,
            parallelism_level: 1,
            ..RunSection::default()
        },
        strategy: StrategySection {
            beam_width: 2,
            ..StrategySection::default()
        },
        ..RunConfig::default()
    };
    let initial = ChildSpec::new("expand", "root").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    // 根 + 层内得分最高的两个分支；a、d 被永久丢弃
    assert_eq!(report.counters.completed_tasks, 3);
    let mut seen = executed.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["branch b", "branch c"]);
}

#[tokio::test]
async fn test_iterative_deepening_restarts_with_larger_cap() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "driller",
        vec![Capability::DeterministicExecute],
        |task| {
            let next = match task.objective.as_str() {
                "surface" => Some("level one"),
                "level one" => Some("level two"),
                "level two" => Some("level three"),
                _ => None,
            };
            let mut result = TaskResult::new(format!("visited {}", task.objective));
            if let Some(next) = next {
                result = result.with_children(vec![ChildSpec::new(next, "go deeper")
                    .with_capability(Capability::DeterministicExecute)]);
            }
            Ok(result)
        },
    ));

    let config = RunConfig {
        run: RunSection {
            strategy: Strategy::IterativeDeepening,
            parallelism_level: 1,
            ..RunSection::default()
        },
        strategy: StrategySection {
            initial_depth_cap: 1,
            max_depth_cap: 2,
            ..StrategySection::default()
        },
        ..RunConfig::default()
    };
    let initial = ChildSpec::new("surface", "start").with_capability(Capability::DeterministicExecute);
    let report = submit(initial, config, registry).await_result().await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    assert_eq!(report.counters.deepening_rounds, 1);
    // 第一轮 cap=1 完成 2 个，加深到 cap=2 后完成 3 个
    assert_eq!(report.counters.completed_tasks, 5);
}

/// 按目标名给分：用于验证重打分钩子改变弹出顺序
struct ObjectiveRescorer;

impl swarm::core::Rescorer for ObjectiveRescorer {
    fn score(&self, task: &Task) -> f64 {
        if task.objective == "branch a" {
            10.0
        } else {
            0.0
        }
    }
}

#[tokio::test]
async fn test_rescorer_overrides_initial_priorities() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
        "decomposer",
        vec![Capability::DeterministicExecute],
        |_task| {
            Ok(TaskResult::new("two branches").with_children(vec![
                ChildSpec::new("branch a", "low initial priority")
                    .with_capability(Capability::FastClassify)
                    .with_priority(1.0),
                ChildSpec::new("branch b", "high initial priority")
                    .with_capability(Capability::FastClassify)
                    .with_priority(5.0),
            ]))
        },
    ));
    let order_clone = order.clone();
    registry.register(ScriptedHandler::new(
        "classifier",
        vec![Capability::FastClassify],
        move |task| {
            order_clone.lock().unwrap().push(task.objective.clone());
            Ok(TaskResult::new("ok"))
        },
    ));

    let config = config_with(RunSection {
        strategy: Strategy::BestFirst,
        parallelism_level: 1,
        ..RunSection::default()
    });
    let initial = ChildSpec::new("expand", "root").with_capability(Capability::DeterministicExecute);
    let report = RunBuilder::new(config, registry)
        .with_rescorer(ObjectiveRescorer)
        .submit(initial)
        .await_result()
        .await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    // 初始优先级 b > a，但重打分后 a 先弹出
    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, vec!["branch a", "branch b"]);
}

/// 把导出的执行图存进内存供断言
struct CapturingExporter {
    captured: Arc<Mutex<Option<serde_json::Value>>>,
}

impl GraphExporter for CapturingExporter {
    fn export(&self, graph: &swarm::ExecutionGraph) -> anyhow::Result<()> {
        *self.captured.lock().unwrap() = Some(graph.to_json());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capturing"
    }
}

#[tokio::test]
async fn test_graph_export_hook_receives_final_graph() {
    let captured = Arc::new(Mutex::new(None));

    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);

    let initial = ChildSpec::new("echo", "payload").with_capability(Capability::DeterministicExecute);
    let report = RunBuilder::new(RunConfig::default(), registry)
        .with_exporter(CapturingExporter {
            captured: captured.clone(),
        })
        .submit(initial)
        .await_result()
        .await;

    assert_eq!(report.status, RunStatus::NaturalConvergence);
    let exported = captured.lock().unwrap().clone().expect("graph exported");
    assert_eq!(exported["nodes"].as_object().unwrap().len(), 1);
}
