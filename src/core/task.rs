//! 任务模型
//!
//! Task 是编排核心的最小单元：对核心而言 objective/description 是不透明载荷，
//! 路由只看 required_capabilities，排序只看 priority / cost。状态与结果仅由监督循环变更。

use serde::{Deserialize, Serialize};

/// 任务 ID
pub type TaskId = String;

/// 执行能力标签：路由器按标签匹配处理器，新增能力类别无需改动路由逻辑
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// 快速分类
    FastClassify,
    /// 深度推理
    DeepReason,
    /// 外部检索
    ExternalLookup,
    /// 确定性执行
    DeterministicExecute,
    /// 人工裁决
    HumanJudgment,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 在边界集中等待
    Pending,
    /// 已派发给处理器
    Dispatched,
    /// 已完成（result 就位）
    Completed,
    /// 失败（重试耗尽 / 不可路由 / 循环检测命中）
    Failed,
    /// 已转人工升级链
    Escalated,
}

/// 任务实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务 ID（task_<uuid>）
    pub id: TaskId,
    /// 目标（不透明载荷）
    pub objective: String,
    /// 描述（不透明载荷）
    pub description: String,
    /// 父任务 ID（仅用于树重建，不是所有权边）
    pub parent_id: Option<TaskId>,
    /// 深度：父深度 + 1，根为 0
    pub depth: u32,
    /// 要求的执行能力
    pub required_capabilities: Vec<Capability>,
    /// 优先级得分（Best-First / Beam 使用）
    pub priority: f64,
    /// 已消耗成本（A* 使用）
    pub cost_so_far: f64,
    /// 预估剩余成本（A* 使用）
    pub estimated_remaining: f64,
    /// 状态
    pub status: TaskStatus,
    /// 结果摘要，仅完成后就位
    pub result: Option<String>,
    /// 已尝试次数
    pub attempts: u32,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl Task {
    /// 由调用方提交的根任务
    pub fn root(spec: ChildSpec) -> Self {
        Self::from_spec(spec, None, 0, 0.0)
    }

    /// 由分解产生的子任务：深度为父深度 + 1
    pub fn child_of(parent: &Task, spec: ChildSpec, cost_so_far: f64) -> Self {
        Self::from_spec(spec, Some(parent.id.clone()), parent.depth + 1, cost_so_far)
    }

    fn from_spec(spec: ChildSpec, parent_id: Option<TaskId>, depth: u32, cost_so_far: f64) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            objective: spec.objective,
            description: spec.description,
            parent_id,
            depth,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            cost_so_far,
            estimated_remaining: spec.estimated_remaining,
            status: TaskStatus::Pending,
            result: None,
            attempts: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A* 排序键
    pub fn astar_cost(&self) -> f64 {
        self.cost_so_far + self.estimated_remaining
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }
}

/// 分解出的子任务规格：处理器只描述「要做什么」，Task 的身份与深度由监督循环赋予
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub objective: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub estimated_remaining: f64,
}

impl ChildSpec {
    pub fn new(objective: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            description: description.into(),
            required_capabilities: Vec::new(),
            priority: 0.0,
            estimated_remaining: 0.0,
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.required_capabilities.push(cap);
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_remaining(mut self, estimate: f64) -> Self {
        self.estimated_remaining = estimate;
        self
    }
}

/// 处理器执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// 结果摘要（写入共享上下文）
    pub summary: String,
    /// 产出物
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// 分解出的子任务；空表示处理器放弃分解
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    /// 本次执行消耗的 token 数
    #[serde(default)]
    pub tokens_used: u64,
    /// 质量得分（0.0–1.0），供收敛判定
    #[serde(default)]
    pub quality: Option<f64>,
    /// 人工审批结论（仅人工裁决类处理器填写）
    #[serde(default)]
    pub approved: Option<bool>,
    /// 处理器自定义元数据（诊断用）
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn with_children(mut self, children: Vec<ChildSpec>) -> Self {
        self.children = children;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_approval(mut self, approved: bool) -> Self {
        self.approved = Some(approved);
        self
    }
}
