//! 执行图
//!
//! 以初始任务为根的分解关系树，仅监督循环在结果集成时追加；构造上无环，
//! 循环检测命中的分支会留下显式的 CycleRecord 供诊断，从不静默放行。

use std::collections::HashMap;

use serde::Serialize;

use crate::core::task::{Task, TaskId, TaskStatus};

/// 图节点：任务的不可变快照 + 执行结局
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub task_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub objective: String,
    pub depth: u32,
    pub status: TaskStatus,
    /// 实际执行的处理器名
    pub handler: Option<String>,
    /// 完成时的结果摘要
    pub summary: Option<String>,
    /// 失败/升级失败时的错误描述
    pub error: Option<String>,
    pub created_at: i64,
}

/// 循环检测命中的记录
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    /// 提出该子任务的父任务
    pub parent_id: TaskId,
    /// 归一化签名
    pub signature: String,
    /// 第几次出现时被拒
    pub count: u32,
    pub recorded_at: i64,
}

/// 追加式执行图
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionGraph {
    root: Option<TaskId>,
    nodes: HashMap<TaskId, GraphNode>,
    children: HashMap<TaskId, Vec<TaskId>>,
    /// 插入顺序（遍历与渲染用）
    order: Vec<TaskId>,
    cycles: Vec<CycleRecord>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录根任务
    pub fn add_root(&mut self, task: &Task) {
        self.root = Some(task.id.clone());
        self.insert_node(task);
    }

    /// 记录分解出的子任务；边由 task.parent_id 决定
    pub fn add_child(&mut self, task: &Task) {
        if let Some(parent) = &task.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(task.id.clone());
        }
        self.insert_node(task);
    }

    fn insert_node(&mut self, task: &Task) {
        self.order.push(task.id.clone());
        self.nodes.insert(
            task.id.clone(),
            GraphNode {
                task_id: task.id.clone(),
                parent_id: task.parent_id.clone(),
                objective: task.objective.clone(),
                depth: task.depth,
                status: task.status,
                handler: None,
                summary: None,
                error: None,
                created_at: task.created_at,
            },
        );
    }

    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = status;
        }
    }

    /// 记录成功结局
    pub fn record_completion(&mut self, task_id: &str, handler: &str, summary: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Completed;
            node.handler = Some(handler.to_string());
            node.summary = Some(summary.to_string());
        }
    }

    /// 记录失败结局
    pub fn record_failure(&mut self, task_id: &str, status: TaskStatus, error: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = status;
            node.error = Some(error.to_string());
        }
    }

    /// 记录循环检测命中（被拒分支的诊断痕迹）
    pub fn record_cycle(&mut self, parent_id: &str, signature: &str, count: u32) {
        self.cycles.push(CycleRecord {
            parent_id: parent_id.to_string(),
            signature: signature.to_string(),
            count,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn node(&self, task_id: &str) -> Option<&GraphNode> {
        self.nodes.get(task_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn cycle_records(&self) -> &[CycleRecord] {
        &self.cycles
    }

    pub fn root_id(&self) -> Option<&TaskId> {
        self.root.as_ref()
    }

    /// 指定状态的节点数
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// 树的最大深度（根为 1；空图为 0）
    pub fn depth(&self) -> u32 {
        self.nodes.values().map(|n| n.depth + 1).max().unwrap_or(0)
    }

    /// JSON 导出（外部导出钩子的默认载荷）
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// ASCII 树渲染（诊断用）
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(root) = &self.root {
            self.render_node(root, 0, &mut out);
        }
        for cycle in &self.cycles {
            out.push_str(&format!(
                "[cycle] parent={} signature='{}' count={}\n",
                cycle.parent_id, cycle.signature, cycle.count
            ));
        }
        out
    }

    fn render_node(&self, task_id: &str, indent: usize, out: &mut String) {
        if let Some(node) = self.nodes.get(task_id) {
            out.push_str(&format!(
                "{}{} [{:?}] {}\n",
                "  ".repeat(indent),
                node.task_id,
                node.status,
                node.objective
            ));
        }
        if let Some(children) = self.children.get(task_id) {
            for child in children {
                self.render_node(child, indent + 1, out);
            }
        }
    }
}

/// 执行图导出钩子：持久化格式由外部协作方决定
pub trait GraphExporter: Send + Sync {
    fn export(&self, graph: &ExecutionGraph) -> anyhow::Result<()>;

    /// 导出器名称（用于日志）
    fn name(&self) -> &'static str;
}
