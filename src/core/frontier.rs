//! 边界集与策略选择
//!
//! Frontier 是待执行任务的有序多重集合，只持有成员资格与顺序；弹出顺序由 Strategy 决定。
//! 所有策略在相同的得分与插入顺序下完全确定，保证测试可重放。
//!
//! 策略语义：
//! - Bfs: FIFO；Dfs: LIFO
//! - BestFirst: 最高 priority，平手取最早插入
//! - AStar: 最小 cost_so_far + estimated_remaining，平手同上
//! - Beam: 按层 BFS，层推进时裁剪到 beam_width（被裁剪任务永久丢弃）
//! - Hybrid: 深度到达阈值前 BFS，之后不可逆地切换为 DFS
//! - IterativeDeepening: 带深度上限的 DFS，超限的 push 被拒并计数，供监督循环决定加深重启

use std::collections::HashSet;

use serde::Deserialize;

use crate::config::StrategySection;
use crate::core::error::OrchestratorError;
use crate::core::task::{Task, TaskId};

/// 边界集弹出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Bfs,
    Dfs,
    BestFirst,
    Astar,
    Beam,
    Hybrid,
    IterativeDeepening,
}

/// push 的结果：接受 / 已在边界集中 / 超出深度上限被拒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// 同一任务在边界集中最多出现一次
    Duplicate,
    /// Iterative Deepening 下超出当前深度上限
    DepthCapped,
    /// Beam 下当前层已满且得分不及在位者，永久丢弃
    BeamPruned,
}

struct Entry {
    seq: u64,
    task: Task,
}

/// 待执行任务容器
pub struct Frontier {
    strategy: Strategy,
    entries: Vec<Entry>,
    members: HashSet<TaskId>,
    next_seq: u64,
    beam_width: usize,
    bfs_depth_threshold: u32,
    /// Iterative Deepening 的当前深度上限
    depth_cap: Option<u32>,
    /// 本轮被深度上限拒绝的 push 数
    capped_pushes: u64,
    /// Hybrid 是否已切换到 DFS（不可逆）
    hybrid_flipped: bool,
    /// Beam 当前层深度
    beam_level: u32,
}

impl Frontier {
    pub fn new(strategy: Strategy, params: &StrategySection) -> Self {
        let depth_cap = match strategy {
            Strategy::IterativeDeepening => Some(params.initial_depth_cap),
            _ => None,
        };
        Self {
            strategy,
            entries: Vec::new(),
            members: HashSet::new(),
            next_seq: 0,
            beam_width: params.beam_width.max(1),
            bfs_depth_threshold: params.bfs_depth_threshold,
            depth_cap,
            capped_pushes: 0,
            hybrid_flipped: false,
            beam_level: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// 当前深度上限（仅 Iterative Deepening 有值）
    pub fn depth_cap(&self) -> Option<u32> {
        self.depth_cap
    }

    /// 本轮被深度上限拒绝的 push 数
    pub fn capped_pushes(&self) -> u64 {
        self.capped_pushes
    }

    /// 加入任务；重复成员与超限深度会被拒绝
    pub fn push(&mut self, task: Task) -> PushOutcome {
        if self.members.contains(&task.id) {
            return PushOutcome::Duplicate;
        }
        if let Some(cap) = self.depth_cap {
            if task.depth > cap {
                self.capped_pushes += 1;
                tracing::debug!(task_id = %task.id, depth = task.depth, cap, "push rejected by depth cap");
                return PushOutcome::DepthCapped;
            }
        }
        if self.strategy == Strategy::Beam && task.depth == self.beam_level && self.beam_level > 0 {
            // 当前层已裁剪过：竞争上岗，宽度之外按得分淘汰
            let level_count = self
                .entries
                .iter()
                .filter(|e| e.task.depth == self.beam_level)
                .count();
            if level_count >= self.beam_width {
                let weakest = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.task.depth == self.beam_level)
                    .min_by(|(_, a), (_, b)| {
                        a.task
                            .priority
                            .total_cmp(&b.task.priority)
                            .then(b.seq.cmp(&a.seq))
                    })
                    .map(|(i, e)| (i, e.task.priority));
                match weakest {
                    Some((idx, weakest_priority)) if task.priority > weakest_priority => {
                        let dropped = self.entries.remove(idx);
                        self.members.remove(&dropped.task.id);
                        tracing::debug!(task_id = %dropped.task.id, "beam level full, weakest task discarded");
                    }
                    _ => {
                        tracing::debug!(task_id = %task.id, "beam level full, push discarded");
                        return PushOutcome::BeamPruned;
                    }
                }
            }
        }
        self.members.insert(task.id.clone());
        self.entries.push(Entry {
            seq: self.next_seq,
            task,
        });
        self.next_seq += 1;
        PushOutcome::Accepted
    }

    /// 弹出下一个任务；空集返回 EmptyFrontier
    pub fn pop(&mut self) -> Result<Task, OrchestratorError> {
        if self.entries.is_empty() {
            return Err(OrchestratorError::EmptyFrontier);
        }

        let idx = match self.strategy {
            Strategy::Bfs => self.idx_min_seq(),
            Strategy::Dfs | Strategy::IterativeDeepening => self.idx_max_seq(),
            Strategy::BestFirst => self.idx_best_priority(),
            Strategy::Astar => self.idx_min_astar(),
            Strategy::Beam => {
                self.advance_beam_level();
                self.idx_min_seq()
            }
            Strategy::Hybrid => {
                if !self.hybrid_flipped {
                    let bfs_idx = self.idx_min_seq();
                    if self.entries[bfs_idx].task.depth >= self.bfs_depth_threshold {
                        self.hybrid_flipped = true;
                        tracing::info!(
                            threshold = self.bfs_depth_threshold,
                            "hybrid strategy crossed depth threshold, switching to depth-first"
                        );
                    }
                }
                if self.hybrid_flipped {
                    self.idx_max_seq()
                } else {
                    self.idx_min_seq()
                }
            }
        };

        let entry = self.entries.remove(idx);
        self.members.remove(&entry.task.id);
        Ok(entry.task)
    }

    /// 对所有待执行任务重新打分（Best-First / Beam 在得分漂移时使用）
    pub fn rescore_all(&mut self, f: impl Fn(&Task) -> f64) {
        for entry in &mut self.entries {
            entry.task.priority = f(&entry.task);
        }
    }

    /// Iterative Deepening：清空边界集并以新的深度上限重新开始
    pub fn reset_for_deepening(&mut self, new_cap: u32) {
        self.entries.clear();
        self.members.clear();
        self.capped_pushes = 0;
        self.depth_cap = Some(new_cap);
        tracing::info!(cap = new_cap, "frontier reset for deepening round");
    }

    /// Beam：所有浅于新层的任务都已弹出时推进层，并把新层裁剪到 beam_width
    fn advance_beam_level(&mut self) {
        let min_depth = match self.entries.iter().map(|e| e.task.depth).min() {
            Some(d) => d,
            None => return,
        };
        if min_depth <= self.beam_level {
            return;
        }
        self.beam_level = min_depth;

        let mut level_indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.task.depth == min_depth)
            .map(|(i, _)| i)
            .collect();
        if level_indices.len() <= self.beam_width {
            return;
        }
        // 得分降序、插入顺序升序；宽度之外永久丢弃
        level_indices.sort_by(|&a, &b| {
            self.entries[b]
                .task
                .priority
                .total_cmp(&self.entries[a].task.priority)
                .then(self.entries[a].seq.cmp(&self.entries[b].seq))
        });
        let pruned_ids: HashSet<TaskId> = level_indices[self.beam_width..]
            .iter()
            .map(|&i| self.entries[i].task.id.clone())
            .collect();
        for id in &pruned_ids {
            self.members.remove(id);
        }
        self.entries.retain(|e| !pruned_ids.contains(&e.task.id));
        tracing::debug!(
            level = min_depth,
            width = self.beam_width,
            discarded = pruned_ids.len(),
            "beam level pruned"
        );
    }

    fn idx_min_seq(&self) -> usize {
        // entries 按 seq 追加，最早插入即首位
        0
    }

    fn idx_max_seq(&self) -> usize {
        self.entries.len() - 1
    }

    fn idx_best_priority(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.task
                    .priority
                    .total_cmp(&b.task.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
            .expect("frontier checked non-empty")
    }

    fn idx_min_astar(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.task
                    .astar_cost()
                    .total_cmp(&b.task.astar_cost())
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)
            .expect("frontier checked non-empty")
    }
}
