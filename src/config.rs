//! 运行配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWARM__*` 覆盖（双下划线表示嵌套，如 `SWARM__RUN__STRATEGY=dfs`）。
//! 所有配置仅在 `submit` 时读取一次，运行期间不热更新；每个 RunHandle 持有自己的一份拷贝。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::frontier::Strategy;

/// 运行配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub strategy: StrategySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub context: ContextSection,
}

/// [run] 段：策略、并发窗口与资源上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// 边界集弹出策略
    pub strategy: Strategy,
    /// 并发窗口大小（≥1）
    #[serde(default = "default_parallelism_level")]
    pub parallelism_level: usize,
    /// 迭代数上限
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// 墙钟时间上限（秒）；None 表示不限
    pub time_limit_secs: Option<u64>,
    /// token 预算；None 表示不限
    pub token_budget: Option<u64>,
    /// 同一签名允许的重复访问次数
    #[serde(default = "default_state_revisit_limit")]
    pub state_revisit_limit: u32,
    /// 单任务处理器截止时间（秒）
    #[serde(default = "default_handler_deadline_secs")]
    pub handler_deadline_secs: u64,
    /// 强制终止后等待在途任务完成的宽限期（秒）
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// 任一分支失败即终止整个运行
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::Bfs,
            parallelism_level: default_parallelism_level(),
            max_iterations: default_max_iterations(),
            time_limit_secs: None,
            token_budget: None,
            state_revisit_limit: default_state_revisit_limit(),
            handler_deadline_secs: default_handler_deadline_secs(),
            grace_period_secs: default_grace_period_secs(),
            fail_fast: false,
        }
    }
}

fn default_parallelism_level() -> usize {
    3
}

fn default_max_iterations() -> u64 {
    200
}

fn default_state_revisit_limit() -> u32 {
    3
}

fn default_handler_deadline_secs() -> u64 {
    600
}

fn default_grace_period_secs() -> u64 {
    5
}

/// [strategy] 段：各策略的专属参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySection {
    /// Beam：每层保留的任务数
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    /// Hybrid：BFS 切换到 DFS 的深度阈值
    #[serde(default = "default_bfs_depth_threshold")]
    pub bfs_depth_threshold: u32,
    /// Iterative Deepening：首轮深度上限
    #[serde(default = "default_initial_depth_cap")]
    pub initial_depth_cap: u32,
    /// Iterative Deepening：深度上限的最大值
    #[serde(default = "default_max_depth_cap")]
    pub max_depth_cap: u32,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            beam_width: default_beam_width(),
            bfs_depth_threshold: default_bfs_depth_threshold(),
            initial_depth_cap: default_initial_depth_cap(),
            max_depth_cap: default_max_depth_cap(),
        }
    }
}

fn default_beam_width() -> usize {
    5
}

fn default_bfs_depth_threshold() -> u32 {
    3
}

fn default_initial_depth_cap() -> u32 {
    3
}

fn default_max_depth_cap() -> u32 {
    10
}

/// [retry] 段：瞬态错误的重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 最大尝试次数（含首次执行）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 指数退避基数（毫秒）：第 n 次重试前等待 backoff_base_ms * 2^(n-1)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

/// [routing] 段：处理器匹配阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// 处理器得分低于该值时拒绝路由（0.0–1.0）
    #[serde(default = "default_min_match_threshold")]
    pub min_match_threshold: f64,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            min_match_threshold: default_min_match_threshold(),
        }
    }
}

fn default_min_match_threshold() -> f64 {
    1.0
}

/// [convergence] 段：质量阈值与审批要求
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvergenceSection {
    /// 质量得分阈值；None 表示不检查质量
    pub quality_threshold: Option<f64>,
    /// 结束前必须取得人工审批
    pub require_approval: bool,
    /// 质量不达标时最多生成几轮细化任务；0 表示直接接受
    pub max_refinement_rounds: u32,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        Self {
            quality_threshold: None,
            require_approval: false,
            max_refinement_rounds: default_max_refinement_rounds(),
        }
    }
}

fn default_max_refinement_rounds() -> u32 {
    2
}

/// 升级链中的一级：目标处理器与该级超时
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationTier {
    /// 注册表中的处理器名
    pub handler_id: String,
    /// 本级等待响应的超时（秒）
    pub timeout_secs: u64,
}

impl EscalationTier {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 循环检测命中后的分支处置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopPolicy {
    /// 强制失败该分支
    #[default]
    Fail,
    /// 交给人工升级链裁决
    Escalate,
}

/// [escalation] 段：人工升级链与失败处置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EscalationSection {
    /// 有序升级链；空链表示不升级
    #[serde(default)]
    pub chain: Vec<EscalationTier>,
    /// 重试耗尽后是否转人工升级（否则标记失败）
    #[serde(default)]
    pub escalate_on_failure: bool,
    /// 循环检测命中后的处置
    #[serde(default)]
    pub loop_policy: LoopPolicy,
}

/// [context] 段：共享上下文裁剪
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// 快照保留的最近条目数；None 表示不裁剪
    pub keep_last: Option<usize>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            keep_last: Some(default_keep_last()),
        }
    }
}

fn default_keep_last() -> usize {
    64
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run: RunSection::default(),
            strategy: StrategySection::default(),
            retry: RetrySection::default(),
            routing: RoutingSection::default(),
            convergence: ConvergenceSection::default(),
            escalation: EscalationSection::default(),
            context: ContextSection::default(),
        }
    }
}

impl RunConfig {
    /// 单任务处理器截止时间
    pub fn handler_deadline(&self) -> Duration {
        Duration::from_secs(self.run.handler_deadline_secs)
    }

    /// 强制终止后的宽限期
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.run.grace_period_secs)
    }

    /// 墙钟时间上限
    pub fn time_limit(&self) -> Option<Duration> {
        self.run.time_limit_secs.map(Duration::from_secs)
    }
}

/// 从 config 目录加载配置，环境变量 SWARM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWARM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<RunConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWARM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
