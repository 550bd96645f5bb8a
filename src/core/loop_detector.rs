//! 循环检测
//!
//! 对每个待入队的子任务计算归一化签名（剥离 uuid、十六进制 id、时间戳等易变字段），
//! 统计整个运行期间同一签名出现的次数；超过 state_revisit_limit 时拒绝入队并上报 LoopDetected。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::error::OrchestratorError;

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
    })
}

fn hex_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9a-f]{8,}\b").unwrap())
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // ISO 8601 或 10 位以上的毫秒/秒时间戳
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}[T ][\d:.+Zz]+|\b\d{10,}\b").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// 归一化任务签名：小写、剥离易变 token、折叠空白
pub fn normalize_signature(objective: &str, description: &str) -> String {
    let raw = format!("{} :: {}", objective, description).to_lowercase();
    let s = uuid_re().replace_all(&raw, "<id>");
    let s = timestamp_re().replace_all(&s, "<ts>");
    let s = hex_id_re().replace_all(&s, "<id>");
    whitespace_re().replace_all(&s, " ").trim().to_string()
}

/// 签名访问计数器，生命周期为一次运行
pub struct LoopDetector {
    limit: u32,
    visits: HashMap<String, u32>,
}

impl LoopDetector {
    pub fn new(state_revisit_limit: u32) -> Self {
        Self {
            limit: state_revisit_limit.max(1),
            visits: HashMap::new(),
        }
    }

    /// 审查一次入队请求：计数并在超限时拒绝
    pub fn admit(&mut self, objective: &str, description: &str) -> Result<(), OrchestratorError> {
        let signature = normalize_signature(objective, description);
        let count = self.visits.entry(signature.clone()).or_insert(0);
        *count += 1;
        if *count > self.limit {
            return Err(OrchestratorError::LoopDetected {
                signature,
                count: *count,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// 某签名的当前访问次数
    pub fn visit_count(&self, objective: &str, description: &str) -> u32 {
        self.visits
            .get(&normalize_signature(objective, description))
            .copied()
            .unwrap_or(0)
    }

    /// 清空计数（Iterative Deepening 重启时使用）
    pub fn reset(&mut self) {
        self.visits.clear();
    }
}
