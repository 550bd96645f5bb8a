//! 可观测性
//!
//! tracing 初始化：默认 info 级别，可用 RUST_LOG 覆盖。
//! 派发审计日志（dispatch_audit）由监督循环以结构化 JSON 字段输出，经此处的 fmt 层落地。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 测试或多运行并存场景：已有全局订阅者时静默返回
pub fn try_init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .try_init();
}
