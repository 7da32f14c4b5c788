//! 日志初始化模块
//!
//! 基于 `tracing-subscriber` 的日志输出，过滤规则优先读取 `RUST_LOG`。
//!
//! # 示例
//!
//! ```rust,no_run
//! use lexgate::telemetry::{init_tracing, TelemetryConfig};
//!
//! init_tracing(&TelemetryConfig::default()).unwrap();
//! tracing::info!("服务启动");
//! ```

use crate::error::GateError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// 未设置 `RUST_LOG` 时使用的过滤规则
    pub default_filter: String,
    /// 是否输出 target
    pub with_target: bool,
    /// 是否输出 ANSI 颜色
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info,lexgate=debug".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}

/// 构建过滤器
pub fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_filter))
}

/// 初始化全局日志
///
/// 全局订阅者只能设置一次，重复调用返回初始化错误。
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), GateError> {
    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(
            fmt::layer()
                .with_target(config.with_target)
                .with_ansi(config.ansi),
        )
        .try_init()
        .map_err(|e| GateError::InitError(format!("日志初始化失败: {}", e)))
}
