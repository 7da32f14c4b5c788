//! 配置模块
//!
//! 定义限流与配额守卫的配置结构，支持从 YAML/TOML 文件加载以及环境变量覆盖。

use crate::constants::*;
use crate::error::GateError;
use secrecy::Secret;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// 网关配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GateConfig {
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub storage: StorageConfig,
}

impl GateConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        self.rate_limit
            .validate()
            .map_err(|e| format!("rate_limit: {}", e))?;
        self.quota.validate().map_err(|e| format!("quota: {}", e))?;
        self.storage
            .validate()
            .map_err(|e| format!("storage: {}", e))?;
        Ok(())
    }

    /// 从文件加载配置（根据扩展名选择 YAML 或 TOML）
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| GateError::ConfigError("无法确定配置文件类型".to_string()))?;

        let config: GateConfig = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            _ => {
                return Err(GateError::ConfigError(format!(
                    "不支持的配置文件类型: {}",
                    extension
                )))
            }
        };

        config.validate().map_err(GateError::ConfigError)?;
        info!("已从文件加载配置: {}", path.display());
        Ok(config)
    }

    /// 从进程环境变量加载配置
    ///
    /// 缺少 `DATABASE_URL` 不是错误：此时只启用内存降级层。
    pub fn from_env() -> Result<Self, GateError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// 使用给定的查找函数覆盖配置项
    ///
    /// 识别的变量：
    /// - `LEXGATE_USER_RATE_LIMIT` / `LEXGATE_IP_RATE_LIMIT` / `LEXGATE_RATE_WINDOW_SECS`
    /// - `LEXGATE_FALLBACK_LIMIT_PERCENT` / `LEXGATE_DURABLE_TIMEOUT_MS`
    /// - `LEXGATE_SWEEP_INTERVAL_SECS` / `LEXGATE_FORWARDED_HEADER`
    /// - `LEXGATE_TRIAL_DAYS` / `LEXGATE_FREE_QUERY_LIMIT`
    /// - `DATABASE_URL` / `LEXGATE_DB_MAX_CONNECTIONS` / `LEXGATE_DB_CONNECT_TIMEOUT_SECS`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), GateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rl = &mut self.rate_limit;
        parse_into(&lookup, "LEXGATE_USER_RATE_LIMIT", &mut rl.user_limit)?;
        parse_into(&lookup, "LEXGATE_IP_RATE_LIMIT", &mut rl.ip_limit)?;
        parse_into(&lookup, "LEXGATE_RATE_WINDOW_SECS", &mut rl.window_secs)?;
        parse_into(
            &lookup,
            "LEXGATE_FALLBACK_LIMIT_PERCENT",
            &mut rl.fallback_limit_percent,
        )?;
        parse_into(
            &lookup,
            "LEXGATE_DURABLE_TIMEOUT_MS",
            &mut rl.durable_timeout_ms,
        )?;
        parse_into(
            &lookup,
            "LEXGATE_SWEEP_INTERVAL_SECS",
            &mut rl.sweep_interval_secs,
        )?;
        if let Some(header) = lookup("LEXGATE_FORWARDED_HEADER") {
            rl.forwarded_header = header.to_lowercase();
        }

        parse_into(&lookup, "LEXGATE_TRIAL_DAYS", &mut self.quota.trial_days)?;
        parse_into(
            &lookup,
            "LEXGATE_FREE_QUERY_LIMIT",
            &mut self.quota.free_query_limit,
        )?;

        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.storage.database_url = Some(Secret::new(url));
        }
        parse_into(
            &lookup,
            "LEXGATE_DB_MAX_CONNECTIONS",
            &mut self.storage.max_connections,
        )?;
        parse_into(
            &lookup,
            "LEXGATE_DB_CONNECT_TIMEOUT_SECS",
            &mut self.storage.connect_timeout_secs,
        )?;

        self.validate().map_err(GateError::ConfigError)?;
        debug!(
            "环境变量配置已应用: durable={}",
            self.storage.database_url.is_some()
        );
        Ok(())
    }
}

fn parse_into<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), GateError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| GateError::ConfigError(format!("环境变量 {} 的值无效: {}", name, raw)))?;
    }
    Ok(())
}

/// 限流配置
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 已认证用户的窗口请求上限
    pub user_limit: u64,
    /// 匿名 IP 的窗口请求上限
    pub ip_limit: u64,
    /// 窗口大小（秒）
    pub window_secs: u64,
    /// 内存降级层使用的上限百分比（1-100）
    pub fallback_limit_percent: u8,
    /// 持久层操作超时（毫秒）
    pub durable_timeout_ms: u64,
    /// 过期计数清理间隔（秒）
    pub sweep_interval_secs: u64,
    /// 转发头名称
    pub forwarded_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            user_limit: DEFAULT_USER_RATE_LIMIT,
            ip_limit: DEFAULT_IP_RATE_LIMIT,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            fallback_limit_percent: DEFAULT_FALLBACK_LIMIT_PERCENT,
            durable_timeout_ms: DEFAULT_DURABLE_TIMEOUT_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            forwarded_header: DEFAULT_FORWARDED_HEADER.to_string(),
        }
    }
}

impl RateLimitConfig {
    /// 校验限流配置
    pub fn validate(&self) -> Result<(), String> {
        if self.user_limit == 0 || self.ip_limit == 0 {
            return Err("限流上限必须大于0".to_string());
        }
        if self.window_secs == 0 {
            return Err("窗口大小必须大于0".to_string());
        }
        if self.fallback_limit_percent == 0 || self.fallback_limit_percent > 100 {
            return Err(format!(
                "降级上限百分比必须在1-100之间: {}",
                self.fallback_limit_percent
            ));
        }
        if self.durable_timeout_ms == 0 {
            return Err("持久层超时必须大于0".to_string());
        }
        if self.forwarded_header.is_empty() {
            return Err("转发头名称不能为空".to_string());
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// 配额配置
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// 免费试用天数
    pub trial_days: i64,
    /// 免费层累计查询上限
    pub free_query_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            trial_days: DEFAULT_TRIAL_DAYS,
            free_query_limit: DEFAULT_FREE_QUERY_LIMIT,
        }
    }
}

impl QuotaConfig {
    /// 校验配额配置
    pub fn validate(&self) -> Result<(), String> {
        if self.trial_days <= 0 {
            return Err("试用天数必须大于0".to_string());
        }
        if self.free_query_limit == 0 {
            return Err("免费查询上限必须大于0".to_string());
        }
        Ok(())
    }
}

/// 存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 数据库连接URL（使用 Secret 包装以防止意外泄露）；为空时只使用内存降级层
    pub database_url: Option<Secret<String>>,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl StorageConfig {
    /// 校验存储配置
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("最大连接数必须大于0".to_string());
        }
        Ok(())
    }
}
