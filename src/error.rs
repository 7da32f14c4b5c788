//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。
//!
//! 错误分类：
//! - 基础设施故障（[`StorageError`]）：在限流链内部被吞掉并降级到下一层，只记录警告。
//! - 滥用/过载：不是错误，而是 [`crate::governor::Rejection::RateLimited`]。
//! - 权益耗尽/用户缺失：不是错误，而是 [`crate::quota_controller::QuotaDecision`] 中的拒绝原因。

use thiserror::Error;

/// 网关错误类型
#[derive(Error, Debug)]
pub enum GateError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),

    /// 初始化错误
    #[error("初始化错误: {0}")]
    InitError(String),
}

impl GateError {
    /// 是否为基础设施（存储）故障
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, GateError::StorageError(_))
    }
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StorageError::QueryError(db_err.to_string()),
            sqlx::Error::PoolTimedOut => StorageError::TimeoutError("连接池超时".to_string()),
            sqlx::Error::PoolClosed => StorageError::ConnectionError("连接池已关闭".to_string()),
            sqlx::Error::RowNotFound => StorageError::NotFound("记录未找到".to_string()),
            sqlx::Error::Io(io_err) => StorageError::ConnectionError(io_err.to_string()),
            _ => StorageError::QueryError(err.to_string()),
        }
    }
}
