//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 匹配器模块
//!
//! 从请求中提取限流所用的调用方标识：
//! - 已认证用户：`user:<id>`
//! - 匿名调用方：`ip:<addr>`，取转发头中的第一个值；无法识别时使用 `"unknown"`
//!
//! 所有无法识别的客户端共享同一个 `ip:unknown` 桶，这是可接受的不精确。

use crate::constants::{DEFAULT_FORWARDED_HEADER, IP_KEY_PREFIX, UNKNOWN_IP, USER_KEY_PREFIX};
use ahash::AHashMap as HashMap;

// ============================================================================
// 标识符
// ============================================================================

/// 调用方标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// 已认证用户ID
    User(String),
    /// 客户端IP
    Ip(String),
}

impl Identifier {
    /// 获取标识符的字符串表示
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::User(s) => s,
            Identifier::Ip(s) => s,
        }
    }

    /// 获取标识符类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            Identifier::User(_) => "user",
            Identifier::Ip(_) => "ip",
        }
    }

    /// 带类型前缀的限流键
    pub fn key(&self) -> String {
        match self {
            Identifier::User(id) => format!("{}{}", USER_KEY_PREFIX, id),
            Identifier::Ip(ip) => format!("{}{}", IP_KEY_PREFIX, ip),
        }
    }

    /// 是否为已认证用户
    pub fn is_user(&self) -> bool {
        matches!(self, Identifier::User(_))
    }
}

// ============================================================================
// 请求上下文
// ============================================================================

/// HTTP请求上下文
///
/// 与框架无关的请求表示，包含判定所需的信息。
#[derive(Clone, Default)]
pub struct RequestContext {
    /// 已认证用户ID（由上游认证层填充）
    pub user_id: Option<String>,
    /// HTTP头（键为小写）
    pub headers: HashMap<String, String>,
    /// 请求路径
    pub path: String,
    /// 请求方法（大写）
    pub method: String,
    /// 连接层的客户端IP
    pub client_ip: Option<String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 脱敏 headers
        let headers: HashMap<&str, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let v = if k.contains("auth") || k.contains("cookie") || k.contains("token") {
                    "***"
                } else {
                    v.as_str()
                };
                (k.as_str(), v)
            })
            .collect();

        f.debug_struct("RequestContext")
            .field("user_id", &self.user_id)
            .field("headers", &headers)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加HTTP头
    ///
    /// 同名头重复出现时按出现顺序合并：`cookie` 以 `"; "` 连接，其他头以 `", "` 连接。
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        let key = key.to_lowercase();
        let separator = if key == "cookie" { "; " } else { ", " };
        self.headers
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        self
    }

    /// 设置客户端IP
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    /// 设置已认证用户
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// 设置请求方法
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_uppercase();
        self
    }

    /// 设置请求路径
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_lowercase())
    }

    /// 是否为会修改状态的方法
    pub fn is_mutating(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
    }
}

// ============================================================================
// 标识符提取器
// ============================================================================

/// 标识符提取器 trait
pub trait IdentifierExtractor: Send + Sync {
    /// 从请求上下文中提取标识符
    ///
    /// # 返回
    /// - `Some(identifier)`: 成功提取标识符
    /// - `None`: 无法提取标识符
    fn extract(&self, context: &RequestContext) -> Option<Identifier>;

    /// 获取提取器名称
    fn name(&self) -> &str;
}

/// 用户ID提取器
///
/// 读取上游认证层写入的用户ID，不信任客户端提供的任何头。
#[derive(Debug, Default, Clone, Copy)]
pub struct UserIdExtractor;

impl IdentifierExtractor for UserIdExtractor {
    fn extract(&self, context: &RequestContext) -> Option<Identifier> {
        context
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| Identifier::User(id.to_string()))
    }

    fn name(&self) -> &str {
        "UserIdExtractor"
    }
}

/// IP提取器
///
/// 依次尝试转发头中的第一个值、连接层IP，最后退回 `"unknown"`，因此总能返回标识符。
#[derive(Debug, Clone)]
pub struct IpExtractor {
    /// 转发头名称（小写）
    header_name: String,
}

impl IpExtractor {
    /// 创建从指定转发头提取的IP提取器
    ///
    /// # 示例
    /// ```rust
    /// use lexgate::matchers::{IdentifierExtractor, IpExtractor, RequestContext};
    ///
    /// let extractor = IpExtractor::from_header("X-Forwarded-For");
    /// let ctx = RequestContext::new().with_header("x-forwarded-for", "203.0.113.7, 10.0.0.1");
    /// assert_eq!(extractor.extract(&ctx).unwrap().key(), "ip:203.0.113.7");
    /// ```
    pub fn from_header(header_name: &str) -> Self {
        Self {
            header_name: header_name.to_lowercase(),
        }
    }

    /// 取逗号分隔列表中的第一个非空值
    fn first_value(value: &str) -> Option<&str> {
        value
            .split(',')
            .map(str::trim)
            .next()
            .filter(|s| !s.is_empty())
    }

    /// 解析客户端IP，总是返回一个值
    pub fn client_ip(&self, context: &RequestContext) -> String {
        if let Some(ip) = context
            .get_header(&self.header_name)
            .and_then(|v| Self::first_value(v))
        {
            return ip.to_string();
        }

        context
            .client_ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .unwrap_or(UNKNOWN_IP)
            .to_string()
    }
}

impl Default for IpExtractor {
    fn default() -> Self {
        Self::from_header(DEFAULT_FORWARDED_HEADER)
    }
}

impl IdentifierExtractor for IpExtractor {
    fn extract(&self, context: &RequestContext) -> Option<Identifier> {
        Some(Identifier::Ip(self.client_ip(context)))
    }

    fn name(&self) -> &str {
        "IpExtractor"
    }
}

/// 组合提取器
///
/// 按顺序尝试每个提取器，返回第一个成功的结果。
pub struct CompositeExtractor {
    /// 提取器列表（按优先级顺序）
    extractors: Vec<Box<dyn IdentifierExtractor>>,
}

impl CompositeExtractor {
    /// 创建新的组合提取器
    pub fn new(extractors: Vec<Box<dyn IdentifierExtractor>>) -> Self {
        Self { extractors }
    }

    /// 标准组合：已认证用户优先，其次是IP
    pub fn user_then_ip(forwarded_header: &str) -> Self {
        Self::new(vec![
            Box::new(UserIdExtractor),
            Box::new(IpExtractor::from_header(forwarded_header)),
        ])
    }

    /// 添加提取器
    pub fn add_extractor(mut self, extractor: Box<dyn IdentifierExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }
}

impl Default for CompositeExtractor {
    fn default() -> Self {
        Self::user_then_ip(DEFAULT_FORWARDED_HEADER)
    }
}

impl IdentifierExtractor for CompositeExtractor {
    fn extract(&self, context: &RequestContext) -> Option<Identifier> {
        self.extractors.iter().find_map(|e| e.extract(context))
    }

    fn name(&self) -> &str {
        "CompositeExtractor"
    }
}

// ============================================================================
// 单元测试
// ============================================================================
