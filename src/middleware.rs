//! HTTP 中间件
//!
//! 基于 axum 的 `from_fn_with_state` 中间件，把 [`Governor`] 接到路由上。
//!
//! ```rust,no_run
//! use axum::{middleware, routing::post, Router};
//! use lexgate::governor::{Governor, RouteRequirements};
//! use lexgate::middleware::{gate, GateState};
//! use lexgate::quota_controller::Feature;
//! use std::sync::Arc;
//!
//! fn routes(governor: Arc<Governor>) -> Router {
//!     Router::new()
//!         .route("/api/assistant", post(|| async { "ok" }))
//!         .route_layer(middleware::from_fn_with_state(
//!             GateState::new(governor).require(RouteRequirements::feature(Feature::AiAssistant)),
//!             gate,
//!         ))
//! }
//! ```

use crate::governor::{Decision, Governor, Rejection, RouteRequirements};
use crate::matchers::{Identifier, RequestContext};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// 上游认证层写入请求扩展的用户标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// 中间件状态
#[derive(Clone)]
pub struct GateState {
    governor: Arc<Governor>,
    requirements: RouteRequirements,
}

impl GateState {
    /// 创建公开路由的中间件状态
    pub fn new(governor: Arc<Governor>) -> Self {
        Self {
            governor,
            requirements: RouteRequirements::public(),
        }
    }

    /// 设置路由要求
    pub fn require(mut self, requirements: RouteRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// 错误响应体
#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    code: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    retry_after_secs: Option<u64>,
) -> Response {
    let mut response = (
        status,
        Json(ErrorBody {
            ok: false,
            code,
            message,
            retry_after_secs,
        }),
    )
        .into_response();

    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::FORBIDDEN);
        error_response(status, self.code(), self.message(), self.retry_after_secs())
    }
}

/// 从 axum 请求构建请求上下文
pub fn request_context(req: &Request<Body>) -> RequestContext {
    let mut ctx = RequestContext::new()
        .with_method(req.method().as_str())
        .with_path(req.uri().path());

    // 同名头的多行按顺序交给 with_header 合并
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_header(name.as_str(), value);
        }
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        ctx = ctx.with_client_ip(&addr.ip().to_string());
    }

    if let Some(AuthenticatedUser(user_id)) = req.extensions().get::<AuthenticatedUser>() {
        ctx = ctx.with_user(user_id);
    }

    ctx
}

/// 限流、CSRF、认证与配额中间件
///
/// 受配额控制的路由在业务返回 2xx 后记录一次用量；记录失败返回 500。
pub async fn gate(State(state): State<GateState>, req: Request<Body>, next: Next) -> Response {
    let ctx = request_context(&req);

    let identifier = match state.governor.check(&ctx, state.requirements).await {
        Ok(Decision::Allowed { identifier, .. }) => identifier,
        Ok(Decision::Rejected(rejection)) => return rejection.into_response(),
        Err(e) => {
            error!("请求检查失败: path={}, error={}", ctx.path, e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
                None,
            );
        }
    };

    let response = next.run(req).await;

    if let (Some(feature), Identifier::User(user_id)) = (state.requirements.feature, &identifier) {
        if response.status().is_success() {
            if let Err(e) = state.governor.record_success(user_id, feature).await {
                error!(
                    "用量记录失败: user={}, feature={}, error={}",
                    user_id, feature, e
                );
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "usage_tracking_failed",
                    "Failed to record usage",
                    None,
                );
            }
        }
    }

    response
}
