//! Lexgate 演示服务
//!
//! 配置来自环境变量（或 `LEXGATE_CONFIG` 指向的 YAML/TOML 文件）。
//! 设置 `DATABASE_URL` 且启用 `postgres` 特性时使用 PostgreSQL 持久层，
//! 否则只使用内存降级层。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lexgate::{
    gate, init_tracing, AuthenticatedUser, DecisionChainBuilder, DoubleSubmitCsrf, Feature,
    GateConfig, GateState, Governor, MemoryStorage, QuotaController, RateLimitStore,
    RouteRequirements, TelemetryConfig, UsageStore,
};
use serde_json::json;
use tracing::{error, info, warn};

type Stores = (Option<Arc<dyn RateLimitStore>>, Arc<dyn UsageStore>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = load_config()?;
    let (rate_store, usage_store) = build_stores(&config).await;

    let chain = DecisionChainBuilder::from_config(&config.rate_limit, rate_store);
    let quota = QuotaController::new(usage_store.clone(), config.quota.clone());
    let governor = Arc::new(Governor::new(
        config.rate_limit.clone(),
        Arc::new(chain),
        Arc::new(quota),
        Arc::new(DoubleSubmitCsrf::default()),
    )?);
    let sweeper = governor.spawn_sweeper(config.rate_limit.sweep_interval());

    let app = router(governor, usage_store);

    let addr: SocketAddr = std::env::var("LEXGATE_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("服务已启动: {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("服务已停止");
    Ok(())
}

fn load_config() -> anyhow::Result<GateConfig> {
    match std::env::var("LEXGATE_CONFIG") {
        Ok(path) => {
            let mut config = GateConfig::from_file(&path)?;
            config.apply_env(|name| std::env::var(name).ok())?;
            Ok(config)
        }
        Err(_) => Ok(GateConfig::from_env()?),
    }
}

#[cfg(feature = "postgres")]
async fn build_stores(config: &GateConfig) -> Stores {
    use lexgate::{PostgresStorage, PostgresStorageConfig};

    let Some(pg_config) = PostgresStorageConfig::from_storage_config(&config.storage) else {
        warn!("未设置 DATABASE_URL，使用内存存储");
        return memory_stores();
    };

    let pg_config = pg_config.query_timeout(config.rate_limit.durable_timeout());
    // 延迟连接：启动时数据库不可达也保留持久层，限流链按次降级，数据库恢复后自动回到持久层
    let storage = match PostgresStorage::connect_lazy(pg_config) {
        Ok(storage) => storage,
        Err(e) => {
            error!("DATABASE_URL 无效，使用内存存储: {}", e);
            return memory_stores();
        }
    };
    if let Err(e) = storage.ensure_schema().await {
        warn!("建表失败，继续运行: {}", e);
    }

    let storage = Arc::new(storage);
    let rate_store: Arc<dyn RateLimitStore> = storage.clone();
    (Some(rate_store), storage)
}

#[cfg(not(feature = "postgres"))]
async fn build_stores(config: &GateConfig) -> Stores {
    if config.storage.database_url.is_some() {
        warn!("已设置 DATABASE_URL，但未启用 postgres 特性");
    }
    memory_stores()
}

fn memory_stores() -> Stores {
    (None, Arc::new(MemoryStorage::new()))
}

#[derive(Clone)]
struct DemoState {
    usage_store: Arc<dyn UsageStore>,
}

fn router(governor: Arc<Governor>, usage_store: Arc<dyn UsageStore>) -> Router {
    let feature_layer = |feature: Feature| {
        middleware::from_fn_with_state(
            GateState::new(governor.clone()).require(RouteRequirements::feature(feature)),
            gate,
        )
    };

    Router::new()
        .route(
            "/health",
            get(health).route_layer(middleware::from_fn_with_state(
                GateState::new(governor.clone()),
                gate,
            )),
        )
        .route(
            "/api/assistant",
            post(assistant).route_layer(feature_layer(Feature::AiAssistant)),
        )
        .route("/api/crm", get(crm).route_layer(feature_layer(Feature::Crm)))
        .route(
            "/api/research",
            get(research).route_layer(feature_layer(Feature::Research)),
        )
        .layer(middleware::from_fn_with_state(
            DemoState { usage_store },
            demo_auth,
        ))
}

/// 演示用认证：信任 `x-user-id` 头，并在首次出现时创建免费层档案
async fn demo_auth(State(state): State<DemoState>, mut req: Request<Body>, next: Next) -> Response {
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if let Some(user_id) = user_id {
        if let Err(e) = state.usage_store.ensure_profile(&user_id).await {
            error!("创建用户档案失败: user={}, error={}", user_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "code": "internal_error" })),
            )
                .into_response();
        }
        req.extensions_mut().insert(AuthenticatedUser(user_id));
    }

    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn assistant() -> impl IntoResponse {
    Json(json!({ "ok": true, "answer": "Draft reply from the assistant." }))
}

async fn crm() -> impl IntoResponse {
    Json(json!({ "ok": true, "clients": [] }))
}

async fn research() -> impl IntoResponse {
    Json(json!({ "ok": true, "results": [] }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听关闭信号: {}", e);
    }
}
