use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::SearchError;
use crate::searcher::SearchBackend;
use crate::types::{BackendStatus, SearchOutcome};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<SearchBackend>,
    pub config: Arc<AppConfig>,
    /// `/shutdown` 通过它通知服务退出
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(backend: Arc<SearchBackend>, config: AppConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/search", get(search_get).post(search_post))
        .route("/status", get(status))
        .route("/api/search/:query", get(api_search))
        .route("/shutdown", get(shutdown))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 启动 HTTP 服务，直到收到 Ctrl+C、SIGTERM 或 `/shutdown`
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let notify = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(notify))
        .await
}

pub async fn shutdown_signal(notify: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，正在关闭服务"),
        _ = terminate => info!("收到终止信号，正在关闭服务"),
        _ = notify.notified() => info!("收到关闭请求，正在关闭服务"),
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    max: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    query: Option<String>,
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    limit: Option<String>,
}

/// 数量参数宽松解析，无法解析时按未指定处理
fn parse_count(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|s| s.trim().parse().ok())
}

/// 搜索会调用子进程或 FFI，放到阻塞线程池执行
async fn run_search(
    state: &AppState,
    query: String,
    max_results: usize,
) -> Result<(SearchOutcome, BackendStatus), SearchError> {
    let backend = state.backend.clone();
    tokio::task::spawn_blocking(move || {
        let outcome = backend.search(&query, max_results)?;
        Ok::<_, SearchError>((outcome, backend.status()))
    })
    .await
    .map_err(|e| SearchError::query_failed(format!("搜索任务异常结束: {}", e)))?
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

async fn handle_search(state: AppState, query: Option<String>, requested: Option<usize>) -> Response {
    let query = query.unwrap_or_default();
    if query.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "请提供搜索查询");
    }
    let max_results = state.config.clamp_max_results(requested);

    match run_search(&state, query.clone(), max_results).await {
        Ok((outcome, status)) => Json(json!({
            "success": true,
            "query": query,
            "displayed_count": outcome.records.len(),
            "total_count": outcome.total_matched,
            "results": outcome.records,
            "demo_mode": status.demo_mode,
            "search_engine": status.label,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn search_get(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let requested = parse_count(params.max.as_deref());
    handle_search(state, params.q, requested).await
}

async fn search_post(State(state): State<AppState>, Json(body): Json<SearchBody>) -> Response {
    handle_search(state, body.query, body.max_results).await
}

async fn api_search(
    State(state): State<AppState>,
    Path(query): Path<String>,
    Query(params): Query<LimitParams>,
) -> Response {
    let limit = state
        .config
        .clamp_max_results(parse_count(params.limit.as_deref()));

    match run_search(&state, query.clone(), limit).await {
        Ok((outcome, status)) => Json(json!({
            "query": query,
            "results": outcome.records,
            "total": outcome.total_matched,
            "limit": limit,
            "demo_mode": status.demo_mode,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn current_status(state: &AppState) -> Option<BackendStatus> {
    let backend = state.backend.clone();
    tokio::task::spawn_blocking(move || backend.status()).await.ok()
}

async fn status(State(state): State<AppState>) -> Response {
    match current_status(&state).await {
        Some(status) => Json(json!({
            "success": true,
            "search_engine": status.label,
            "tier": status.tier,
            "demo_mode": status.demo_mode,
            // 旧版客户端读取此字段；任何真实后端在用时为 true
            "everything_running": !status.demo_mode,
            "message": status.message,
        }))
        .into_response(),
        None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "无法获取后端状态"),
    }
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    let engine = state.backend.active_tier().map(|t| t.label());
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "search_engine": engine,
        "endpoints": ["/search?q=", "/status", "/api/search/{query}?limit=", "/shutdown"],
    }))
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    // notify_one 会保留许可，即使关闭逻辑尚未开始等待
    state.shutdown.notify_one();
    Json(json!({ "message": "服务正在关闭" }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "找不到请求的资源" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn demo_state() -> AppState {
        AppState::new(Arc::new(SearchBackend::new(Vec::new())), AppConfig::default())
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_get_search() {
        let (status, body) = send(router(demo_state()), get_req("/search?q=*.txt&max=2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["displayed_count"], 2);
        assert_eq!(body["total_count"], 3);
        assert_eq!(body["demo_mode"], true);
        assert_eq!(body["search_engine"], "Demo");
        assert_eq!(body["results"][0]["extension"], "txt");
    }

    #[tokio::test]
    async fn test_post_search() {
        let req = Request::builder()
            .method("POST")
            .uri("/search")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "report", "max_results": 10}"#))
            .unwrap();
        let (status, body) = send(router(demo_state()), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["filename"], "report.docx");
    }

    #[tokio::test]
    async fn test_empty_query_is_bad_request() {
        let (status, body) = send(router(demo_state()), get_req("/search?q=")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_status() {
        let (status, body) = send(router(demo_state()), get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["search_engine"], "Demo");
        assert_eq!(body["demo_mode"], true);
        assert_eq!(body["everything_running"], false);
    }

    struct AlwaysUp;

    impl crate::searcher::SearchProvider for AlwaysUp {
        fn tier(&self) -> crate::types::BackendTier {
            crate::types::BackendTier::FilesystemTool
        }

        fn is_available(&self) -> bool {
            true
        }

        fn search(&self, _query: &crate::types::SearchQuery) -> Result<SearchOutcome, SearchError> {
            Ok(SearchOutcome::empty())
        }
    }

    #[tokio::test]
    async fn test_status_reports_real_backend_running() {
        let providers: Vec<Box<dyn crate::searcher::SearchProvider>> = vec![Box::new(AlwaysUp) as _];
        let backend = SearchBackend::new(providers);
        let state = AppState::new(Arc::new(backend), AppConfig::default());
        let (status, body) = send(router(state), get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["search_engine"], "FilesystemTool");
        assert_eq!(body["demo_mode"], false);
        assert_eq!(body["everything_running"], true);
    }

    #[tokio::test]
    async fn test_api_search_clamps_limit() {
        let (status, body) = send(router(demo_state()), get_req("/api/search/py?limit=100000")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 500);
        assert_eq!(body["query"], "py");
        assert_eq!(body["total"], 4);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let (status, body) = send(router(demo_state()), get_req("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_shutdown_notifies() {
        let state = demo_state();
        let notify = state.shutdown.clone();
        let (status, _) = send(router(state), get_req("/shutdown")).await;
        assert_eq!(status, StatusCode::OK);
        // 许可已保留，立即返回
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
