//! Axum read surface over the article collection.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use newsfeed_storage::{PersistenceError, QueryEngine};
use newsfeed_sync::{CycleReport, Scheduler};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use url::form_urlencoded;

pub const CRATE_NAME: &str = "newsfeed-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("NEWSFEED_WEB_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(8080);
        Self { port }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub query: QueryEngine,
    /// Absent when the process serves reads without ingesting.
    pub scheduler: Option<Arc<Scheduler>>,
}

impl AppState {
    pub fn new(query: QueryEngine) -> Self {
        Self {
            query,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl SearchRequest {
    /// Form bodies repeat the source field once per id, as `sources`,
    /// `sources[]` or `sources[N]`.
    pub fn from_form(body: &[u8]) -> Self {
        let mut request = Self::default();
        for (key, value) in form_urlencoded::parse(body) {
            match key.as_ref() {
                "keyword" => request.keyword = value.into_owned(),
                k if k == "sources" || (k.starts_with("sources[") && k.ends_with(']')) => {
                    request.sources.push(value.into_owned())
                }
                _ => {}
            }
        }
        request
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStatus {
    running: bool,
    cycle_in_flight: bool,
    last_report: Option<CycleReport>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/news", get(news_handler))
        .route("/search", post(search_handler))
        .route("/sync/status", get(sync_status_handler))
        .layer(CorsLayer::very_permissive())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves; in-flight requests are allowed to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "http surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http surface stopped");
    Ok(())
}

async fn news_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.query.list_all().await {
        Ok(articles) => Json(articles).into_response(),
        Err(err) => server_error(err),
    }
}

fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Accepts a JSON body or a urlencoded form carrying the same fields.
async fn search_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match media_type(&headers).as_str() {
        "application/x-www-form-urlencoded" => SearchRequest::from_form(&body),
        t if t == "application/json" || t.ends_with("+json") => {
            match serde_json::from_slice::<SearchRequest>(&body) {
                Ok(request) => request,
                Err(err) => {
                    return client_error(StatusCode::BAD_REQUEST, format!("invalid json body: {err}"))
                }
            }
        }
        other => {
            return client_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported content type `{other}`"),
            )
        }
    };
    match state.query.search(&request.keyword, request.sources).await {
        Ok(articles) => Json(articles).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    let status = match &state.scheduler {
        Some(scheduler) => SyncStatus {
            running: scheduler.is_running().await,
            cycle_in_flight: scheduler.is_cycle_in_flight().await,
            last_report: scheduler.last_report().await,
        },
        None => SyncStatus {
            running: false,
            cycle_in_flight: false,
            last_report: None,
        },
    };
    Json(status)
}

fn client_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: PersistenceError) -> Response {
    error!(error = %err, "article read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
