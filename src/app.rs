use crate::config::Config;
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, OnceLock};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Inbound bodies are a prompt or a short chat transcript.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

/// The recorder is process-global; every state built afterwards shares it.
static METRICS: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

pub fn load_state() -> AppResult<AppState> {
    load_state_with_config(Config::from_env())
}

pub fn load_state_with_config(config: Config) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("hfstream/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| AppError::internal(format!("http client init failed: {err}")))?;

    if !config.has_credential() {
        tracing::warn!("HF_TOKEN is not set; every route will answer 500");
    }

    Ok(AppState {
        config: Arc::new(config),
        http,
        metrics: init_metrics()?,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .map_err(|err| err.to_string())
        })
        .clone()
        .map_err(|message| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "metrics_init_failed",
                message,
            )
        })
}

pub fn build_app(state: AppState) -> Router {
    let api_router = build_api_router(&state.config.metrics_path);
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::handlers::chat))
        .route("/responses", post(crate::handlers::responses))
        .route("/structured", post(crate::handlers::structured))
        .route("/status", get(crate::handlers::status))
        .route(metrics_path, get(crate::handlers::metrics))
}
