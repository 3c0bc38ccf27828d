use crate::app::AppState;
use crate::error::AppResult;
use crate::relay::chat::{ChatTextAdapter, chat_events};
use crate::relay::responses::{ResponsesTextAdapter, responses_events};
use crate::relay::{cancellable, relay_body, text_stream_response};
use crate::request::{parse_chat, parse_prompt, parse_structured};
use crate::structured::run_structured_request;
use crate::upstream::HfClient;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub const ROUTES: [&str; 3] = ["/chat", "/responses", "/structured"];

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "defaultModel": state.config.default_model,
        "baseUrl": state.config.base_url,
        "credentialConfigured": state.config.has_credential(),
        "routes": ROUTES,
    }))
}

/// Credential first, then the body: a missing key is reported even for
/// malformed requests.
fn client(state: &AppState, route: &'static str) -> AppResult<HfClient> {
    metrics::counter!("hfstream_requests_total", "route" => route).increment(1);
    HfClient::from_config(state.http.clone(), &state.config).inspect_err(|_| {
        tracing::error!(route, "HF_TOKEN is not configured");
    })
}

pub async fn chat(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let client = client(&state, "chat")?;
    let req = parse_chat(&body, &state.config)?;
    tracing::info!(model = %req.model, messages = req.messages.len(), "chat stream requested");

    let upstream = client
        .stream_chat_completions(&json!({
            "model": req.model,
            "messages": req.messages,
        }))
        .await?;
    let (events, cancel) = cancellable(chat_events(upstream));
    let body = relay_body("chat", events, ChatTextAdapter, cancel);
    Ok(text_stream_response(body))
}

pub async fn responses(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let client = client(&state, "responses")?;
    let req = parse_prompt(&body, &state.config)?;
    tracing::info!(model = %req.model, "responses stream requested");

    let upstream = client
        .stream_responses(&json!({
            "model": req.model,
            "input": req.prompt,
        }))
        .await?;
    let (events, cancel) = cancellable(responses_events(upstream));
    let body = relay_body(
        "responses",
        events,
        ResponsesTextAdapter::default(),
        cancel,
    );
    Ok(text_stream_response(body))
}

pub async fn structured(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let client = client(&state, "structured")?;
    let req = parse_structured(&body, &state.config)?;
    tracing::info!(model = %req.model, mode = req.mode.as_str(), "structured output requested");

    let result = run_structured_request(&client, &req).await?;
    tracing::debug!(
        used_schema = result.meta.used_schema,
        parsed = result.data.is_some(),
        "structured output resolved"
    );
    Ok(Json(result).into_response())
}
