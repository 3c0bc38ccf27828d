use crate::config::Config;
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }

    /// A 400 from the provider is how it reports that it cannot honour a request
    /// shape, e.g. an unsupported `response_format`.
    pub fn is_bad_request(&self) -> bool {
        self.kind == UpstreamErrorKind::Http && self.status == Some(StatusCode::BAD_REQUEST)
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream {status}: {}", self.message),
            None => write!(f, "upstream {:?} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for UpstreamCallError {}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
        let message = if err.message.trim().is_empty() {
            "Upstream request failed.".to_string()
        } else {
            err.message
        };
        AppError::new(status, "upstream_error", message)
    }
}

/// Stateless handle on the inference router. Construction performs no I/O.
#[derive(Debug, Clone)]
pub struct HfClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HfClient {
    pub fn from_config(http: reqwest::Client, config: &Config) -> Result<Self, AppError> {
        let token = config
            .hf_token
            .clone()
            .ok_or_else(AppError::missing_credential)?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            token,
        })
    }

    pub async fn chat_completions(&self, body: &Value) -> Result<Value, UpstreamCallError> {
        self.call_json("/chat/completions", body).await
    }

    pub async fn responses(&self, body: &Value) -> Result<Value, UpstreamCallError> {
        self.call_json("/responses", body).await
    }

    pub async fn stream_chat_completions(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        self.call_stream("/chat/completions", body).await
    }

    pub async fn stream_responses(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        self.call_stream("/responses", body).await
    }

    async fn call_json(&self, path: &str, body: &Value) -> Result<Value, UpstreamCallError> {
        let resp = self.call_raw(path, body, false).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            tracing::warn!(path, %status, "upstream returned a non-JSON body");
            UpstreamCallError::new(UpstreamErrorKind::Decode, None, err.to_string())
        })
    }

    async fn call_stream(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let mut body = body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
        self.call_raw(path, &body, true).await
    }

    async fn call_raw(
        &self,
        path: &str,
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let url = join_url(&self.base_url, path);
        let mut req = self.http.post(&url).bearer_auth(&self.token).json(body);
        if stream {
            req = req.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        tracing::debug!(%url, stream, "calling upstream");
        let resp = req.send().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string())
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = extract_error_message(&text)
                .unwrap_or_else(|| fallback_error_message(status, &text));
            tracing::warn!(%url, %status, %message, "upstream rejected request");
            metrics::counter!("hfstream_upstream_errors_total", "status" => status.as_u16().to_string())
                .increment(1);
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                message,
            ));
        }
        Ok(resp)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Pulls a human-readable message out of a provider error body.
///
/// Accepts `{"error": {"message": ..}}`, `{"error": ".."}` and `{"message": ..}`.
pub fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let nested = value.get("error").and_then(|err| match err {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("message").and_then(|v| v.as_str()),
        _ => None,
    });
    nested
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn fallback_error_message(status: StatusCode, text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        format!("upstream status {}", status.as_u16())
    } else {
        text.to_string()
    }
}
