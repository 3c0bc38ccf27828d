//! Validation and coercion of inbound JSON bodies into typed requests.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::structured::StructuredMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MISSING_MESSAGES: &str = "The request body must include messages.";
pub const INVALID_MESSAGE: &str =
    "Each message needs a role (user, system or assistant) and string content.";
pub const MISSING_PROMPT: &str = "Provide a prompt string.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub prompt: String,
    pub model: String,
    pub mode: StructuredMode,
}

/// Parses the raw body. Anything that is not JSON is rejected as `invalid_body`.
pub fn read_json(body: &[u8]) -> AppResult<Value> {
    serde_json::from_slice(body).map_err(|err| {
        tracing::debug!(error = %err, "rejecting unparseable body");
        AppError::invalid_body()
    })
}

pub fn parse_chat(body: &[u8], config: &Config) -> AppResult<ChatRequest> {
    let value = read_json(body)?;
    let messages = match value.get("messages").and_then(|v| v.as_array()) {
        Some(arr) if !arr.is_empty() => arr,
        _ => return Err(AppError::validation(MISSING_MESSAGES)),
    };
    let messages = messages
        .iter()
        .map(|m| {
            serde_json::from_value::<ChatMessage>(m.clone())
                .map_err(|_| AppError::validation(INVALID_MESSAGE))
        })
        .collect::<AppResult<Vec<_>>>()?;
    Ok(ChatRequest {
        messages,
        model: resolve_model(value.get("model"), config),
    })
}

pub fn parse_prompt(body: &[u8], config: &Config) -> AppResult<PromptRequest> {
    let value = read_json(body)?;
    Ok(PromptRequest {
        prompt: prompt_text(&value)?,
        model: resolve_model(value.get("model"), config),
    })
}

pub fn parse_structured(body: &[u8], config: &Config) -> AppResult<StructuredRequest> {
    let value = read_json(body)?;
    Ok(StructuredRequest {
        prompt: prompt_text(&value)?,
        model: resolve_model(value.get("model"), config),
        mode: StructuredMode::resolve(value.get("mode")),
    })
}

fn prompt_text(value: &Value) -> AppResult<String> {
    value
        .get("prompt")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::validation(MISSING_PROMPT))
}

/// A non-blank string override wins (trimmed); everything else falls back to
/// the configured default.
pub fn resolve_model(override_value: Option<&Value>, config: &Config) -> String {
    override_value
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| config.default_model.clone())
}
