//! Schema-constrained generation with a single fallback to free-form JSON.

use crate::error::AppError;
use crate::extract::{coalesce_output_text, coalesce_parsed_output};
use crate::request::StructuredRequest;
use crate::upstream::{HfClient, UpstreamCallError};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::OnceLock;

pub const TEMPERATURE: f64 = 0.2;

pub const SCHEMA_INSTRUCTIONS: &str = "You are a helpful assistant that returns concise JSON meeting the provided schema. Do not include markdown.";

pub const FALLBACK_INSTRUCTIONS: &str = "You are a helpful assistant that returns compact JSON matching this schema: { headline: string, audience: string, takeaways: string[] }. If you cannot comply, explain why.";

pub const MESSAGE_READY: &str = "Structured output ready.";
pub const MESSAGE_JSON_WITHOUT_SCHEMA: &str =
    "Model returned valid JSON without enforcing the schema.";
pub const MESSAGE_NOT_JSON: &str =
    "Model could not return JSON for the schema. Try a model with structured output support.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredMode {
    #[default]
    Chat,
    Responses,
}

impl StructuredMode {
    /// Only the exact string `"responses"` selects the responses API.
    pub fn resolve(value: Option<&Value>) -> Self {
        match value.and_then(|v| v.as_str()) {
            Some("responses") => StructuredMode::Responses,
            _ => StructuredMode::Chat,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StructuredMode::Chat => "chat",
            StructuredMode::Responses => "responses",
        }
    }
}

/// The single JSON Schema every structured request is negotiated against.
#[derive(Debug)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
    pub strict: bool,
}

static OUTPUT_SCHEMA: OnceLock<OutputSchema> = OnceLock::new();

pub fn output_schema() -> &'static OutputSchema {
    OUTPUT_SCHEMA.get_or_init(|| OutputSchema {
        name: "streamingSummary",
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "headline": { "type": "string" },
                "audience": { "type": "string" },
                "takeaways": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 4,
                    "items": { "type": "string" }
                }
            },
            "required": ["headline", "audience", "takeaways"]
        }),
        strict: true,
    })
}

impl OutputSchema {
    /// `response_format` for chat completions.
    pub fn chat_response_format(&self) -> Value {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": self.name,
                "schema": self.schema,
                "strict": self.strict,
            }
        })
    }

    /// `text.format` for the responses API.
    pub fn responses_text_format(&self) -> Value {
        json!({
            "type": "json_schema",
            "name": self.name,
            "schema": self.schema,
            "strict": self.strict,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StructuredError {
    #[error("{0}")]
    Upstream(#[from] UpstreamCallError),
    #[error("The model returned an empty response.")]
    EmptyModelResponse,
    #[error("The model response was not valid JSON.")]
    InvalidJsonResponse,
}

impl From<StructuredError> for AppError {
    fn from(err: StructuredError) -> Self {
        match err {
            StructuredError::Upstream(err) => err.into(),
            StructuredError::EmptyModelResponse => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "empty_model_response",
                StructuredError::EmptyModelResponse.to_string(),
            ),
            StructuredError::InvalidJsonResponse => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "invalid_json_response",
                StructuredError::InvalidJsonResponse.to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredResponse {
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub meta: StructuredMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredMeta {
    pub model: String,
    pub used_schema: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_error: Option<String>,
    pub mode: StructuredMode,
    pub message: String,
}

/// What the upstream answered, and whether the schema was in force for it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub payload: Value,
    pub used_schema: bool,
    pub schema_error: Option<String>,
}

pub fn schema_request(prompt: &str, model: &str, mode: StructuredMode) -> Value {
    let schema = output_schema();
    match mode {
        StructuredMode::Chat => json!({
            "model": model,
            "messages": [
                { "role": "system", "content": SCHEMA_INSTRUCTIONS },
                { "role": "user", "content": prompt }
            ],
            "response_format": schema.chat_response_format(),
            "temperature": TEMPERATURE,
        }),
        StructuredMode::Responses => json!({
            "model": model,
            "input": prompt,
            "instructions": SCHEMA_INSTRUCTIONS,
            "text": { "format": schema.responses_text_format() },
            "temperature": TEMPERATURE,
        }),
    }
}

pub fn fallback_request(prompt: &str, model: &str, mode: StructuredMode) -> Value {
    match mode {
        StructuredMode::Chat => json!({
            "model": model,
            "messages": [
                { "role": "system", "content": FALLBACK_INSTRUCTIONS },
                { "role": "user", "content": prompt }
            ],
            "temperature": TEMPERATURE,
        }),
        StructuredMode::Responses => json!({
            "model": model,
            "input": prompt,
            "instructions": FALLBACK_INSTRUCTIONS,
            "temperature": TEMPERATURE,
        }),
    }
}

async fn generate(
    client: &HfClient,
    mode: StructuredMode,
    body: &Value,
) -> Result<Value, UpstreamCallError> {
    match mode {
        StructuredMode::Chat => client.chat_completions(body).await,
        StructuredMode::Responses => client.responses(body).await,
    }
}

/// Asks with the schema enforced; a 400 means the provider or model cannot do
/// that, so ask once more without it. Every other failure propagates.
pub async fn negotiate(
    client: &HfClient,
    prompt: &str,
    model: &str,
    mode: StructuredMode,
) -> Result<Completion, UpstreamCallError> {
    match generate(client, mode, &schema_request(prompt, model, mode)).await {
        Ok(payload) => Ok(Completion {
            payload,
            used_schema: true,
            schema_error: None,
        }),
        Err(err) if err.is_bad_request() => {
            tracing::info!(
                model,
                mode = mode.as_str(),
                error = %err.message,
                "schema enforcement rejected, retrying without schema"
            );
            metrics::counter!("hfstream_structured_fallback_total", "mode" => mode.as_str())
                .increment(1);
            let payload = generate(client, mode, &fallback_request(prompt, model, mode)).await?;
            Ok(Completion {
                payload,
                used_schema: false,
                schema_error: Some(err.message),
            })
        }
        Err(err) => Err(err),
    }
}

/// Turns an upstream completion into the response body.
pub fn interpret(
    completion: Completion,
    model: &str,
    mode: StructuredMode,
) -> Result<StructuredResponse, StructuredError> {
    let Completion {
        payload,
        used_schema,
        schema_error,
    } = completion;
    let text = coalesce_output_text(&payload);
    let parsed = match mode {
        StructuredMode::Responses => coalesce_parsed_output(&payload).cloned(),
        StructuredMode::Chat => None,
    };

    let (data, raw) = match (parsed, text) {
        (Some(parsed), _) => (Some(parsed), None),
        (None, None) => return Err(StructuredError::EmptyModelResponse),
        (None, Some(text)) => match serde_json::from_str::<Value>(text) {
            Ok(value) => (Some(value), None),
            Err(_) if used_schema => return Err(StructuredError::InvalidJsonResponse),
            Err(err) => {
                tracing::debug!(model, error = %err, "fallback answer is not JSON, returning raw text");
                (None, Some(text.to_string()))
            }
        },
    };

    let message = match (data.is_some(), used_schema) {
        (true, true) => MESSAGE_READY,
        (true, false) => MESSAGE_JSON_WITHOUT_SCHEMA,
        (false, _) => MESSAGE_NOT_JSON,
    };

    Ok(StructuredResponse {
        data,
        raw,
        meta: StructuredMeta {
            model: model.to_string(),
            used_schema,
            schema_error,
            mode,
            message: message.to_string(),
        },
    })
}

pub async fn run_structured_request(
    client: &HfClient,
    req: &StructuredRequest,
) -> Result<StructuredResponse, StructuredError> {
    let completion = negotiate(client, &req.prompt, &req.model, req.mode).await?;
    interpret(completion, &req.model, req.mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_payload(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    fn completion(payload: Value, used_schema: bool) -> Completion {
        Completion {
            payload,
            used_schema,
            schema_error: (!used_schema).then(|| "response_format unsupported".to_string()),
        }
    }

    #[test]
    fn schema_answer_is_parsed() {
        let body = r#"{"headline":"H","audience":"A","takeaways":["a","b"]}"#;
        let out = interpret(completion(chat_payload(body), true), "m", StructuredMode::Chat)
            .expect("structured");
        assert_eq!(
            out.data,
            Some(json!({"headline":"H","audience":"A","takeaways":["a","b"]}))
        );
        assert_eq!(out.raw, None);
        assert!(out.meta.used_schema);
        assert_eq!(out.meta.message, MESSAGE_READY);
        assert_eq!(out.meta.schema_error, None);
    }

    #[test]
    fn invalid_json_under_schema_is_fatal() {
        let err = interpret(
            completion(chat_payload("Sure! Here you go"), true),
            "m",
            StructuredMode::Chat,
        )
        .unwrap_err();
        assert!(matches!(err, StructuredError::InvalidJsonResponse));
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.message, "The model response was not valid JSON.");
    }

    #[test]
    fn fallback_keeps_raw_text() {
        let out = interpret(
            completion(chat_payload("I cannot produce JSON"), false),
            "m",
            StructuredMode::Chat,
        )
        .expect("degraded");
        assert_eq!(out.data, None);
        assert_eq!(out.raw.as_deref(), Some("I cannot produce JSON"));
        assert!(!out.meta.used_schema);
        assert_eq!(
            out.meta.schema_error.as_deref(),
            Some("response_format unsupported")
        );
        assert_eq!(out.meta.message, MESSAGE_NOT_JSON);
    }

    #[test]
    fn fallback_json_is_still_parsed() {
        let out = interpret(
            completion(chat_payload(r#"{"headline":"x"}"#), false),
            "m",
            StructuredMode::Chat,
        )
        .expect("parsed");
        assert_eq!(out.data, Some(json!({"headline":"x"})));
        assert_eq!(out.meta.message, MESSAGE_JSON_WITHOUT_SCHEMA);
    }

    #[test]
    fn empty_answer_fails() {
        let err = interpret(completion(json!({"choices": []}), true), "m", StructuredMode::Chat)
            .unwrap_err();
        assert!(matches!(err, StructuredError::EmptyModelResponse));
        assert_eq!(err.to_string(), "The model returned an empty response.");
    }

    #[test]
    fn responses_mode_prefers_parsed_output() {
        let payload = json!({
            "output_text": "not json at all",
            "output_parsed": { "headline": "parsed" }
        });
        let out = interpret(completion(payload, true), "m", StructuredMode::Responses)
            .expect("parsed");
        assert_eq!(out.data, Some(json!({ "headline": "parsed" })));
        assert_eq!(out.meta.mode, StructuredMode::Responses);
    }

    #[test]
    fn chat_mode_ignores_parsed_output() {
        let payload = json!({ "output_parsed": { "headline": "parsed" } });
        let err = interpret(completion(payload, true), "m", StructuredMode::Chat).unwrap_err();
        assert!(matches!(err, StructuredError::EmptyModelResponse));
    }

    #[test]
    fn meta_serializes_in_camel_case() {
        let out = interpret(
            completion(chat_payload("plain"), false),
            "org/model",
            StructuredMode::Chat,
        )
        .expect("degraded");
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["data"], Value::Null);
        assert_eq!(v["raw"], "plain");
        assert_eq!(v["meta"]["usedSchema"], false);
        assert_eq!(v["meta"]["schemaError"], "response_format unsupported");
        assert_eq!(v["meta"]["mode"], "chat");
        assert_eq!(v["meta"]["model"], "org/model");
    }

    #[test]
    fn request_bodies_carry_schema_only_when_enforced() {
        let chat = schema_request("p", "m", StructuredMode::Chat);
        assert_eq!(chat["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            chat["response_format"]["json_schema"]["name"],
            "streamingSummary"
        );
        assert_eq!(chat["temperature"], 0.2);

        let responses = schema_request("p", "m", StructuredMode::Responses);
        assert_eq!(responses["text"]["format"]["type"], "json_schema");
        assert_eq!(
            responses["text"]["format"]["schema"]["additionalProperties"],
            false
        );

        let fallback = fallback_request("p", "m", StructuredMode::Chat);
        assert!(fallback.get("response_format").is_none());
        assert_eq!(fallback["messages"][0]["content"], FALLBACK_INSTRUCTIONS);
        let fallback = fallback_request("p", "m", StructuredMode::Responses);
        assert!(fallback.get("text").is_none());
        assert_eq!(fallback["instructions"], FALLBACK_INSTRUCTIONS);
    }
}
