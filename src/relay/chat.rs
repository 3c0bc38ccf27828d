use crate::relay::{TextAdapter, decode_error, error_value_message, sse_events, stream_error_marker};
use crate::upstream::UpstreamCallError;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

/// One `chat.completion.chunk`. Only the fields the relay reads are modelled.
#[derive(Debug, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Non-JSON data is an error. A JSON frame of some other shape (usage-only
/// chunks, `"delta": null`) decodes to an empty chunk.
pub fn decode_chunk(data: &str) -> Result<ChatChunk, UpstreamCallError> {
    let value: Value = serde_json::from_str(data).map_err(|err| decode_error("chat chunk", err))?;
    Ok(serde_json::from_value(value).unwrap_or_else(|err| {
        tracing::debug!(error = %err, "chat frame has no readable delta");
        ChatChunk::default()
    }))
}

pub fn chat_events(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<ChatChunk, UpstreamCallError>> + Send + 'static {
    sse_events(resp).map(|ev| ev.and_then(|ev| decode_chunk(&ev.data)))
}

/// Emits `choices[0].delta.content` as soon as it arrives.
#[derive(Debug, Default)]
pub struct ChatTextAdapter;

impl TextAdapter for ChatTextAdapter {
    type Event = ChatChunk;

    fn on_event(&mut self, chunk: ChatChunk) -> Option<String> {
        if let Some(err) = chunk.error.as_ref().filter(|e| !e.is_null()) {
            return Some(stream_error_marker(&error_value_message(err)));
        }
        chunk
            .choices
            .into_iter()
            .next()?
            .delta
            .content
            .filter(|c| !c.is_empty())
    }
}
