use crate::extract::coalesce_output_text;
use crate::relay::{
    DEFAULT_STREAM_ERROR, TextAdapter, decode_error, error_value_message, sse_events,
    stream_error_marker,
};
use crate::upstream::UpstreamCallError;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsesEvent {
    /// `response.output_text.delta`
    OutputTextDelta {
        delta: Option<String>,
        snapshot: Option<String>,
    },
    /// `response.output_text.done`
    OutputTextDone { snapshot: Option<String> },
    /// `response.completed`, kept for the completion fallback.
    Completed { response: Value },
    /// `response.error` or a bare `error` event.
    Error { message: String },
    Other,
}

/// Decodes one SSE frame. The event type comes from the payload's `type`,
/// falling back to the SSE `event:` line. Unknown types decode to `Other`;
/// only a payload that is not JSON at all is an error.
pub fn decode_event(event_name: &str, data: &str) -> Result<ResponsesEvent, UpstreamCallError> {
    let value: Value =
        serde_json::from_str(data).map_err(|err| decode_error("responses event", err))?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or(event_name);
    let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let event = match kind {
        "response.output_text.delta" => ResponsesEvent::OutputTextDelta {
            delta: text("delta"),
            snapshot: text("snapshot"),
        },
        "response.output_text.done" => ResponsesEvent::OutputTextDone {
            snapshot: text("snapshot").or_else(|| text("text")),
        },
        "response.completed" => ResponsesEvent::Completed {
            response: value.get("response").cloned().unwrap_or(Value::Null),
        },
        "response.error" | "error" => ResponsesEvent::Error {
            message: value
                .get("error")
                .map(error_value_message)
                .or_else(|| text("message"))
                .unwrap_or_else(|| DEFAULT_STREAM_ERROR.to_string()),
        },
        _ => ResponsesEvent::Other,
    };
    Ok(event)
}

pub fn responses_events(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<ResponsesEvent, UpstreamCallError>> + Send + 'static {
    sse_events(resp).map(|ev| ev.and_then(|ev| decode_event(&ev.event, &ev.data)))
}

/// Tracks the cumulative text seen so far so that deltas and snapshots can be
/// mixed without re-emitting anything.
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    snapshot: String,
    emitted_any: bool,
}

impl SnapshotTracker {
    /// An explicit delta always wins; the snapshot is only diffed when the
    /// delta is missing or empty.
    pub fn on_delta(&mut self, delta: Option<&str>, snapshot: Option<&str>) -> Option<String> {
        let mut chunk = delta.unwrap_or_default().to_string();
        if chunk.is_empty() {
            if let Some(snapshot) = snapshot {
                chunk = suffix_after(snapshot, self.snapshot.len()).to_string();
            }
        }
        match (snapshot, delta) {
            (Some(snapshot), _) => self.snapshot = snapshot.to_string(),
            (None, Some(delta)) => self.snapshot.push_str(delta),
            (None, None) => {}
        }
        self.take(chunk)
    }

    pub fn on_done(&mut self, snapshot: Option<&str>) -> Option<String> {
        let snapshot = snapshot?;
        if snapshot.len() <= self.snapshot.len() {
            return None;
        }
        let chunk = suffix_after(snapshot, self.snapshot.len()).to_string();
        self.snapshot = snapshot.to_string();
        self.take(chunk)
    }

    pub fn emitted_any(&self) -> bool {
        self.emitted_any
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    fn take(&mut self, chunk: String) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        self.emitted_any = true;
        Some(chunk)
    }
}

/// Text of `s` past the first `len` bytes. A `len` inside a multi-byte
/// character moves forward to the next boundary.
fn suffix_after(s: &str, len: usize) -> &str {
    let mut start = len.min(s.len());
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s.get(start..).unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct ResponsesTextAdapter {
    tracker: SnapshotTracker,
    final_response: Option<Value>,
}

impl TextAdapter for ResponsesTextAdapter {
    type Event = ResponsesEvent;

    fn on_event(&mut self, event: ResponsesEvent) -> Option<String> {
        match event {
            ResponsesEvent::OutputTextDelta { delta, snapshot } => self
                .tracker
                .on_delta(delta.as_deref(), snapshot.as_deref()),
            ResponsesEvent::OutputTextDone { snapshot } => {
                self.tracker.on_done(snapshot.as_deref())
            }
            ResponsesEvent::Completed { response } => {
                self.final_response = Some(response);
                None
            }
            ResponsesEvent::Error { message } => Some(stream_error_marker(&message)),
            ResponsesEvent::Other => None,
        }
    }

    /// Some providers stream no text events at all; fall back to the final
    /// response body when nothing was emitted.
    fn on_complete(&mut self) -> Option<String> {
        if self.tracker.emitted_any() {
            return None;
        }
        let text = self
            .final_response
            .as_ref()
            .and_then(coalesce_output_text)?;
        tracing::debug!("no streamed text, emitting final response output");
        Some(text.to_string())
    }
}
