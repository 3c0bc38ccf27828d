//! Relays an upstream provider event stream to a downstream plain-text body.
//!
//! The relay is pull driven: nothing is read from upstream until the response
//! body is first polled, and at most one upstream event is pulled per chunk
//! the client reads. Errors after the first byte are rendered in-band because
//! the status line is already on the wire.

use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::stream::{AbortHandle, Abortable, Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod chat;
pub mod responses;

pub const STREAM_ERROR_PREFIX: &str = "\n[Stream error] ";
pub const DEFAULT_STREAM_ERROR: &str = "Streaming error.";

pub fn stream_error_marker(message: &str) -> String {
    let message = message.trim();
    let message = if message.is_empty() {
        DEFAULT_STREAM_ERROR
    } else {
        message
    };
    format!("{STREAM_ERROR_PREFIX}{message}")
}

/// Message carried by an in-band provider error object (`{"message": ..}` or a bare string).
pub fn error_value_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_STREAM_ERROR)
            .to_string(),
        _ => DEFAULT_STREAM_ERROR.to_string(),
    }
}

/// An upstream frame that could not be decoded. The relay renders it in-band
/// and closes.
pub fn decode_error(what: &str, err: serde_json::Error) -> UpstreamCallError {
    UpstreamCallError::new(
        UpstreamErrorKind::Decode,
        None,
        format!("Malformed upstream {what}: {err}"),
    )
}

/// Turns provider-specific events into downstream text.
pub trait TextAdapter: Send + 'static {
    type Event: Send + 'static;

    /// Text to emit for one upstream event. Empty strings are dropped.
    fn on_event(&mut self, event: Self::Event) -> Option<String>;

    /// Runs once after the upstream sequence is exhausted, unless the relay was
    /// cancelled or hit an upstream error.
    fn on_complete(&mut self) -> Option<String> {
        None
    }
}

/// Abort switch for one in-flight upstream call. Cloning shares the switch.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self {
            abort,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `true` only for the call that actually flipped the switch.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.abort.abort();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Makes an upstream event stream abortable through the returned handle.
pub fn cancellable<S: Stream>(events: S) -> (Abortable<S>, CancelHandle) {
    let (events, abort) = futures_util::stream::abortable(events);
    (events, CancelHandle::new(abort))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    UpstreamError,
    Cancelled,
    Dropped,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::UpstreamError => "upstream_error",
            CloseReason::Cancelled => "cancelled",
            CloseReason::Dropped => "dropped",
        }
    }
}

/// Owns the downstream side of a relay. Closing happens exactly once, either
/// explicitly or when the guard is dropped with the body (client went away).
struct RelayGuard {
    route: &'static str,
    cancel: CancelHandle,
    chunks: u64,
    closed: bool,
}

impl RelayGuard {
    fn new(route: &'static str, cancel: CancelHandle) -> Self {
        Self {
            route,
            cancel,
            chunks: 0,
            closed: false,
        }
    }

    fn emit(&mut self, text: String) -> Option<Bytes> {
        if text.is_empty() {
            return None;
        }
        self.chunks += 1;
        metrics::counter!("hfstream_relay_chunks_total", "route" => self.route).increment(1);
        Some(Bytes::from(text))
    }

    fn close(&mut self, reason: CloseReason) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if matches!(reason, CloseReason::Cancelled | CloseReason::Dropped) {
            self.cancel.cancel();
        }
        tracing::debug!(
            route = self.route,
            reason = reason.as_str(),
            chunks = self.chunks,
            "relay closed"
        );
        metrics::counter!("hfstream_relay_closed_total", "reason" => reason.as_str()).increment(1);
        true
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Streaming,
    Finished(CloseReason),
    Closed,
}

struct Relay<S, A> {
    events: Pin<Box<S>>,
    adapter: A,
    guard: RelayGuard,
    phase: Phase,
}

impl<S, A> Relay<S, A>
where
    S: Stream<Item = Result<A::Event, UpstreamCallError>> + Send + 'static,
    A: TextAdapter,
{
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            match self.phase {
                Phase::Streaming => {
                    if self.guard.cancel.is_cancelled() {
                        self.phase = Phase::Finished(CloseReason::Cancelled);
                        continue;
                    }
                    match self.events.next().await {
                        Some(Ok(event)) => {
                            if let Some(chunk) =
                                self.adapter.on_event(event).and_then(|t| self.guard.emit(t))
                            {
                                return Some(chunk);
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(
                                route = self.guard.route,
                                error = %err,
                                "upstream stream failed mid-response"
                            );
                            self.phase = Phase::Finished(CloseReason::UpstreamError);
                            return self.guard.emit(stream_error_marker(&err.message));
                        }
                        None if self.guard.cancel.is_cancelled() => {
                            self.phase = Phase::Finished(CloseReason::Cancelled);
                        }
                        None => {
                            self.phase = Phase::Finished(CloseReason::Completed);
                            if let Some(chunk) =
                                self.adapter.on_complete().and_then(|t| self.guard.emit(t))
                            {
                                return Some(chunk);
                            }
                        }
                    }
                }
                Phase::Finished(reason) => {
                    self.guard.close(reason);
                    self.phase = Phase::Closed;
                    return None;
                }
                Phase::Closed => return None,
            }
        }
    }
}

/// Lazily relays `events` through `adapter`. The returned stream is fused.
pub fn relay_stream<S, A>(
    route: &'static str,
    events: S,
    adapter: A,
    cancel: CancelHandle,
) -> impl Stream<Item = Bytes> + Send + 'static
where
    S: Stream<Item = Result<A::Event, UpstreamCallError>> + Send + 'static,
    A: TextAdapter,
{
    let relay = Relay {
        events: Box::pin(events),
        adapter,
        guard: RelayGuard::new(route, cancel),
        phase: Phase::Streaming,
    };
    futures_util::stream::unfold(relay, |mut relay| async move {
        let chunk = relay.next_chunk().await?;
        Some((chunk, relay))
    })
    .fuse()
}

pub fn relay_body<S, A>(route: &'static str, events: S, adapter: A, cancel: CancelHandle) -> Body
where
    S: Stream<Item = Result<A::Event, UpstreamCallError>> + Send + 'static,
    A: TextAdapter,
{
    Body::from_stream(relay_stream(route, events, adapter, cancel).map(Ok::<_, Infallible>))
}

pub fn text_stream_response(body: Body) -> Response {
    let mut resp = body.into_response();
    let headers = resp.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Server-sent events from an upstream response, ending at the `[DONE]` sentinel.
pub fn sse_events(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<eventsource_stream::Event, UpstreamCallError>> + Send + 'static {
    resp.bytes_stream()
        .eventsource()
        .map(|ev| {
            ev.map_err(|err| {
                UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string())
            })
        })
        .take_while(|ev| {
            let done = matches!(ev, Ok(ev) if ev.data.trim() == "[DONE]");
            futures_util::future::ready(!done)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Echo {
        completion: Option<String>,
        completed: Arc<Mutex<bool>>,
    }

    impl TextAdapter for Echo {
        type Event = String;

        fn on_event(&mut self, event: String) -> Option<String> {
            Some(event)
        }

        fn on_complete(&mut self) -> Option<String> {
            if let Ok(mut flag) = self.completed.lock() {
                *flag = true;
            }
            self.completion.take()
        }
    }

    fn events(
        items: Vec<Result<&'static str, &'static str>>,
    ) -> impl Stream<Item = Result<String, UpstreamCallError>> + Send + 'static {
        futures_util::stream::iter(items.into_iter().map(|item| {
            item.map(|s| s.to_string()).map_err(|msg| {
                UpstreamCallError::new(UpstreamErrorKind::Network, None, msg.to_string())
            })
        }))
    }

    async fn collect<S: Stream<Item = Bytes>>(stream: S) -> Vec<String> {
        stream
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .collect()
            .await
    }

    #[tokio::test]
    async fn chunks_keep_upstream_order_and_skip_empty() {
        let (events, cancel) = cancellable(events(vec![Ok("a"), Ok(""), Ok("b"), Ok("c")]));
        let out = collect(relay_stream("test", events, Echo::default(), cancel)).await;
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn completion_runs_after_exhaustion() {
        let adapter = Echo {
            completion: Some("tail".to_string()),
            ..Echo::default()
        };
        let (events, cancel) = cancellable(events(vec![Ok("a")]));
        let out = collect(relay_stream("test", events, adapter, cancel)).await;
        assert_eq!(out, vec!["a", "tail"]);
    }

    #[tokio::test]
    async fn upstream_error_becomes_in_band_marker_and_closes() {
        let completed = Arc::new(Mutex::new(false));
        let adapter = Echo {
            completion: Some("never".to_string()),
            completed: completed.clone(),
        };
        let (events, cancel) = cancellable(events(vec![Ok("a"), Err("boom"), Ok("b")]));
        let out = collect(relay_stream("test", events, adapter, cancel)).await;
        assert_eq!(out, vec!["a", "\n[Stream error] boom"]);
        assert!(!*completed.lock().unwrap());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_skips_completion() {
        let completed = Arc::new(Mutex::new(false));
        let adapter = Echo {
            completion: Some("never".to_string()),
            completed: completed.clone(),
        };
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String, UpstreamCallError>>();
        let (events, cancel) = cancellable(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));
        let mut stream = Box::pin(relay_stream("test", events, adapter, cancel.clone()));

        tx.send(Ok("first".to_string())).unwrap();
        assert_eq!(stream.next().await, Some(Bytes::from("first")));

        assert!(cancel.cancel());
        assert!(!cancel.cancel());
        tx.send(Ok("late".to_string())).unwrap();

        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
        assert!(!*completed.lock().unwrap());
    }

    #[tokio::test]
    async fn cancel_after_completion_is_harmless() {
        let (events, cancel) = cancellable(events(vec![Ok("done")]));
        let mut stream = Box::pin(relay_stream("test", events, Echo::default(), cancel.clone()));
        assert_eq!(stream.next().await, Some(Bytes::from("done")));
        assert_eq!(stream.next().await, None);
        assert!(cancel.cancel());
        assert!(!cancel.cancel());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_upstream() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String, UpstreamCallError>>();
        let (events, cancel) = cancellable(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));
        let stream = relay_stream("test", events, Echo::default(), cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn guard_closes_once() {
        let (abort, _registration) = AbortHandle::new_pair();
        let cancel = CancelHandle::new(abort);
        let mut guard = RelayGuard::new("test", cancel.clone());
        assert!(guard.close(CloseReason::Completed));
        assert!(!guard.close(CloseReason::Cancelled));
        drop(guard);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn marker_defaults_blank_messages() {
        assert_eq!(stream_error_marker("x"), "\n[Stream error] x");
        assert_eq!(stream_error_marker("  "), "\n[Stream error] Streaming error.");
        assert_eq!(
            error_value_message(&serde_json::json!({"message": "quota"})),
            "quota"
        );
        assert_eq!(error_value_message(&serde_json::json!("plain")), "plain");
    }
}
