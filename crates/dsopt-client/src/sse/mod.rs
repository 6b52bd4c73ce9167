//! Retrying Server-Sent Events reader.
//!
//! [`EventSource`] is the blocking variant (an `Iterator`), [`event_stream`]
//! the cooperative one (a `futures::Stream`). Both resume after transient
//! read failures using `Last-Event-ID` and the server's `retry` hint, and
//! both fall back to a single plain request when the response is not a
//! well-formed event stream.

use std::time::Duration;

use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::errors::ClientError;
use crate::retry::RetryPolicy;

mod blocking;
mod decoder;
mod stream;
#[cfg(test)]
mod test_server;

pub use blocking::{EventSource, EventSourceConnector, ReqwestEventSourceConnector};
pub use stream::{
    AsyncEventSourceConnector, ByteStream, ReqwestAsyncEventSourceConnector, event_stream,
};

pub(crate) use decoder::SseDecoder;

const EVENT_STREAM_MIME: &str = "text/event-stream";
const LAST_EVENT_ID: &str = "last-event-id";

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Last event id in effect when this event was dispatched.
    pub id: String,
    /// Event type; `message` when the frame has none.
    pub event: String,
    pub data: String,
    /// Reconnection hint in milliseconds carried by this frame.
    pub retry: Option<u64>,
}

/// Resume position of one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub last_event_id: String,
    pub reconnection_delay: Duration,
}

impl StreamCursor {
    fn observe(&mut self, event: &SseEvent) {
        self.last_event_id.clone_from(&event.id);
        if let Some(ms) = event.retry {
            self.reconnection_delay = Duration::from_millis(ms);
        }
    }

    fn resume_id(&self) -> Option<&str> {
        Some(self.last_event_id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Reconnect bookkeeping shared by both reader variants.
#[derive(Debug)]
struct Reconnect {
    cursor: StreamCursor,
    backoff: RetryPolicy,
    consecutive_failures: u32,
}

impl Reconnect {
    fn new(backoff: RetryPolicy) -> Self {
        Self {
            cursor: StreamCursor::default(),
            backoff,
            consecutive_failures: 0,
        }
    }

    fn on_event(&mut self, event: &SseEvent) {
        self.cursor.observe(event);
        self.consecutive_failures = 0;
    }

    /// Records a transient failure and returns how long to wait before the
    /// next connect. `decoded_id` is the decoder's id after the last frame,
    /// which covers id-only frames that never reached the caller.
    fn schedule(&mut self, decoded_id: Option<&str>, reason: &str) -> Duration {
        if let Some(id) = decoded_id {
            self.cursor.last_event_id = id.to_string();
        }
        let wait = self.cursor.reconnection_delay
            + self.backoff.jittered_backoff(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            event = "sse.reconnect_scheduled",
            domain = "sse",
            reason = reason,
            failures = self.consecutive_failures,
            last_event_id = %self.cursor.last_event_id,
            backoff_ms = wait.as_millis() as u64
        );
        wait
    }
}

/// Event synthesized from a plain response body when the server did not
/// answer with an event stream.
fn fallback_event(body: String) -> SseEvent {
    SseEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event: "message".to_string(),
        data: body,
        retry: None,
    }
}

/// Request description shared by the reqwest connectors.
#[derive(Debug, Clone)]
struct StreamRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
}

impl StreamRequest {
    fn stream_headers(&self, last_event_id: Option<&str>) -> Result<HeaderMap, ClientError> {
        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM_MIME));
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        if let Some(id) = last_event_id {
            let value = HeaderValue::from_str(id)
                .map_err(|e| ClientError::protocol_msg(format!("invalid Last-Event-ID {id:?}: {e}")))?;
            headers.insert(HeaderName::from_static(LAST_EVENT_ID), value);
        }
        Ok(headers)
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains(EVENT_STREAM_MIME))
}

fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_headers_add_resume_id_only_when_present() {
        let request = StreamRequest {
            method: Method::GET,
            url: "http://localhost/run/1".into(),
            headers: HeaderMap::new(),
        };
        let fresh = request.stream_headers(None).unwrap();
        assert_eq!(fresh.get(ACCEPT).unwrap(), EVENT_STREAM_MIME);
        assert_eq!(fresh.get("x-accel-buffering").unwrap(), "no");
        assert!(fresh.get(LAST_EVENT_ID).is_none());

        let resumed = request.stream_headers(Some("42")).unwrap();
        assert_eq!(resumed.get(LAST_EVENT_ID).unwrap(), "42");
    }

    #[test]
    fn cursor_tracks_ids_and_retry_hints() {
        let mut reconnect = Reconnect::new(RetryPolicy::none());
        reconnect.on_event(&SseEvent {
            id: "5".into(),
            event: "message".into(),
            data: "{}".into(),
            retry: Some(1500),
        });
        assert_eq!(reconnect.cursor.resume_id(), Some("5"));
        assert_eq!(reconnect.cursor.reconnection_delay, Duration::from_millis(1500));

        let wait = reconnect.schedule(Some("6"), "reset");
        assert_eq!(wait, Duration::from_millis(1500));
        assert_eq!(reconnect.cursor.last_event_id, "6");
    }

    #[test]
    fn fallback_events_get_unique_ids() {
        let a = fallback_event("{}".into());
        let b = fallback_event("{}".into());
        assert_ne!(a.id, b.id);
        assert_eq!(a.event, "message");
        assert_eq!(a.retry, None);
    }
}
