use std::io::{ErrorKind, Read};
use std::time::Duration;

use reqwest::Method;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use super::{
    Reconnect, SseDecoder, SseEvent, StreamRequest, content_type_of, fallback_event,
    is_event_stream,
};
use crate::errors::{ClientError, StreamFault, http_error_from_body};
use crate::retry::RetryPolicy;
use crate::transport::BlockingTransport;

const READ_CHUNK: usize = 8 * 1024;

/// Opens the underlying HTTP exchange for a blocking [`EventSource`].
pub trait EventSourceConnector {
    /// Opens the event stream, sending `last_event_id` when resuming.
    fn open(&self, last_event_id: Option<&str>) -> Result<Box<dyn Read + Send>, StreamFault>;

    /// Plain request to the same resource, used when the server does not
    /// answer with an event stream.
    fn fetch_full(&self) -> Result<String, ClientError>;
}

/// [`EventSourceConnector`] over the blocking reqwest client.
///
/// The client should have a connect timeout and no overall timeout; the
/// live stream has no read deadline.
#[derive(Clone)]
pub struct ReqwestEventSourceConnector {
    transport: BlockingTransport,
    request: StreamRequest,
}

impl ReqwestEventSourceConnector {
    pub fn new(
        transport: BlockingTransport,
        method: Method,
        url: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            transport,
            request: StreamRequest {
                method,
                url: url.into(),
                headers,
            },
        }
    }
}

impl EventSourceConnector for ReqwestEventSourceConnector {
    fn open(&self, last_event_id: Option<&str>) -> Result<Box<dyn Read + Send>, StreamFault> {
        let request = self
            .transport
            .client()
            .request(self.request.method.clone(), &self.request.url)
            .headers(self.request.stream_headers(last_event_id)?)
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build stream request: {e}")))?;
        let response = self.transport.send(request)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StreamFault::Fatal(http_error_from_body(status.as_u16(), &body)));
        }
        if !is_event_stream(response.headers()) {
            return Err(StreamFault::malformed(format!(
                "expected text/event-stream, got {}",
                content_type_of(response.headers())
            )));
        }
        debug!(
            event = "sse.connected",
            domain = "sse",
            resumed = last_event_id.is_some()
        );
        Ok(Box::new(response))
    }

    fn fetch_full(&self) -> Result<String, ClientError> {
        let request = self
            .transport
            .client()
            .request(self.request.method.clone(), &self.request.url)
            .headers(self.request.headers.clone())
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build request: {e}")))?;
        let response = self.transport.execute_checked(request)?;
        response
            .text()
            .map_err(|e| ClientError::Transport(format!("failed to read response body: {e}")))
    }
}

enum Phase {
    Connect { wait: Duration },
    Reading {
        body: Box<dyn Read + Send>,
        decoder: SseDecoder,
    },
    Finished,
}

/// What the reader does after inspecting its current phase.
enum Step {
    Yield(SseEvent),
    Transient { decoded_id: Option<String>, reason: String },
    Malformed(String),
    Fail(ClientError),
    End,
}

/// Blocking, resuming event-stream reader.
///
/// Yields events in receipt order. Transient read failures reconnect
/// indefinitely; bounding the overall work is the caller's job. Dropping
/// the reader closes the connection.
pub struct EventSource<C> {
    connector: C,
    reconnect: Reconnect,
    phase: Phase,
    pending: std::collections::VecDeque<SseEvent>,
}

impl<C: EventSourceConnector> EventSource<C> {
    pub fn new(connector: C, backoff: RetryPolicy) -> Self {
        Self {
            connector,
            reconnect: Reconnect::new(backoff),
            phase: Phase::Connect {
                wait: Duration::ZERO,
            },
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Current resume position.
    pub fn cursor(&self) -> &super::StreamCursor {
        &self.reconnect.cursor
    }

    fn step(&mut self) -> Option<Step> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Step::Yield(event));
        }
        match &mut self.phase {
            Phase::Finished => Some(Step::End),
            Phase::Connect { wait } => {
                if !wait.is_zero() {
                    std::thread::sleep(*wait);
                }
                match self.connector.open(self.reconnect.cursor.resume_id()) {
                    Ok(body) => {
                        self.phase = Phase::Reading {
                            body,
                            decoder: SseDecoder::resuming(self.reconnect.cursor.last_event_id.clone()),
                        };
                        None
                    }
                    Err(fault) => Some(step_for_fault(fault, None)),
                }
            }
            Phase::Reading { body, decoder } => {
                let mut buf = [0u8; READ_CHUNK];
                match body.read(&mut buf) {
                    Ok(0) => Some(Step::End),
                    Ok(n) => match decoder.push_chunk(&buf[..n]) {
                        Ok(events) => {
                            if let Some(ms) = decoder.take_retry_hint() {
                                self.reconnect.cursor.reconnection_delay = Duration::from_millis(ms);
                            }
                            self.pending.extend(events);
                            None
                        }
                        Err(message) => Some(Step::Malformed(message)),
                    },
                    Err(err) if err.kind() == ErrorKind::Interrupted => None,
                    Err(err) => Some(Step::Transient {
                        decoded_id: Some(decoder.last_event_id().to_string()),
                        reason: err.to_string(),
                    }),
                }
            }
        }
    }
}

fn step_for_fault(fault: StreamFault, decoded_id: Option<String>) -> Step {
    match fault {
        StreamFault::Transient(reason) => Step::Transient { decoded_id, reason },
        StreamFault::Malformed(message) => Step::Malformed(message),
        StreamFault::Fatal(err) => Step::Fail(err),
    }
}

impl<C: EventSourceConnector> Iterator for EventSource<C> {
    type Item = Result<SseEvent, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(step) = self.step() else {
                continue;
            };
            match step {
                Step::Yield(event) => {
                    self.reconnect.on_event(&event);
                    return Some(Ok(event));
                }
                Step::Transient { decoded_id, reason } => {
                    let wait = self.reconnect.schedule(decoded_id.as_deref(), &reason);
                    self.phase = Phase::Connect { wait };
                }
                Step::Malformed(message) => {
                    warn!(
                        event = "sse.malformed_stream_fallback",
                        domain = "sse",
                        error = %message
                    );
                    self.phase = Phase::Finished;
                    return Some(self.connector.fetch_full().map(fallback_event));
                }
                Step::Fail(err) => {
                    self.phase = Phase::Finished;
                    return Some(Err(err));
                }
                Step::End => {
                    self.phase = Phase::Finished;
                    return None;
                }
            }
        }
    }
}
