use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt as _, stream};
use reqwest::Method;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use super::{
    Reconnect, SseDecoder, SseEvent, StreamRequest, content_type_of, fallback_event,
    is_event_stream,
};
use crate::errors::{ClientError, StreamFault, http_error_from_body};
use crate::retry::RetryPolicy;
use crate::transport::Transport;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamFault>> + Send>>;

/// Opens the underlying HTTP exchange for [`event_stream`].
#[async_trait::async_trait]
pub trait AsyncEventSourceConnector: Send + Sync {
    /// Opens the event stream, sending `last_event_id` when resuming.
    async fn open(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamFault>;

    /// Plain request to the same resource, used when the server does not
    /// answer with an event stream.
    async fn fetch_full(&self) -> Result<String, ClientError>;
}

/// [`AsyncEventSourceConnector`] over the async reqwest client.
#[derive(Clone)]
pub struct ReqwestAsyncEventSourceConnector {
    transport: Transport,
    request: StreamRequest,
}

impl ReqwestAsyncEventSourceConnector {
    pub fn new(transport: Transport, method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
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

#[async_trait::async_trait]
impl AsyncEventSourceConnector for ReqwestAsyncEventSourceConnector {
    async fn open(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamFault> {
        let request = self
            .transport
            .client()
            .request(self.request.method.clone(), &self.request.url)
            .headers(self.request.stream_headers(last_event_id)?)
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build stream request: {e}")))?;
        let response = self.transport.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
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
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamFault::transient(e.to_string())))
            .boxed())
    }

    async fn fetch_full(&self) -> Result<String, ClientError> {
        let request = self
            .transport
            .client()
            .request(self.request.method.clone(), &self.request.url)
            .headers(self.request.headers.clone())
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build request: {e}")))?;
        let response = self.transport.execute(request).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(format!("failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(http_error_from_body(status.as_u16(), &body));
        }
        Ok(body)
    }
}

/// Cooperative counterpart of [`super::EventSource`] with the same
/// semantics. Suspends only while connecting, backing off, or awaiting the
/// next chunk, and spawns nothing. Dropping the stream closes the
/// connection.
pub fn event_stream<C>(
    connector: C,
    backoff: RetryPolicy,
) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send
where
    C: AsyncEventSourceConnector + 'static,
{
    struct State<C> {
        connector: C,
        reconnect: Reconnect,
        body: Option<(ByteStream, SseDecoder)>,
        wait: Duration,
        pending: VecDeque<SseEvent>,
        done: bool,
    }

    stream::unfold(
        State {
            connector,
            reconnect: Reconnect::new(backoff),
            body: None,
            wait: Duration::ZERO,
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    state.reconnect.on_event(&event);
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                if state.body.is_none() {
                    if !state.wait.is_zero() {
                        tokio::time::sleep(state.wait).await;
                    }
                    let resume_id = state.reconnect.cursor.resume_id().map(str::to_string);
                    match state.connector.open(resume_id.as_deref()).await {
                        Ok(bytes_stream) => {
                            let decoder =
                                SseDecoder::resuming(state.reconnect.cursor.last_event_id.clone());
                            state.body = Some((bytes_stream, decoder));
                        }
                        Err(StreamFault::Transient(reason)) => {
                            state.wait = state.reconnect.schedule(None, &reason);
                        }
                        Err(StreamFault::Malformed(message)) => {
                            state.done = true;
                            let item = fall_back(&state.connector, &message).await;
                            return Some((item, state));
                        }
                        Err(StreamFault::Fatal(err)) => {
                            state.done = true;
                            return Some((Err(err), state));
                        }
                    }
                    continue;
                }
                let Some((bytes_stream, decoder)) = state.body.as_mut() else {
                    continue;
                };

                match bytes_stream.next().await {
                    Some(Ok(chunk)) => match decoder.push_chunk(&chunk) {
                        Ok(events) => {
                            if let Some(ms) = decoder.take_retry_hint() {
                                state.reconnect.cursor.reconnection_delay =
                                    Duration::from_millis(ms);
                            }
                            state.pending.extend(events);
                        }
                        Err(message) => {
                            state.done = true;
                            state.body = None;
                            let item = fall_back(&state.connector, &message).await;
                            return Some((item, state));
                        }
                    },
                    Some(Err(fault)) => {
                        let decoded_id = decoder.last_event_id().to_string();
                        state.body = None;
                        match fault {
                            StreamFault::Fatal(err) => {
                                state.done = true;
                                return Some((Err(err), state));
                            }
                            StreamFault::Transient(reason) | StreamFault::Malformed(reason) => {
                                state.wait = state.reconnect.schedule(Some(&decoded_id), &reason);
                            }
                        }
                    }
                    None => {
                        state.done = true;
                        state.body = None;
                    }
                }
            }
        },
    )
}

async fn fall_back<C: AsyncEventSourceConnector>(
    connector: &C,
    message: &str,
) -> Result<SseEvent, ClientError> {
    warn!(
        event = "sse.malformed_stream_fallback",
        domain = "sse",
        error = %message
    );
    connector.fetch_full().await.map(fallback_event)
}
