//! HTTP executors with bounded automatic retry.
//!
//! Connection errors, timeouts and `429 Too Many Requests` are retried with
//! exponential backoff and jitter, honoring `Retry-After`. Every other
//! status is returned to the caller untouched.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, info};

use crate::errors::{ClientError, StreamFault, http_error_from_body};
use crate::retry::{RetryPolicy, parse_retry_after};

/// What to do with the outcome of one attempt.
enum Disposition {
    Done,
    Retry { code: &'static str, wait: Option<Duration> },
}

fn classify_status(status: StatusCode, headers: &HeaderMap) -> Disposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Disposition::Retry {
            code: "http.rate_limited.429",
            wait,
        };
    }
    Disposition::Done
}

fn classify_error(err: &reqwest::Error) -> Option<&'static str> {
    if err.is_connect() {
        Some("http.connect")
    } else if err.is_timeout() {
        Some("http.timeout")
    } else {
        None
    }
}

/// Ceiling on a server-provided `Retry-After` wait.
pub const MAX_SERVER_WAIT: Duration = Duration::from_secs(60);

/// A request that produced no response.
///
/// `interrupted` is set when the connection was established but dropped
/// or stalled before a response arrived. Refused connections and DNS
/// failures leave it unset.
#[derive(Debug)]
pub(crate) struct SendError {
    error: ClientError,
    interrupted: bool,
}

impl SendError {
    fn from_reqwest(err: &reqwest::Error, method: &reqwest::Method, host: &str, attempt: u32) -> Self {
        Self {
            error: ClientError::Transport(format!(
                "{method} {host} failed after {attempt} attempt(s): {err}"
            )),
            interrupted: !err.is_connect() && (err.is_timeout() || err.is_request() || err.is_body()),
        }
    }

    fn consumed() -> Self {
        Self {
            error: ClientError::protocol_msg("request consumed without a response"),
            interrupted: false,
        }
    }
}

impl From<SendError> for ClientError {
    fn from(value: SendError) -> Self {
        value.error
    }
}

impl From<SendError> for StreamFault {
    fn from(value: SendError) -> Self {
        if value.interrupted {
            StreamFault::transient(value.error.to_string())
        } else {
            StreamFault::Fatal(value.error)
        }
    }
}

fn url_host(url: &reqwest::Url) -> &str {
    url.host_str().unwrap_or("unknown")
}

fn next_wait(policy: &RetryPolicy, retries_done: u32, server_wait: Option<Duration>) -> Duration {
    match server_wait {
        Some(wait) => wait.min(MAX_SERVER_WAIT),
        None => policy.jittered_backoff(retries_done),
    }
}

/// Blocking executor used by the resource facades, the archive download and
/// the blocking event stream.
#[derive(Clone)]
pub struct BlockingTransport {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
}

impl BlockingTransport {
    pub fn new(client: reqwest::blocking::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Sends `request`, retrying transient failures. Non-success statuses
    /// other than 429 are returned as responses.
    pub fn execute(
        &self,
        request: reqwest::blocking::Request,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        self.send(request).map_err(ClientError::from)
    }

    pub(crate) fn send(
        &self,
        request: reqwest::blocking::Request,
    ) -> Result<reqwest::blocking::Response, SendError> {
        let host = url_host(request.url()).to_string();
        let method = request.method().clone();
        let mut retries_done = 0u32;
        let mut pending = Some(request);
        loop {
            let Some(current) = pending.take() else {
                return Err(SendError::consumed());
            };
            let spare = current.try_clone();
            let attempt = retries_done + 1;
            debug!(
                event = "http.request_attempt",
                domain = "http",
                method = %method,
                url_host = %host,
                attempt = attempt
            );
            let (code, wait) = match self.client.execute(current) {
                Ok(response) => match classify_status(response.status(), response.headers()) {
                    Disposition::Done => return Ok(response),
                    Disposition::Retry { code, wait } => {
                        if spare.is_none() || !self.policy.can_retry(retries_done) {
                            return Ok(response);
                        }
                        (code, wait)
                    }
                },
                Err(err) => match classify_error(&err) {
                    Some(code) if spare.is_some() && self.policy.can_retry(retries_done) => {
                        (code, None)
                    }
                    _ => {
                        debug!(
                            event = "http.request_retry_exhausted",
                            domain = "http",
                            url_host = %host,
                            attempt = attempt,
                            error = %err
                        );
                        return Err(SendError::from_reqwest(&err, &method, &host, attempt));
                    }
                },
            };
            let backoff = next_wait(&self.policy, retries_done, wait);
            info!(
                event = "http.retry_scheduled",
                domain = "http",
                code = code,
                url_host = %host,
                attempt = attempt,
                next_attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64
            );
            std::thread::sleep(backoff);
            retries_done += 1;
            pending = spare;
        }
    }

    /// `execute` followed by a status check that turns non-2xx responses
    /// into `ClientError::Http` with the server's reason when available.
    pub fn execute_checked(
        &self,
        request: reqwest::blocking::Request,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        let response = self.execute(request)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(http_error_from_body(status.as_u16(), &body))
    }
}

/// Async executor used by the cooperative event stream.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Async counterpart of `BlockingTransport::execute`.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, ClientError> {
        self.send(request).await.map_err(ClientError::from)
    }

    pub(crate) async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, SendError> {
        let host = url_host(request.url()).to_string();
        let method = request.method().clone();
        let mut retries_done = 0u32;
        let mut pending = Some(request);
        loop {
            let Some(current) = pending.take() else {
                return Err(SendError::consumed());
            };
            let spare = current.try_clone();
            let attempt = retries_done + 1;
            debug!(
                event = "http.request_attempt",
                domain = "http",
                method = %method,
                url_host = %host,
                attempt = attempt
            );
            let (code, wait) = match self.client.execute(current).await {
                Ok(response) => match classify_status(response.status(), response.headers()) {
                    Disposition::Done => return Ok(response),
                    Disposition::Retry { code, wait } => {
                        if spare.is_none() || !self.policy.can_retry(retries_done) {
                            return Ok(response);
                        }
                        (code, wait)
                    }
                },
                Err(err) => match classify_error(&err) {
                    Some(code) if spare.is_some() && self.policy.can_retry(retries_done) => {
                        (code, None)
                    }
                    _ => {
                        return Err(SendError::from_reqwest(&err, &method, &host, attempt));
                    }
                },
            };
            let backoff = next_wait(&self.policy, retries_done, wait);
            info!(
                event = "http.retry_scheduled",
                domain = "http",
                code = code,
                url_host = %host,
                attempt = attempt,
                next_attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64
            );
            tokio::time::sleep(backoff).await;
            retries_done += 1;
            pending = spare;
        }
    }
}
