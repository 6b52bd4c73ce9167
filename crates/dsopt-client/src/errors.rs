use crate::run::RunStatus;

/// Faults raised while reading a live event stream, before they are
/// either recovered by the reader or normalized into a `ClientError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamFault {
    /// Read error, connection reset or read timeout. The reader reconnects.
    #[error("transient stream failure: {0}")]
    Transient(String),
    /// The response is not a well-formed event stream. The reader falls
    /// back to a single plain request.
    #[error("malformed event stream: {0}")]
    Malformed(String),
    /// Anything else (non-2xx on open, connect failure after retries).
    #[error(transparent)]
    Fatal(ClientError),
}

impl StreamFault {
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

impl From<ClientError> for StreamFault {
    fn from(value: ClientError) -> Self {
        StreamFault::Fatal(value)
    }
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid or missing client configuration (API key, host, cache dir).
    #[error("config error: {0}")]
    Config(String),
    /// Input rejected before it was sent to the server.
    #[error("validation error: {0}")]
    Validation(String),
    /// Network failure that survived the transport retry policy.
    #[error("transport error: {0}")]
    Transport(String),
    /// Server answered with a non-success status.
    #[error("http error ({status}): {message}")]
    Http { status: u16, message: String },
    /// Server payload had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The run reported a failure, or the stream carried an error body.
    #[error("{}", run_failed_message(.state, .message))]
    RunFailed {
        state: Option<RunStatus>,
        message: String,
    },
    /// The run-status subscription was reopened too many times.
    #[error("max retries reached ({attempts} subscription attempts) for run {run_id}")]
    MaxRetriesReached { run_id: String, attempts: u32 },
    /// Result archive could not be opened or lacked a required member.
    #[error("archive error: {0}")]
    Archive(String),
    /// A table member could not be parsed.
    #[error("table error: {0}")]
    Table(String),
    /// Local filesystem failure (cache dir, credential file).
    #[error("io error: {0}")]
    Io(String),
}

fn run_failed_message(state: &Option<RunStatus>, message: &str) -> String {
    match state {
        Some(state) => format!("run {} with error: {message}", state.outcome_verb()),
        None => message.to_string(),
    }
}

impl ClientError {
    pub(crate) fn run_failed(state: Option<RunStatus>, message: impl Into<String>) -> Self {
        Self::RunFailed {
            state,
            message: message.into(),
        }
    }

    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns the HTTP status for `Http` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Io(value.to_string())
    }
}

impl From<zip::result::ZipError> for ClientError {
    fn from(value: zip::result::ZipError) -> Self {
        ClientError::Archive(value.to_string())
    }
}

/// Builds the error for a non-success response body.
///
/// Uses the server's `reason` or `detail` field when the body is JSON,
/// otherwise the raw text.
pub(crate) fn http_error_from_body(status: u16, body: &str) -> ClientError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| {
            ["reason", "detail"]
                .iter()
                .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
        })
        .map(|value| match value.as_str() {
            Some(text) => text.to_string(),
            None => value.to_string(),
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                "<empty body>".to_string()
            } else {
                body.to_string()
            }
        });
    ClientError::Http { status, message }
}
