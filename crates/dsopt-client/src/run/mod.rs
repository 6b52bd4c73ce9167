//! Run status model and the run-status poller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;
use crate::sse::SseEvent;

mod poller;
mod progress;

pub use poller::{MAX_SUBSCRIPTIONS_RETRIES, RunEvents, progress_stream};
pub use progress::{LogProgress, ProgressSink, ProgressUpdate, consume_run};

/// Server-side state of an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "AWAITING MANUAL APPROVAL")]
    AwaitingManualApproval,
    #[serde(rename = "REVOKED")]
    Revoked,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl RunStatus {
    pub const ALL: [RunStatus; 8] = [
        RunStatus::Pending,
        RunStatus::Started,
        RunStatus::Retry,
        RunStatus::Success,
        RunStatus::Failure,
        RunStatus::AwaitingManualApproval,
        RunStatus::Revoked,
        RunStatus::Rejected,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Started => "STARTED",
            RunStatus::Retry => "RETRY",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::AwaitingManualApproval => "AWAITING MANUAL APPROVAL",
            RunStatus::Revoked => "REVOKED",
            RunStatus::Rejected => "REJECTED",
        }
    }

    /// No further events are expected after a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Revoked | RunStatus::Rejected
        )
    }

    /// Terminal states that end a run-check with an error.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunStatus::Failure | RunStatus::Revoked | RunStatus::Rejected
        )
    }

    /// Progress percentage shown for this state.
    pub fn progress(self) -> f64 {
        match self {
            RunStatus::Pending | RunStatus::Started | RunStatus::Retry | RunStatus::Rejected => 0.0,
            RunStatus::Success
            | RunStatus::Failure
            | RunStatus::AwaitingManualApproval
            | RunStatus::Revoked => 100.0,
        }
    }

    /// Human status line for this state.
    pub fn status_text(self) -> &'static str {
        match self {
            RunStatus::Pending => "Optimization run queued and not yet started",
            RunStatus::Started => "Optimization run in progress. Downloading dataset",
            RunStatus::Retry => "Optimization run failed. Retrying",
            RunStatus::Success => "Optimization run completed successfully",
            RunStatus::Failure => "Optimization run failed",
            RunStatus::AwaitingManualApproval => "Awaiting manual approval",
            RunStatus::Revoked => "Optimization run was cancelled",
            RunStatus::Rejected => "Optimization run was rejected",
        }
    }

    pub(crate) fn outcome_verb(self) -> &'static str {
        match self {
            RunStatus::Rejected => "was rejected",
            RunStatus::Revoked => "was cancelled",
            _ => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for RunStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.wire_name() == s)
            .ok_or_else(|| ClientError::protocol_msg(format!("unknown run state {s:?}")))
    }
}

/// One progress report for a run.
///
/// `state` is `None` for intermediate stage reports, whose `result` carries
/// text such as `"Stage A: 37% done"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub state: Option<RunStatus>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl ProgressEvent {
    /// Stage text of an intermediate report, either the result itself or
    /// the nested `result.result` string.
    pub fn stage_text(&self) -> Option<&str> {
        match self.result.as_ref()? {
            Value::String(text) => Some(text),
            Value::Object(map) => map.get("result").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Result payload rendered for error messages.
    pub fn result_message(&self) -> String {
        match &self.result {
            None | Some(Value::Null) => "unknown error".to_string(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Classification of one raw stream event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reduced {
    /// Keepalive.
    Ping,
    /// `null` or empty body.
    Empty,
    Progress(ProgressEvent),
}

/// Turns one raw event into a progress report, or into the domain error
/// the server sent instead of `data`.
pub(crate) fn reduce_event(event: &SseEvent) -> Result<Reduced, ClientError> {
    if event.event == "ping" {
        return Ok(Reduced::Ping);
    }
    let body: Value = serde_json::from_str(&event.data).map_err(|e| {
        ClientError::protocol_msg(format!("event {} is not valid JSON: {e}", event.id))
    })?;
    if is_empty_body(&body) {
        return Ok(Reduced::Empty);
    }
    if let Some(data) = body.get("data") {
        let progress = serde_json::from_value::<ProgressEvent>(data.clone())
            .map_err(|e| ClientError::protocol_msg(format!("invalid progress payload: {e}")))?;
        return Ok(Reduced::Progress(progress));
    }
    let message = ["detail", "reason"]
        .iter()
        .find_map(|key| body.get(*key).filter(|v| !v.is_null()))
        .map(|value| match value.as_str() {
            Some(text) => text.to_string(),
            None => value.to_string(),
        })
        .unwrap_or_else(|| "unknown error".to_string());
    Err(ClientError::run_failed(None, message))
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(event: &str, data: &str) -> SseEvent {
        SseEvent {
            id: "1".into(),
            event: event.into(),
            data: data.into(),
            retry: None,
        }
    }

    #[test]
    fn run_status_parses_strictly() {
        for status in RunStatus::ALL {
            assert_eq!(status.wire_name().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!(
            "AWAITING MANUAL APPROVAL".parse::<RunStatus>().unwrap(),
            RunStatus::AwaitingManualApproval
        );
        assert!("pending".parse::<RunStatus>().is_err());
        assert!("PAUSED".parse::<RunStatus>().is_err());
    }

    #[test]
    fn progress_lookup_matches_state_table() {
        assert_eq!(RunStatus::Pending.progress(), 0.0);
        assert_eq!(RunStatus::Started.progress(), 0.0);
        assert_eq!(RunStatus::Retry.progress(), 0.0);
        assert_eq!(RunStatus::Rejected.progress(), 0.0);
        assert_eq!(RunStatus::Success.progress(), 100.0);
        assert_eq!(RunStatus::Failure.progress(), 100.0);
        assert_eq!(RunStatus::Revoked.progress(), 100.0);
        assert_eq!(RunStatus::AwaitingManualApproval.progress(), 100.0);
        assert!(!RunStatus::AwaitingManualApproval.is_terminal());
        assert!(RunStatus::Rejected.is_terminal());
    }

    #[test]
    fn data_payload_is_yielded_unchanged() {
        let reduced = reduce_event(&raw(
            "message",
            r#"{"data":{"state":"STARTED","result":{"k":[1,2]}}}"#,
        ))
        .unwrap();
        assert_eq!(
            reduced,
            Reduced::Progress(ProgressEvent {
                state: Some(RunStatus::Started),
                result: Some(serde_json::json!({"k":[1,2]})),
            })
        );
    }

    #[test]
    fn detail_and_reason_become_domain_errors() {
        let err = reduce_event(&raw("message", r#"{"detail":"Run not found"}"#)).unwrap_err();
        assert_eq!(err.to_string(), "Run not found");
        let err = reduce_event(&raw("message", r#"{"reason":"quota exceeded"}"#)).unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        let err = reduce_event(&raw("message", r#"{"other":1}"#)).unwrap_err();
        assert_eq!(err.to_string(), "unknown error");
    }

    #[test]
    fn ping_and_empty_bodies_are_classified() {
        assert_eq!(reduce_event(&raw("ping", "not json")).unwrap(), Reduced::Ping);
        assert_eq!(reduce_event(&raw("message", "null")).unwrap(), Reduced::Empty);
        assert_eq!(reduce_event(&raw("message", "{}")).unwrap(), Reduced::Empty);
    }

    #[test]
    fn unknown_state_in_payload_is_a_protocol_error() {
        let err = reduce_event(&raw("message", r#"{"data":{"state":"PAUSED"}}"#)).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn stage_text_reads_plain_and_nested_results() {
        let plain = ProgressEvent {
            state: None,
            result: Some(Value::String("Stage A: 37% done".into())),
        };
        assert_eq!(plain.stage_text(), Some("Stage A: 37% done"));
        let nested = ProgressEvent {
            state: None,
            result: Some(serde_json::json!({"result": "Indexing"})),
        };
        assert_eq!(nested.stage_text(), Some("Indexing"));
    }
}
