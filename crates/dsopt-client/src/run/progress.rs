use tracing::info;

use super::{ProgressEvent, RunStatus};
use crate::errors::ClientError;

const UPLOADING_TEXT: &str = "Optimization run completed. Uploading results";

/// Status line and percentage derived from one progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: String,
    pub percent: f64,
}

/// Receives progress while a run is consumed to completion.
pub trait ProgressSink {
    fn update(&mut self, update: &ProgressUpdate);

    /// Called once when consumption stops, whatever the outcome.
    fn finish(&mut self) {}
}

/// Sink that reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress {
    last: Option<ProgressUpdate>,
}

impl ProgressSink for LogProgress {
    fn update(&mut self, update: &ProgressUpdate) {
        if self.last.as_ref() == Some(update) {
            return;
        }
        info!(
            event = "run.progress",
            domain = "run",
            status = %update.status,
            percent = update.percent
        );
        self.last = Some(update.clone());
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for &mut S {
    fn update(&mut self, update: &ProgressUpdate) {
        (**self).update(update);
    }

    fn finish(&mut self) {
        (**self).finish();
    }
}

/// Maps progress events to display updates, holding the last percentage
/// when a stage report carries none.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    percent: f64,
}

impl ProgressTracker {
    pub fn observe(&mut self, event: &ProgressEvent) -> Option<ProgressUpdate> {
        match event.state {
            Some(state) => {
                self.percent = state.progress();
                Some(ProgressUpdate {
                    status: state.status_text().to_string(),
                    percent: self.percent,
                })
            }
            None => {
                let (stage, percent) = parse_stage_text(event.stage_text()?);
                if let Some(percent) = percent {
                    self.percent = percent;
                }
                let status = if self.percent == 100.0 {
                    UPLOADING_TEXT.to_string()
                } else {
                    stage.to_string()
                };
                Some(ProgressUpdate {
                    status,
                    percent: self.percent,
                })
            }
        }
    }
}

/// Splits `"<stage>: <pct>% done"` into its parts. The percentage is
/// `None` when absent or unparseable.
fn parse_stage_text(text: &str) -> (&str, Option<f64>) {
    let mut parts = text.split(':');
    let stage = parts.next().unwrap_or_default();
    let percent = parts.next().and_then(|raw| {
        let raw = raw.strip_prefix(' ').unwrap_or(raw);
        raw.strip_suffix("% done").unwrap_or(raw).trim().parse::<f64>().ok()
    });
    (stage, percent)
}

/// How a consumed run settled.
enum Settled {
    Success(ProgressEvent),
    AwaitingApproval,
}

/// Consumes progress events until the run settles.
///
/// Failure states raise `RunFailed` with the server's result. `SUCCESS`
/// hands its event to `on_success` and returns what it produces. With
/// `stop_on_manual_approval`, `AWAITING MANUAL APPROVAL` returns `None`.
/// The event source is dropped, closing its connection, before
/// `on_success` runs.
pub fn consume_run<I, T, F>(
    events: I,
    mut sink: impl ProgressSink,
    stop_on_manual_approval: bool,
    on_success: F,
) -> Result<Option<T>, ClientError>
where
    I: IntoIterator<Item = Result<ProgressEvent, ClientError>>,
    F: FnOnce(&ProgressEvent) -> Result<T, ClientError>,
{
    let settled = settle(events.into_iter(), &mut sink, stop_on_manual_approval);
    sink.finish();
    match settled? {
        Settled::Success(event) => on_success(&event).map(Some),
        Settled::AwaitingApproval => Ok(None),
    }
}

fn settle<I>(
    events: I,
    sink: &mut impl ProgressSink,
    stop_on_manual_approval: bool,
) -> Result<Settled, ClientError>
where
    I: Iterator<Item = Result<ProgressEvent, ClientError>>,
{
    let mut tracker = ProgressTracker::default();
    for item in events {
        let event = item?;
        if let Some(update) = tracker.observe(&event) {
            sink.update(&update);
        }
        match event.state {
            Some(state) if state.is_failure() => {
                return Err(ClientError::run_failed(Some(state), event.result_message()));
            }
            Some(RunStatus::Success) => return Ok(Settled::Success(event)),
            Some(RunStatus::AwaitingManualApproval) if stop_on_manual_approval => {
                return Ok(Settled::AwaitingApproval);
            }
            _ => {}
        }
    }
    Err(ClientError::run_failed(None, "run ended with an unknown error"))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        percents: Vec<f64>,
        statuses: Vec<String>,
        finished: bool,
    }

    impl ProgressSink for RecordingSink {
        fn update(&mut self, update: &ProgressUpdate) {
            self.percents.push(update.percent);
            self.statuses.push(update.status.clone());
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    fn progress(state: Option<RunStatus>, result: Value) -> Result<ProgressEvent, ClientError> {
        Ok(ProgressEvent {
            state,
            result: Some(result),
        })
    }

    #[test]
    fn happy_path_reports_0_0_37_100_and_materializes() {
        let events = vec![
            progress(Some(RunStatus::Pending), Value::Null),
            progress(Some(RunStatus::Started), Value::Null),
            progress(None, json!({"result": "Stage A: 37% done"})),
            progress(Some(RunStatus::Success), json!("file:///results/run.zip")),
        ];
        let mut sink = RecordingSink::default();
        let out = consume_run(events, &mut sink, false, |event| {
            Ok(event.result.clone().unwrap_or_default())
        })
        .unwrap();
        assert_eq!(sink.percents, vec![0.0, 0.0, 37.0, 100.0]);
        assert_eq!(sink.statuses[2], "Stage A");
        assert!(sink.finished);
        assert_eq!(out, Some(json!("file:///results/run.zip")));
    }

    /// Event source that records when it is dropped.
    struct TrackedEvents {
        inner: std::vec::IntoIter<Result<ProgressEvent, ClientError>>,
        dropped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Iterator for TrackedEvents {
        type Item = Result<ProgressEvent, ClientError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }
    }

    impl Drop for TrackedEvents {
        fn drop(&mut self) {
            self.dropped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn event_source_is_released_before_results_are_fetched() {
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let events = TrackedEvents {
            inner: vec![
                progress(Some(RunStatus::Started), Value::Null),
                progress(Some(RunStatus::Success), json!("s3://bucket/run.zip")),
                progress(Some(RunStatus::Started), Value::Null),
            ]
            .into_iter(),
            dropped: dropped.clone(),
        };
        let out = consume_run(events, RecordingSink::default(), false, |_| {
            Ok(dropped.load(std::sync::atomic::Ordering::SeqCst))
        })
        .unwrap();
        assert_eq!(out, Some(true));
    }

    #[test]
    fn failure_raises_with_server_result() {
        let events = vec![
            progress(Some(RunStatus::Started), Value::Null),
            progress(Some(RunStatus::Failure), json!("disk full")),
        ];
        let err = consume_run(events, LogProgress::default(), false, |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(matches!(
            err,
            ClientError::RunFailed {
                state: Some(RunStatus::Failure),
                ..
            }
        ));
    }

    #[test]
    fn manual_approval_stop_returns_none() {
        let events = vec![progress(Some(RunStatus::AwaitingManualApproval), Value::Null)];
        let out = consume_run(events, LogProgress::default(), true, |_| Ok(1)).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn manual_approval_without_opt_in_keeps_consuming() {
        let events = vec![
            progress(Some(RunStatus::AwaitingManualApproval), Value::Null),
            progress(Some(RunStatus::Success), json!("file:///x.zip")),
        ];
        let out = consume_run(events, LogProgress::default(), false, |_| Ok(7)).unwrap();
        assert_eq!(out, Some(7));
    }

    #[test]
    fn stream_without_terminal_state_is_an_error() {
        let events = vec![progress(Some(RunStatus::Started), Value::Null)];
        let err = consume_run(events, LogProgress::default(), false, |_| Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "run ended with an unknown error");
    }

    #[test]
    fn stage_text_without_percentage_holds_previous_value() {
        let mut tracker = ProgressTracker::default();
        let update = tracker
            .observe(&ProgressEvent {
                state: None,
                result: Some(json!("Stage B: 100% done")),
            })
            .unwrap();
        assert_eq!(update.percent, 100.0);
        assert_eq!(update.status, UPLOADING_TEXT);

        let update = tracker
            .observe(&ProgressEvent {
                state: None,
                result: Some(json!("Finalizing")),
            })
            .unwrap();
        assert_eq!(update.percent, 100.0);
        assert_eq!(update.status, UPLOADING_TEXT);

        let mut tracker = ProgressTracker::default();
        tracker.observe(&ProgressEvent {
            state: None,
            result: Some(json!("Stage C: 12.5% done")),
        });
        let update = tracker
            .observe(&ProgressEvent {
                state: None,
                result: Some(json!("Stage D")),
            })
            .unwrap();
        assert_eq!(update.percent, 12.5);
        assert_eq!(update.status, "Stage D");
    }

    #[test]
    fn stage_reports_without_text_produce_no_update() {
        let mut tracker = ProgressTracker::default();
        assert!(
            tracker
                .observe(&ProgressEvent {
                    state: None,
                    result: None,
                })
                .is_none()
        );
    }
}
