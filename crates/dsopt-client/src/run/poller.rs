use std::pin::Pin;

use futures::{Stream, StreamExt as _, stream};
use tracing::{debug, info};

use super::{ProgressEvent, Reduced, RunStatus, reduce_event};
use crate::errors::ClientError;
use crate::sse::SseEvent;

/// Reopened subscriptions allowed for one run-check after the first one.
pub const MAX_SUBSCRIPTIONS_RETRIES: u32 = 200;

/// Subscription state machine shared by the blocking and async pollers.
///
/// Each subscription starts with no last event. When a subscription ends
/// with no event or with `PENDING` as its last state, the server had not
/// started the run yet and a fresh subscription is opened.
#[derive(Debug)]
struct Poller {
    run_id: String,
    resubscribes: u32,
    ceiling: u32,
    last_state: Option<Option<RunStatus>>,
}

impl Poller {
    fn new(run_id: impl Into<String>, ceiling: u32) -> Self {
        Self {
            run_id: run_id.into(),
            resubscribes: 0,
            ceiling,
            last_state: None,
        }
    }

    fn begin_subscription(&mut self) -> Result<(), ClientError> {
        if self.resubscribes > self.ceiling {
            return Err(ClientError::MaxRetriesReached {
                run_id: self.run_id.clone(),
                attempts: self.resubscribes,
            });
        }
        debug!(
            event = "run.subscribe",
            domain = "run",
            run_id = %self.run_id,
            resubscribes = self.resubscribes
        );
        self.last_state = None;
        Ok(())
    }

    fn on_event(&mut self, event: &SseEvent) -> Result<Option<ProgressEvent>, ClientError> {
        match reduce_event(event)? {
            Reduced::Ping => Ok(None),
            Reduced::Empty => {
                self.last_state = None;
                Ok(None)
            }
            Reduced::Progress(progress) => {
                debug!(
                    event = "run.progress_event",
                    domain = "run",
                    run_id = %self.run_id,
                    event_id = %event.id,
                    state = progress.state.map(RunStatus::wire_name).unwrap_or("null")
                );
                self.last_state = Some(progress.state);
                Ok(Some(progress))
            }
        }
    }

    /// Called when a subscription ends. Returns whether to resubscribe.
    fn on_end(&mut self) -> bool {
        let resubscribe = matches!(self.last_state, None | Some(Some(RunStatus::Pending)));
        if resubscribe {
            self.resubscribes = self.resubscribes.saturating_add(1);
            info!(
                event = "run.resubscribe_scheduled",
                domain = "run",
                run_id = %self.run_id,
                resubscribes = self.resubscribes
            );
        }
        resubscribe
    }
}

/// Blocking sequence of [`ProgressEvent`]s for one run.
///
/// `subscribe` opens a fresh event subscription (with a fresh cursor) each
/// time it is called. The sequence ends when a subscription closes after a
/// non-pending event, or fails with the first error.
pub struct RunEvents<S, F> {
    poller: Poller,
    subscribe: F,
    current: Option<S>,
    done: bool,
}

impl<S, F> RunEvents<S, F>
where
    S: Iterator<Item = Result<SseEvent, ClientError>>,
    F: FnMut() -> S,
{
    pub fn new(run_id: impl Into<String>, subscribe: F) -> Self {
        Self::with_ceiling(run_id, MAX_SUBSCRIPTIONS_RETRIES, subscribe)
    }

    pub fn with_ceiling(run_id: impl Into<String>, ceiling: u32, subscribe: F) -> Self {
        Self {
            poller: Poller::new(run_id, ceiling),
            subscribe,
            current: None,
            done: false,
        }
    }

    fn fail(&mut self, err: ClientError) -> Option<Result<ProgressEvent, ClientError>> {
        self.done = true;
        self.current = None;
        Some(Err(err))
    }
}

impl<S, F> Iterator for RunEvents<S, F>
where
    S: Iterator<Item = Result<SseEvent, ClientError>>,
    F: FnMut() -> S,
{
    type Item = Result<ProgressEvent, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(source) = self.current.as_mut() else {
                if let Err(err) = self.poller.begin_subscription() {
                    return self.fail(err);
                }
                self.current = Some((self.subscribe)());
                continue;
            };
            match source.next() {
                Some(Ok(event)) => match self.poller.on_event(&event) {
                    Ok(Some(progress)) => return Some(Ok(progress)),
                    Ok(None) => {}
                    Err(err) => return self.fail(err),
                },
                Some(Err(err)) => return self.fail(err),
                None => {
                    self.current = None;
                    if !self.poller.on_end() {
                        self.done = true;
                    }
                }
            }
        }
    }
}

/// Async counterpart of [`RunEvents`]: yields every [`ProgressEvent`].
pub fn progress_stream<S, F>(
    run_id: impl Into<String>,
    ceiling: u32,
    subscribe: F,
) -> impl Stream<Item = Result<ProgressEvent, ClientError>> + Send
where
    S: Stream<Item = Result<SseEvent, ClientError>> + Send + 'static,
    F: FnMut() -> S + Send + 'static,
{
    struct State<S, F> {
        poller: Poller,
        subscribe: F,
        current: Option<Pin<Box<S>>>,
        done: bool,
    }

    stream::unfold(
        State {
            poller: Poller::new(run_id, ceiling),
            subscribe,
            current: None,
            done: false,
        },
        |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                if state.current.is_none() {
                    if let Err(err) = state.poller.begin_subscription() {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    state.current = Some(Box::pin((state.subscribe)()));
                    continue;
                }
                let Some(source) = state.current.as_mut() else {
                    continue;
                };
                match source.next().await {
                    Some(Ok(event)) => match state.poller.on_event(&event) {
                        Ok(Some(progress)) => return Some((Ok(progress), state)),
                        Ok(None) => {}
                        Err(err) => {
                            state.done = true;
                            state.current = None;
                            return Some((Err(err), state));
                        }
                    },
                    Some(Err(err)) => {
                        state.done = true;
                        state.current = None;
                        return Some((Err(err), state));
                    }
                    None => {
                        state.current = None;
                        if !state.poller.on_end() {
                            state.done = true;
                        }
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use futures::TryStreamExt as _;

    use super::*;

    fn event(data: &str) -> Result<SseEvent, ClientError> {
        Ok(SseEvent {
            id: "0".into(),
            event: "message".into(),
            data: data.into(),
            retry: None,
        })
    }

    fn ping() -> Result<SseEvent, ClientError> {
        Ok(SseEvent {
            id: "0".into(),
            event: "ping".into(),
            data: String::new(),
            retry: None,
        })
    }

    const PENDING: &str = r#"{"data":{"state":"PENDING","result":null}}"#;
    const SUCCESS: &str = r#"{"data":{"state":"SUCCESS","result":"file:///r.zip"}}"#;

    #[test]
    fn pending_drop_resubscribes_until_terminal() {
        let opens = Rc::new(Cell::new(0u32));
        let counter = opens.clone();
        let events: Vec<ProgressEvent> = RunEvents::new("run-1", move || {
            counter.set(counter.get() + 1);
            match counter.get() {
                1 => vec![ping(), event(PENDING)],
                2 => vec![],
                _ => vec![event(PENDING), event(SUCCESS)],
            }
            .into_iter()
        })
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(opens.get(), 3);
        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                Some(RunStatus::Pending),
                Some(RunStatus::Pending),
                Some(RunStatus::Success)
            ]
        );
    }

    #[test]
    fn retry_ceiling_allows_200_resubscribes_then_fails() {
        let opens = Rc::new(Cell::new(0u32));
        let counter = opens.clone();
        let mut events = RunEvents::new("run-2", move || {
            counter.set(counter.get() + 1);
            vec![event(PENDING)].into_iter()
        });
        let mut last = None;
        for item in events.by_ref() {
            last = Some(item);
        }
        assert_eq!(opens.get(), 201);
        assert_eq!(
            last,
            Some(Err(ClientError::MaxRetriesReached {
                run_id: "run-2".into(),
                attempts: 201,
            }))
        );
        assert!(events.next().is_none());
    }

    #[test]
    fn stage_report_as_last_event_ends_without_resubscribe() {
        let opens = Rc::new(Cell::new(0u32));
        let counter = opens.clone();
        let events: Vec<ProgressEvent> = RunEvents::new("run-3", move || {
            counter.set(counter.get() + 1);
            vec![event(r#"{"data":{"state":null,"result":"Stage A: 10% done"}}"#)].into_iter()
        })
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(opens.get(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn error_body_terminates_the_sequence() {
        let mut events = RunEvents::new("run-4", || {
            vec![event(PENDING), event(r#"{"detail":"Run was deleted"}"#), event(SUCCESS)]
                .into_iter()
        });
        assert!(events.next().unwrap().is_ok());
        let err = events.next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Run was deleted");
        assert!(events.next().is_none());
    }

    #[tokio::test]
    async fn async_stream_matches_blocking_semantics() {
        let opens = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = opens.clone();
        let events: Vec<ProgressEvent> = progress_stream("run-5", MAX_SUBSCRIPTIONS_RETRIES, move || {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let items = if n == 0 {
                vec![event(PENDING)]
            } else {
                vec![ping(), event(SUCCESS)]
            };
            stream::iter(items)
        })
        .try_collect()
        .await
        .unwrap();
        assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(events.last().and_then(|e| e.state), Some(RunStatus::Success));
    }

    #[tokio::test]
    async fn async_stream_enforces_ceiling() {
        let err = progress_stream("run-6", 2, || {
            stream::iter(Vec::<Result<SseEvent, ClientError>>::new())
        })
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::MaxRetriesReached {
                run_id: "run-6".into(),
                attempts: 3,
            }
        );
    }
}
