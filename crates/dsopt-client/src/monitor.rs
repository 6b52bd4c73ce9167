use std::time::Duration;

use futures::{Stream, StreamExt as _};
use once_cell::sync::OnceCell;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::archive::{DatasetOptimizationResults, Materializer, validate_run_id};
use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::resources::unlearning::{UnlearningKind, result_payload};
use crate::run::{
    MAX_SUBSCRIPTIONS_RETRIES, ProgressEvent, ProgressSink, RunEvents, consume_run,
    progress_stream,
};
use crate::sse::{
    EventSource, ReqwestAsyncEventSourceConnector, ReqwestEventSourceConnector, event_stream,
};
use crate::table::{DefaultTables, TableReader};
use crate::transport::{BlockingTransport, Transport};

/// Entry point for following optimization runs.
///
/// Construct one per process and share it. The blocking methods
/// (`run_events`, `check_run`) use reqwest's blocking client and must not be
/// called from inside an async runtime; use `watch_run` there.
pub struct RunMonitor<R = DefaultTables> {
    config: ClientConfig,
    stream_transport: OnceCell<BlockingTransport>,
    async_transport: Transport,
    materializer: Materializer<R>,
}

impl RunMonitor<DefaultTables> {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_tables(config, DefaultTables::default())
    }
}

impl<R: TableReader> RunMonitor<R> {
    /// Creates a monitor with an explicit table capability.
    pub fn with_tables(config: ClientConfig, tables: R) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            async_transport: Transport::new(client, config.transport_retry.clone()),
            stream_transport: OnceCell::new(),
            materializer: Materializer::new(config.clone(), tables),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn materializer(&self) -> &Materializer<R> {
        &self.materializer
    }

    fn stream_transport(&self) -> Result<&BlockingTransport, ClientError> {
        self.stream_transport.get_or_try_init(|| {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.config.connect_timeout)
                .timeout(None::<Duration>)
                .build()
                .map_err(|e| ClientError::Config(format!("failed to build stream client: {e}")))?;
            Ok(BlockingTransport::new(client, self.config.transport_retry.clone()))
        })
    }

    fn run_url(&self, run_id: &str) -> Result<String, ClientError> {
        validate_run_id(run_id)?;
        Ok(self.config.url(&format!("dataset-optimization/run/{run_id}")))
    }

    /// Blocking progress events for `run_id`. Each resubscription opens a
    /// fresh event stream.
    pub fn run_events(
        &self,
        run_id: &str,
    ) -> Result<impl Iterator<Item = Result<ProgressEvent, ClientError>> + 'static, ClientError>
    {
        let connector = ReqwestEventSourceConnector::new(
            self.stream_transport()?.clone(),
            Method::GET,
            self.run_url(run_id)?,
            self.config.auth_headers()?,
        );
        let backoff = self.config.stream_reconnect.clone();
        debug!(event = "run.check_started", domain = "run", run_id = run_id);
        Ok(RunEvents::new(run_id, move || {
            EventSource::new(connector.clone(), backoff.clone())
        }))
    }

    /// Async progress events for `run_id`, with the same resubscription
    /// rules as `run_events`.
    pub fn watch_run(
        &self,
        run_id: &str,
    ) -> Result<impl Stream<Item = Result<ProgressEvent, ClientError>> + Send + 'static, ClientError>
    {
        let connector = ReqwestAsyncEventSourceConnector::new(
            self.async_transport.clone(),
            Method::GET,
            self.run_url(run_id)?,
            self.config.auth_headers()?,
        );
        let backoff = self.config.stream_reconnect.clone();
        Ok(progress_stream(run_id.to_string(), MAX_SUBSCRIPTIONS_RETRIES, move || {
            event_stream(connector.clone(), backoff.clone())
        }))
    }

    fn unlearning_url(&self, kind: UnlearningKind, run_id: &str) -> Result<String, ClientError> {
        validate_run_id(run_id)?;
        Ok(self.config.url(&kind.run_path(run_id)))
    }

    /// Blocking result payloads of an unlearning run, one per event, with
    /// keep-alive pings dropped. Ends when the server closes the stream.
    pub fn unlearning_results(
        &self,
        kind: UnlearningKind,
        run_id: &str,
    ) -> Result<impl Iterator<Item = Result<Value, ClientError>> + 'static, ClientError> {
        let connector = ReqwestEventSourceConnector::new(
            self.stream_transport()?.clone(),
            Method::GET,
            self.unlearning_url(kind, run_id)?,
            self.config.auth_headers()?,
        );
        let events = EventSource::new(connector, self.config.stream_reconnect.clone());
        Ok(events.filter_map(|item| match item {
            Ok(event) => result_payload(event),
            Err(err) => Some(Err(err)),
        }))
    }

    /// Async counterpart of `unlearning_results`.
    pub fn watch_unlearning_results(
        &self,
        kind: UnlearningKind,
        run_id: &str,
    ) -> Result<impl Stream<Item = Result<Value, ClientError>> + Send + 'static, ClientError> {
        let connector = ReqwestAsyncEventSourceConnector::new(
            self.async_transport.clone(),
            Method::GET,
            self.unlearning_url(kind, run_id)?,
            self.config.auth_headers()?,
        );
        let events = event_stream(connector, self.config.stream_reconnect.clone());
        Ok(events.filter_map(|item| {
            futures::future::ready(match item {
                Ok(event) => result_payload(event),
                Err(err) => Some(Err(err)),
            })
        }))
    }

    /// Follows `run_id` to completion, reporting progress to `sink`.
    ///
    /// Returns the materialized results on success, or `None` when
    /// `stop_on_manual_approval` is set and the run awaits approval. That
    /// stop abandons the subscription; call again to resume watching.
    pub fn check_run(
        &self,
        run_id: &str,
        stop_on_manual_approval: bool,
        sink: impl ProgressSink,
    ) -> Result<Option<DatasetOptimizationResults<R::Table>>, ClientError> {
        let events = self.run_events(run_id)?;
        consume_run(events, sink, stop_on_manual_approval, |event| {
            let url = archive_url(event)?;
            self.materializer.materialize(run_id, url)
        })
    }
}

fn archive_url(event: &ProgressEvent) -> Result<&str, ClientError> {
    event
        .result
        .as_ref()
        .and_then(|result| result.as_str())
        .ok_or_else(|| ClientError::protocol_msg("successful run carries no result archive URL"))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use futures::TryStreamExt as _;
    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::run::{LogProgress, RunStatus};
    use crate::table::NoTables;

    fn config(server: &mockito::ServerGuard, cache: &std::path::Path) -> ClientConfig {
        ClientConfig::new("key")
            .api_host(server.url())
            .cache_dir(cache)
            .transport_retry(RetryPolicy::none())
            .stream_reconnect(RetryPolicy::none())
    }

    fn sse(events: &[&str]) -> String {
        events
            .iter()
            .enumerate()
            .map(|(idx, data)| format!("id: {idx}\ndata: {data}\n\n"))
            .collect()
    }

    fn zip_bytes(members: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn check_run_follows_stream_and_materializes_results() {
        let cache = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new();
        let archive = server
            .mock("GET", "/dataset-optimization/run/local-download/out/r1.zip")
            .with_status(200)
            .with_body(zip_bytes(&[
                ("suspects.csv", "image_path\na.png\n"),
                ("warnings_and_errors.csv", "status\n"),
            ]))
            .create();
        let stream = server
            .mock("GET", "/dataset-optimization/run/r1")
            .match_header("authorization", "Bearer key")
            .match_header("hirundo-api-version", "0.2")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse(&[
                r#"{"data":{"state":"STARTED","result":null}}"#,
                r#"{"data":{"state":null,"result":{"result":"Training: 50% done"}}}"#,
                r#"{"data":{"state":"SUCCESS","result":"file:///out/r1.zip"}}"#,
            ]))
            .create();

        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let results = monitor
            .check_run("r1", false, LogProgress::default())
            .unwrap()
            .unwrap();
        assert_eq!(results.cached_archive_path, cache.path().join("r1.zip"));
        assert!(results.suspects.is_none());
        stream.assert();
        archive.assert();
    }

    #[test]
    fn check_run_raises_failure_with_server_message() {
        let cache = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dataset-optimization/run/r2")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse(&[r#"{"data":{"state":"FAILURE","result":"disk full"}}"#]))
            .create();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let err = monitor
            .check_run("r2", false, LogProgress::default())
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn check_run_stops_on_manual_approval_when_asked() {
        let cache = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dataset-optimization/run/r3")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse(&[
                r#"{"data":{"state":"AWAITING MANUAL APPROVAL","result":null}}"#,
            ]))
            .create();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let out = monitor
            .check_run("r3", true, LogProgress::default())
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn unknown_run_surfaces_http_error() {
        let cache = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dataset-optimization/run/missing")
            .with_status(404)
            .with_body(r#"{"detail":"Run not found"}"#)
            .create();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let err = monitor
            .check_run("missing", false, LogProgress::default())
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn run_ids_that_escape_the_cache_are_rejected() {
        let monitor = RunMonitor::with_tables(ClientConfig::new("key"), NoTables).unwrap();
        assert!(matches!(
            monitor.run_events("../etc").map(|_| ()),
            Err(ClientError::Validation(_))
        ));
        assert!(matches!(
            monitor.run_events("  ").map(|_| ()),
            Err(ClientError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn watch_run_yields_every_progress_event() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/dataset-optimization/run/r4")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(format!(
                "event: ping\ndata: {{}}\n\n{}",
                sse(&[
                    r#"{"data":{"state":"STARTED","result":null}}"#,
                    r#"{"data":{"state":"SUCCESS","result":"s3://bucket/r4.zip"}}"#,
                ])
            ))
            .create_async()
            .await;
        let cache = tempfile::tempdir().unwrap();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        // The stream must outlive the borrowed id and run on another task.
        let stream = {
            let run_id = String::from("r4");
            monitor.watch_run(&run_id).unwrap()
        };
        let events: Vec<ProgressEvent> = tokio::spawn(stream.try_collect::<Vec<_>>())
            .await
            .unwrap()
            .unwrap();
        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![Some(RunStatus::Started), Some(RunStatus::Success)]);
    }

    #[test]
    fn unlearning_results_yield_payloads_without_pings() {
        let cache = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new();
        let stream = server
            .mock("GET", "/unlearning/run/u-7")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(format!(
                "event: ping\ndata: {{}}\n\n{}",
                sse(&[
                    r#"{"data":{"state":"STARTED","result":null}}"#,
                    r#"{"data":{"state":"SUCCESS","result":{"accuracy":0.9}}}"#,
                ])
            ))
            .create();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let payloads: Vec<Value> = monitor
            .unlearning_results(UnlearningKind::Vision, "u-7")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["result"]["accuracy"], 0.9);
        stream.assert();
        assert!(matches!(
            monitor.unlearning_results(UnlearningKind::Vision, "../u").map(|_| ()),
            Err(ClientError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn watch_unlearning_results_reads_the_llm_stream() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/unlearning-llm-behavior/run/l-2")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse(&[r#"{"data":{"state":"AWAITING MANUAL APPROVAL","result":null}}"#]))
            .create_async()
            .await;
        let cache = tempfile::tempdir().unwrap();
        let monitor = RunMonitor::with_tables(config(&server, cache.path()), NoTables).unwrap();
        let payloads: Vec<Value> = monitor
            .watch_unlearning_results(UnlearningKind::LlmBehavior, "l-2")
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(payloads, vec![serde_json::json!({"state": "AWAITING MANUAL APPROVAL", "result": null})]);
    }
}
