//! Client for the dataset optimization API.
//!
//! The core is run monitoring: a retrying server-sent-event reader, a
//! run-status poller that turns raw events into [`ProgressEvent`]s, and a
//! materializer that downloads the result archive and parses its tables.
//! [`ApiClient`] covers the request/response endpoints around it.
//!
//! # Following a run
//!
//! ```no_run
//! use dsopt_client::prelude::*;
//!
//! # fn main() -> Result<(), ClientError> {
//! let config = ClientConfig::from_env()?;
//! let api = ApiClient::new(config.clone())?;
//! let run_id = api.launch_run(42, None, None)?;
//!
//! let monitor = RunMonitor::new(config)?;
//! if let Some(results) = monitor.check_run(&run_id, false, LogProgress::default())? {
//!     println!("archive cached at {}", results.cached_archive_path.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Inside an async runtime use [`RunMonitor::watch_run`], which yields the
//! same events as a `Stream`.

/// Result archive download and member extraction.
pub mod archive;
/// Client configuration and request headers.
pub mod config;
/// Local credential file store.
pub mod credentials;
/// Public error types.
pub mod errors;
/// Run-check entry point.
pub mod monitor;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Dataset, run, storage, git repository and unlearning endpoints.
pub mod resources;
/// Retry and backoff policies.
pub mod retry;
/// Run states, progress reports and the status poller.
pub mod run;
/// API request and response types.
pub mod schema;
/// Server-sent event reader, blocking and async.
pub mod sse;
/// Typed table parsing for archive members.
pub mod table;
/// HTTP executors with bounded retry.
pub mod transport;

pub use archive::{DatasetOptimizationResults, Materializer, load_from_zip};
pub use config::ClientConfig;
pub use errors::ClientError;
pub use monitor::RunMonitor;
pub use resources::ApiClient;
pub use resources::unlearning::UnlearningKind;
pub use retry::RetryPolicy;
pub use run::{LogProgress, ProgressEvent, ProgressSink, ProgressUpdate, RunStatus};
pub use sse::{SseEvent, StreamCursor};
pub use table::{DefaultTables, NoTables, TableReader};
