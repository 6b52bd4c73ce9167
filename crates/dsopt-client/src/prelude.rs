//! Common imports for typical client usage.
pub use crate::{
    ApiClient, ClientConfig, ClientError, DatasetOptimizationResults, LogProgress,
    ProgressEvent, ProgressSink, ProgressUpdate, RetryPolicy, RunMonitor, RunStatus,
};
pub use crate::schema::{Dataset, LabelingInfo, LabelingType, RunArgs, StorageConfig};
