//! Result archive download and extraction.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use reqwest::header::HeaderMap;
use tracing::{debug, error, info};
use zip::ZipArchive;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::table::TableReader;
use crate::transport::BlockingTransport;

/// Download buffer size; the archive is written in chunks of this size.
pub const ZIP_CHUNK_SIZE: usize = 50 * 1024 * 1024;
/// Suspects member names, newest convention first.
pub const SUSPECTS_MEMBERS: [&str; 3] = [
    "mislabel_suspects.csv",
    "image_mislabel_suspects.csv",
    "suspects.csv",
];
pub const OBJECT_SUSPECTS_MEMBER: &str = "object_mislabel_suspects.csv";
pub const WARNINGS_MEMBER: &str = "warnings_and_errors.csv";

const LOCAL_DOWNLOAD_PATH: &str = "dataset-optimization/run/local-download";

/// Results of a completed run.
///
/// Each table is `None` when its member was absent, failed to parse, or
/// tables are not supported by the configured [`TableReader`].
#[derive(Debug, Clone)]
pub struct DatasetOptimizationResults<T> {
    pub cached_archive_path: PathBuf,
    pub suspects: Option<T>,
    pub object_suspects: Option<T>,
    pub warnings_and_errors: Option<T>,
}

/// Downloads result archives into the cache directory and parses their
/// members with a [`TableReader`].
pub struct Materializer<R> {
    config: ClientConfig,
    tables: R,
    transport: OnceCell<BlockingTransport>,
}

impl<R: TableReader> Materializer<R> {
    pub fn new(config: ClientConfig, tables: R) -> Self {
        Self {
            config,
            tables,
            transport: OnceCell::new(),
        }
    }

    pub fn tables(&self) -> &R {
        &self.tables
    }

    fn transport(&self) -> Result<&BlockingTransport, ClientError> {
        self.transport.get_or_try_init(|| {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.config.connect_timeout)
                .timeout(self.config.download_timeout)
                .build()
                .map_err(|e| ClientError::Config(format!("failed to build download client: {e}")))?;
            Ok(BlockingTransport::new(client, self.config.transport_retry.clone()))
        })
    }

    /// Maps a result URL to the URL actually fetched. Server-local `file://`
    /// URLs go through the authenticated download endpoint.
    pub fn resolve_download(&self, url: &str) -> Result<(String, Option<HeaderMap>), ClientError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ClientError::protocol_msg(format!("invalid result URL {url}: {e}")))?;
        if parsed.scheme() != "file" {
            return Ok((url.to_string(), None));
        }
        let local_path = url.strip_prefix("file://").unwrap_or(parsed.path());
        let rewritten = format!(
            "{}{}",
            self.config.url(LOCAL_DOWNLOAD_PATH),
            local_path
        );
        Ok((rewritten, Some(self.config.auth_headers()?)))
    }

    /// Streams the archive for `run_id` to `{cache_dir}/{run_id}.zip`,
    /// replacing any earlier download for the same run.
    ///
    /// The body is written to a temporary file in the cache directory and
    /// renamed into place once complete, so a failed download leaves the
    /// previous archive intact.
    pub fn download(&self, run_id: &str, url: &str) -> Result<PathBuf, ClientError> {
        validate_run_id(run_id)?;
        let (url, headers) = self.resolve_download(url)?;
        let cache_dir = self.config.resolved_cache_dir()?;
        std::fs::create_dir_all(&cache_dir)?;
        let path = cache_dir.join(format!("{run_id}.zip"));

        let transport = self.transport()?;
        let mut request = transport.client().get(&url);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        let request = request
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build download request: {e}")))?;
        let mut response = transport.execute_checked(request)?;

        let partial = tempfile::Builder::new()
            .prefix(&format!(".{run_id}."))
            .suffix(".part")
            .tempfile_in(&cache_dir)?;
        let mut writer = BufWriter::with_capacity(ZIP_CHUNK_SIZE, partial);
        let bytes = std::io::copy(&mut response, &mut writer)?;
        let partial = writer.into_inner().map_err(|e| ClientError::Io(e.error().to_string()))?;
        partial.as_file().sync_all()?;
        partial
            .persist(&path)
            .map_err(|e| ClientError::Io(e.error.to_string()))?;
        info!(
            event = "archive.downloaded",
            domain = "archive",
            run_id = run_id,
            bytes = bytes,
            path = %path.display()
        );
        Ok(path)
    }

    /// Downloads and extracts the results of `run_id`.
    pub fn materialize(
        &self,
        run_id: &str,
        url: &str,
    ) -> Result<DatasetOptimizationResults<R::Table>, ClientError> {
        let path = self.download(run_id, url)?;
        extract_archive(&self.tables, run_id, &path)
    }
}

/// Reads the well-known members of a downloaded archive.
///
/// Fails only when the archive cannot be opened or has no suspects member;
/// a member that fails to parse is logged and left as `None`.
/// Rejects run ids that are empty or could escape the cache directory.
pub(crate) fn validate_run_id(run_id: &str) -> Result<(), ClientError> {
    if run_id.trim().is_empty() {
        return Err(ClientError::Validation("run id must not be empty".into()));
    }
    if run_id.contains(['/', '\\']) || run_id.contains("..") {
        return Err(ClientError::Validation(format!("invalid run id {run_id:?}")));
    }
    Ok(())
}

pub fn extract_archive<R: TableReader>(
    tables: &R,
    run_id: &str,
    path: &Path,
) -> Result<DatasetOptimizationResults<R::Table>, ClientError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let suspects_member = SUSPECTS_MEMBERS
        .iter()
        .find(|candidate| names.iter().any(|name| name == *candidate))
        .ok_or_else(|| {
            ClientError::Archive(format!(
                "none of {} found in {}",
                SUSPECTS_MEMBERS.join(", "),
                path.display()
            ))
        })?;

    let suspects = load_member(tables, &mut archive, run_id, suspects_member);
    let object_suspects = if names.iter().any(|name| name == OBJECT_SUSPECTS_MEMBER) {
        load_member(tables, &mut archive, run_id, OBJECT_SUSPECTS_MEMBER)
    } else {
        None
    };
    let warnings_and_errors = load_member(tables, &mut archive, run_id, WARNINGS_MEMBER);

    Ok(DatasetOptimizationResults {
        cached_archive_path: path.to_path_buf(),
        suspects,
        object_suspects,
        warnings_and_errors,
    })
}

fn load_member<R: TableReader>(
    tables: &R,
    archive: &mut ZipArchive<File>,
    run_id: &str,
    member: &str,
) -> Option<R::Table> {
    let loaded = read_member(archive, member).and_then(|bytes| tables.read_table(member, &bytes));
    match loaded {
        Ok(table) => {
            debug!(
                event = "archive.member_loaded",
                domain = "archive",
                run_id = run_id,
                member = member,
                table = table.is_some()
            );
            table
        }
        Err(err) => {
            error!(
                event = "archive.member_failed",
                domain = "archive",
                run_id = run_id,
                member = member,
                error = %err
            );
            None
        }
    }
}

fn read_member<Z: Read + std::io::Seek>(
    archive: &mut ZipArchive<Z>,
    member: &str,
) -> Result<Vec<u8>, ClientError> {
    let mut file = archive.by_name(member)?;
    let mut bytes = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Loads one named member of a cached archive as a table.
pub fn load_from_zip<R: TableReader>(
    tables: &R,
    path: &Path,
    member: &str,
) -> Result<Option<R::Table>, ClientError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let bytes = read_member(&mut archive, member)?;
    tables.read_table(member, &bytes)
}
