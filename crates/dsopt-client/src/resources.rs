//! Request/response facades for datasets, runs, storage configs, git
//! repositories and unlearning.

use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::schema::{
    Dataset, DatasetRecord, GitRepo, GitRepoRecord, RunArgs, RunRecord, StorageConfig,
    StorageConfigRecord,
};
use crate::transport::BlockingTransport;

pub mod unlearning;

const DATASET_PATH: &str = "dataset-optimization/dataset";
const RUN_PATH: &str = "dataset-optimization/run";
const STORAGE_CONFIG_PATH: &str = "storage-config";
const GIT_REPO_PATH: &str = "git-repo";

/// Blocking client for the platform's CRUD endpoints.
#[derive(Clone)]
pub struct ApiClient {
    config: ClientConfig,
    transport: BlockingTransport,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            transport: BlockingTransport::new(client, config.transport_retry.clone()),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        let mut builder = self
            .transport
            .client()
            .request(method, self.config.url(path))
            .headers(self.config.json_headers()?)
            .timeout(timeout);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = builder
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build request: {e}")))?;
        self.transport.execute_checked(request)
    }

    fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let response = self.send(Method::GET, path, query, None, self.config.read_timeout)?;
        decode(response)
    }

    fn modify<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ClientError> {
        let response = self.send(method, path, &[], body, self.config.modify_timeout)?;
        decode(response)
    }

    fn remove(&self, method: Method, path: &str) -> Result<(), ClientError> {
        self.send(method, path, &[], None, self.config.modify_timeout)?;
        Ok(())
    }

    // Datasets

    /// Registers `dataset` and returns its id.
    ///
    /// An inline storage config is created first and linked by id.
    pub fn create_dataset(
        &self,
        dataset: &Dataset,
        organization_id: Option<i64>,
        replace_if_exists: bool,
    ) -> Result<i64, ClientError> {
        dataset.validate()?;
        let storage_config_id = match (&dataset.storage_config, dataset.storage_config_id) {
            (Some(config), _) => Some(self.create_storage_config(config, replace_if_exists)?),
            (None, id) => id,
        };
        let mut body = to_object(dataset)?;
        body.insert("storage_config_id".into(), json!(storage_config_id));
        body.insert("organization_id".into(), json!(organization_id));
        body.insert("replace_if_exists".into(), json!(replace_if_exists));
        let created: Created = self.modify(
            Method::POST,
            &format!("{DATASET_PATH}/"),
            Some(&Value::Object(body)),
        )?;
        info!(
            event = "dataset.created",
            domain = "resources",
            dataset_id = created.id,
            name = %dataset.name
        );
        Ok(created.id)
    }

    pub fn get_dataset(&self, dataset_id: i64) -> Result<DatasetRecord, ClientError> {
        self.fetch(&format!("{DATASET_PATH}/{dataset_id}"), &[])
    }

    pub fn get_dataset_by_name(&self, name: &str) -> Result<DatasetRecord, ClientError> {
        let path = format!("{DATASET_PATH}/by-name/{}", path_segment(name)?);
        self.fetch(&path, &[])
    }

    pub fn list_datasets(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<DatasetRecord>, ClientError> {
        self.fetch(&format!("{DATASET_PATH}/"), &org_query(organization_id))
    }

    pub fn delete_dataset(&self, dataset_id: i64) -> Result<(), ClientError> {
        self.remove(Method::DELETE, &format!("{DATASET_PATH}/{dataset_id}"))?;
        info!(event = "dataset.deleted", domain = "resources", dataset_id = dataset_id);
        Ok(())
    }

    // Runs

    /// Starts an optimization run on a registered dataset and returns the
    /// run id to follow with `RunMonitor`.
    pub fn launch_run(
        &self,
        dataset_id: i64,
        organization_id: Option<i64>,
        run_args: Option<&RunArgs>,
    ) -> Result<String, ClientError> {
        let mut body = Map::new();
        if let Some(org) = organization_id {
            body.insert("organization_id".into(), json!(org));
        }
        if let Some(args) = run_args {
            body.insert("run_args".into(), Value::Object(to_object(args)?));
        }
        let body = (!body.is_empty()).then_some(Value::Object(body));
        let launched: Launched =
            self.modify(Method::POST, &format!("{RUN_PATH}/{dataset_id}"), body.as_ref())?;
        info!(
            event = "run.launched",
            domain = "resources",
            dataset_id = dataset_id,
            run_id = %launched.run_id
        );
        Ok(launched.run_id)
    }

    /// Registers `dataset` and launches a run on it in one step, checking
    /// `run_args` against the dataset's labeling type first.
    pub fn optimize_dataset(
        &self,
        dataset: &Dataset,
        organization_id: Option<i64>,
        replace_if_exists: bool,
        run_args: Option<&RunArgs>,
    ) -> Result<(i64, String), ClientError> {
        if let Some(args) = run_args {
            dataset.validate_run_args(args)?;
        }
        let dataset_id = self.create_dataset(dataset, organization_id, replace_if_exists)?;
        let run_id = self.launch_run(dataset_id, organization_id, run_args)?;
        Ok((dataset_id, run_id))
    }

    pub fn list_runs(&self, organization_id: Option<i64>) -> Result<Vec<RunRecord>, ClientError> {
        self.fetch(&format!("{RUN_PATH}/list"), &org_query(organization_id))
    }

    pub fn cancel_run(&self, run_id: &str) -> Result<(), ClientError> {
        self.remove(Method::DELETE, &format!("{RUN_PATH}/{}", path_segment(run_id)?))?;
        info!(event = "run.cancelled", domain = "resources", run_id = run_id);
        Ok(())
    }

    pub fn archive_run(&self, run_id: &str) -> Result<(), ClientError> {
        self.remove(
            Method::PATCH,
            &format!("{RUN_PATH}/archive/{}", path_segment(run_id)?),
        )?;
        info!(event = "run.archived", domain = "resources", run_id = run_id);
        Ok(())
    }

    // Storage configs

    pub fn create_storage_config(
        &self,
        config: &StorageConfig,
        replace_if_exists: bool,
    ) -> Result<i64, ClientError> {
        config.validate()?;
        let mut body = to_object(config)?;
        body.insert("replace_if_exists".into(), json!(replace_if_exists));
        let created: Created = self.modify(
            Method::POST,
            &format!("{STORAGE_CONFIG_PATH}/"),
            Some(&Value::Object(body)),
        )?;
        info!(
            event = "storage_config.created",
            domain = "resources",
            storage_config_id = created.id,
            name = %config.name
        );
        Ok(created.id)
    }

    pub fn get_storage_config(&self, id: i64) -> Result<StorageConfigRecord, ClientError> {
        self.fetch(&format!("{STORAGE_CONFIG_PATH}/{id}"), &[])
    }

    pub fn list_storage_configs(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<StorageConfigRecord>, ClientError> {
        let query: Vec<(&str, String)> = organization_id
            .map(|org| ("storage_config_organization_id", org.to_string()))
            .into_iter()
            .collect();
        self.fetch(&format!("{STORAGE_CONFIG_PATH}/"), &query)
    }

    pub fn delete_storage_config(&self, id: i64) -> Result<(), ClientError> {
        self.remove(Method::DELETE, &format!("{STORAGE_CONFIG_PATH}/{id}"))
    }

    // Git repositories

    pub fn create_git_repo(&self, repo: &GitRepo) -> Result<i64, ClientError> {
        repo.validate()?;
        let body = Value::Object(to_object(repo)?);
        let created: Created =
            self.modify(Method::POST, &format!("{GIT_REPO_PATH}/"), Some(&body))?;
        info!(
            event = "git_repo.created",
            domain = "resources",
            git_repo_id = created.id,
            name = %repo.name
        );
        Ok(created.id)
    }

    pub fn list_git_repos(&self) -> Result<Vec<GitRepoRecord>, ClientError> {
        self.fetch(&format!("{GIT_REPO_PATH}/"), &[])
    }

    pub fn delete_git_repo(&self, id: i64) -> Result<(), ClientError> {
        self.remove(Method::DELETE, &format!("{GIT_REPO_PATH}/{id}"))
    }
}

#[derive(serde::Deserialize)]
struct Created {
    id: i64,
}

#[derive(serde::Deserialize)]
struct Launched {
    run_id: String,
}

fn decode<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T, ClientError> {
    let body = response
        .text()
        .map_err(|e| ClientError::Transport(format!("failed to read response body: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| ClientError::protocol_msg(format!("unexpected response payload: {e}")))
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, ClientError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ClientError::protocol_msg(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(ClientError::protocol_msg(format!("failed to encode request: {e}"))),
    }
}

fn org_query(organization_id: Option<i64>) -> Vec<(&'static str, String)> {
    organization_id
        .map(|org| ("dataset_organization_id", org.to_string()))
        .into_iter()
        .collect()
}

fn path_segment(value: &str) -> Result<&str, ClientError> {
    if value.trim().is_empty() || value.contains(['/', '\\', '?', '#']) {
        return Err(ClientError::Validation(format!(
            "{value:?} is not a valid path segment"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::run::RunStatus;
    use crate::schema::{LabelingInfo, LabelingType, Modality, StorageS3};

    fn client(server: &mockito::ServerGuard) -> ApiClient {
        ApiClient::new(
            ClientConfig::new("key")
                .api_host(server.url())
                .transport_retry(RetryPolicy::none()),
        )
        .unwrap()
    }

    fn dataset() -> Dataset {
        Dataset {
            name: "cifar".into(),
            labeling_type: LabelingType::SingleLabelClassification,
            language: None,
            storage_config_id: None,
            storage_config: Some(StorageConfig::s3(
                "bucket",
                StorageS3 {
                    endpoint_url: None,
                    bucket_url: "s3://my-bucket".into(),
                    region_name: "us-east-1".into(),
                    access_key_id: None,
                    secret_access_key: None,
                },
            )),
            data_root_url: "s3://my-bucket/data".into(),
            classes: None,
            labeling_info: LabelingInfo::HirundoCsv {
                csv_url: "s3://my-bucket/meta.csv".into(),
            },
            augmentations: None,
            modality: Modality::Image,
        }
    }

    #[test]
    fn create_dataset_creates_inline_storage_first() {
        let mut server = mockito::Server::new();
        let storage = server
            .mock("POST", "/storage-config/")
            .match_body(Matcher::PartialJson(json!({
                "name": "bucket",
                "type": "S3",
                "replace_if_exists": false
            })))
            .with_status(200)
            .with_body(r#"{"id": 7}"#)
            .create();
        let dataset_mock = server
            .mock("POST", "/dataset-optimization/dataset/")
            .match_header("authorization", "Bearer key")
            .match_body(Matcher::PartialJson(json!({
                "name": "cifar",
                "storage_config_id": 7,
                "organization_id": 3,
                "labeling_info": {"type": "HirundoCSV"}
            })))
            .with_status(200)
            .with_body(r#"{"id": 42}"#)
            .create();

        let id = client(&server).create_dataset(&dataset(), Some(3), false).unwrap();
        assert_eq!(id, 42);
        storage.assert();
        dataset_mock.assert();
    }

    #[test]
    fn invalid_dataset_is_rejected_before_any_request() {
        let server = mockito::Server::new();
        let mut bad = dataset();
        bad.storage_config_id = Some(1);
        let err = client(&server).create_dataset(&bad, None, false).unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[test]
    fn launch_run_returns_run_id() {
        let mut server = mockito::Server::new();
        let launch = server
            .mock("POST", "/dataset-optimization/run/42")
            .match_body(Matcher::PartialJson(json!({
                "run_args": {"upsample": true}
            })))
            .with_status(200)
            .with_body(r#"{"run_id": "run-1"}"#)
            .create();
        let args = RunArgs {
            upsample: true,
            ..RunArgs::default()
        };
        let run_id = client(&server).launch_run(42, None, Some(&args)).unwrap();
        assert_eq!(run_id, "run-1");
        launch.assert();
    }

    #[test]
    fn list_runs_passes_organization_filter() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dataset-optimization/run/list")
            .match_query(Matcher::UrlEncoded(
                "dataset_organization_id".into(),
                "9".into(),
            ))
            .with_status(200)
            .with_body(
                r#"[{"id":1,"name":"cifar","run_id":"r1","status":"SUCCESS","approved":true,"created_at":"2024-05-01T10:00:00Z"}]"#,
            )
            .create();
        let runs = client(&server).list_runs(Some(9)).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[test]
    fn cancel_and_archive_use_their_endpoints() {
        let mut server = mockito::Server::new();
        let cancel = server
            .mock("DELETE", "/dataset-optimization/run/r1")
            .with_status(200)
            .with_body("{}")
            .create();
        let archive = server
            .mock("PATCH", "/dataset-optimization/run/archive/r1")
            .with_status(200)
            .with_body("{}")
            .create();
        let api = client(&server);
        api.cancel_run("r1").unwrap();
        api.archive_run("r1").unwrap();
        cancel.assert();
        archive.assert();
        assert!(matches!(api.cancel_run("a/b"), Err(ClientError::Validation(_))));
    }

    #[test]
    fn http_errors_carry_server_detail() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dataset-optimization/dataset/5")
            .with_status(404)
            .with_body(r#"{"detail":"Dataset not found"}"#)
            .create();
        let err = client(&server).get_dataset(5).unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("Dataset not found"));
    }

    #[test]
    fn optimize_dataset_checks_run_args_first() {
        let server = mockito::Server::new();
        let limits = RunArgs {
            min_rel_bbox_area: 0.1,
            ..RunArgs::default()
        };
        let err = client(&server)
            .optimize_dataset(&dataset(), None, false, Some(&limits))
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[test]
    fn git_repos_are_listed() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/git-repo/")
            .with_status(200)
            .with_body(r#"[{"id":2,"name":"labels","repository_url":"https://github.com/o/r.git"}]"#)
            .create();
        let repos = client(&server).list_git_repos().unwrap();
        assert_eq!(repos[0].name, "labels");
        assert_eq!(repos[0].organization_id, None);
    }
}
