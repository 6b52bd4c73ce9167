//! Machine unlearning: registered models and the runs that unlearn them.
//!
//! Two families share one run lifecycle. Vision models live under
//! `/unlearning`, LLM behavior models under `/unlearning-llm-behavior`.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::{ApiClient, Created, Launched, path_segment, to_object};
use crate::errors::ClientError;
use crate::sse::SseEvent;

/// Which unlearning API a run or model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlearningKind {
    Vision,
    LlmBehavior,
}

impl UnlearningKind {
    fn root(self) -> &'static str {
        match self {
            UnlearningKind::Vision => "unlearning",
            UnlearningKind::LlmBehavior => "unlearning-llm-behavior",
        }
    }

    fn model_path(self) -> String {
        match self {
            UnlearningKind::Vision => "unlearning/ml-model".to_string(),
            UnlearningKind::LlmBehavior => "unlearning-llm-behavior/llm".to_string(),
        }
    }

    /// Path of the run resource, also the run's event stream.
    pub fn run_path(self, run_id: &str) -> String {
        format!("{}/run/{run_id}", self.root())
    }
}

const fn default_true() -> bool {
    true
}

/// Where a vision model's weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisionModelSource {
    PytorchRawPth { code_url: String, raw_pth_url: String },
    Torchvision {
        model_name: String,
        safetensors_weights_url: String,
    },
}

/// A vision model to register for unlearning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionModel {
    pub storage_config_id: i64,
    pub class_mapping_url: String,
    pub data_root_url: String,
    pub model_name: String,
    pub model_source: VisionModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    /// Archive the model's earlier runs when it is replaced or updated.
    #[serde(default = "default_true")]
    pub archive_existing_runs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionModelRecord {
    pub id: i64,
    pub storage_config_id: i64,
    pub class_mapping_url: String,
    pub data_root_url: String,
    pub organization_id: i64,
    pub creator_id: i64,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model_name: String,
    pub model_source: VisionModelSource,
}

/// Where an LLM's weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmSource {
    HuggingfaceTransformers {
        model_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    LocalTransformers { local_path: String },
}

/// An LLM to register for behavior unlearning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmModel {
    pub model_name: String,
    pub model_source: LlmSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default = "default_true")]
    pub archive_existing_runs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmModelRecord {
    pub id: i64,
    pub organization_id: i64,
    pub creator_id: i64,
    pub creator_name: String,
    pub created_at: String,
    pub updated_at: String,
    pub model_name: String,
    pub model_source: LlmSource,
}

fn model_query(organization_id: Option<i64>) -> Vec<(&'static str, String)> {
    organization_id
        .map(|org| ("model_organization_id", org.to_string()))
        .into_iter()
        .collect()
}

/// Turns one event of a run's result stream into its `data` payload.
///
/// Keep-alive pings yield `None`.
pub(crate) fn result_payload(event: SseEvent) -> Option<Result<Value, ClientError>> {
    if event.event == "ping" {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(&event.data)
        .map_err(|e| ClientError::protocol_msg(format!("unparseable result event: {e}")))
        .and_then(|mut body| match body.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(ClientError::protocol_msg("result event without data")),
        });
    Some(parsed)
}

impl ApiClient {
    fn create_model<T: Serialize>(
        &self,
        kind: UnlearningKind,
        model: &T,
        model_name: &str,
        replace_if_exists: bool,
    ) -> Result<i64, ClientError> {
        let mut body = to_object(model)?;
        body.insert("replace_if_exists".into(), json!(replace_if_exists));
        let created: Created = self.modify(
            Method::POST,
            &format!("{}/", kind.model_path()),
            Some(&Value::Object(body)),
        )?;
        info!(
            event = "unlearning.model_created",
            domain = "resources",
            kind = ?kind,
            model_id = created.id,
            name = %model_name
        );
        Ok(created.id)
    }

    fn update_model<T: Serialize>(
        &self,
        kind: UnlearningKind,
        model_id: i64,
        model: &T,
    ) -> Result<(), ClientError> {
        let body = Value::Object(to_object(model)?);
        self.send(
            Method::PUT,
            &format!("{}/{model_id}", kind.model_path()),
            &[],
            Some(&body),
            self.config.modify_timeout,
        )?;
        Ok(())
    }

    // Vision models

    pub fn create_vision_model(
        &self,
        model: &VisionModel,
        replace_if_exists: bool,
    ) -> Result<i64, ClientError> {
        self.create_model(UnlearningKind::Vision, model, &model.model_name, replace_if_exists)
    }

    pub fn get_vision_model(&self, model_id: i64) -> Result<VisionModelRecord, ClientError> {
        self.fetch(&format!("{}/{model_id}", UnlearningKind::Vision.model_path()), &[])
    }

    pub fn get_vision_model_by_name(
        &self,
        model_name: &str,
        organization_id: Option<i64>,
    ) -> Result<VisionModelRecord, ClientError> {
        let path = format!(
            "{}/by-name/{}",
            UnlearningKind::Vision.model_path(),
            path_segment(model_name)?
        );
        self.fetch(&path, &model_query(organization_id))
    }

    pub fn list_vision_models(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<VisionModelRecord>, ClientError> {
        self.fetch(
            &format!("{}/", UnlearningKind::Vision.model_path()),
            &model_query(organization_id),
        )
    }

    pub fn update_vision_model(&self, model_id: i64, model: &VisionModel) -> Result<(), ClientError> {
        self.update_model(UnlearningKind::Vision, model_id, model)
    }

    pub fn delete_vision_model(&self, model_id: i64) -> Result<(), ClientError> {
        self.remove(
            Method::DELETE,
            &format!("{}/{model_id}", UnlearningKind::Vision.model_path()),
        )
    }

    // LLMs

    pub fn create_llm(&self, model: &LlmModel, replace_if_exists: bool) -> Result<i64, ClientError> {
        self.create_model(UnlearningKind::LlmBehavior, model, &model.model_name, replace_if_exists)
    }

    pub fn get_llm(&self, model_id: i64) -> Result<LlmModelRecord, ClientError> {
        self.fetch(&format!("{}/{model_id}", UnlearningKind::LlmBehavior.model_path()), &[])
    }

    pub fn get_llm_by_name(
        &self,
        model_name: &str,
        organization_id: Option<i64>,
    ) -> Result<LlmModelRecord, ClientError> {
        let path = format!(
            "{}/by-name/{}",
            UnlearningKind::LlmBehavior.model_path(),
            path_segment(model_name)?
        );
        self.fetch(&path, &model_query(organization_id))
    }

    pub fn list_llms(&self, organization_id: Option<i64>) -> Result<Vec<LlmModelRecord>, ClientError> {
        self.fetch(
            &format!("{}/", UnlearningKind::LlmBehavior.model_path()),
            &model_query(organization_id),
        )
    }

    pub fn update_llm(&self, model_id: i64, model: &LlmModel) -> Result<(), ClientError> {
        self.update_model(UnlearningKind::LlmBehavior, model_id, model)
    }

    pub fn delete_llm(&self, model_id: i64) -> Result<(), ClientError> {
        self.remove(
            Method::DELETE,
            &format!("{}/{model_id}", UnlearningKind::LlmBehavior.model_path()),
        )
    }

    // Unlearning runs

    /// Starts an unlearning run on `model_id`. `run_info` is passed to the
    /// server as the request body.
    pub fn launch_unlearning_run(
        &self,
        kind: UnlearningKind,
        model_id: i64,
        run_info: &Value,
    ) -> Result<String, ClientError> {
        let launched: Launched = self.modify(
            Method::POST,
            &format!("{}/run/{model_id}", kind.root()),
            Some(run_info),
        )?;
        info!(
            event = "unlearning.run_launched",
            domain = "resources",
            kind = ?kind,
            model_id = model_id,
            run_id = %launched.run_id
        );
        Ok(launched.run_id)
    }

    fn run_action(
        &self,
        kind: UnlearningKind,
        method: Method,
        path: String,
        action: &'static str,
        run_id: &str,
    ) -> Result<(), ClientError> {
        self.remove(method, &path)?;
        info!(
            event = "unlearning.run_updated",
            domain = "resources",
            kind = ?kind,
            action = action,
            run_id = run_id
        );
        Ok(())
    }

    pub fn cancel_unlearning_run(&self, kind: UnlearningKind, run_id: &str) -> Result<(), ClientError> {
        let path = format!("{}/run/cancel/{}", kind.root(), path_segment(run_id)?);
        self.run_action(kind, Method::PATCH, path, "cancel", run_id)
    }

    pub fn archive_unlearning_run(&self, kind: UnlearningKind, run_id: &str) -> Result<(), ClientError> {
        let path = format!("{}/run/archive/{}", kind.root(), path_segment(run_id)?);
        self.run_action(kind, Method::PATCH, path, "archive", run_id)
    }

    pub fn restore_unlearning_run(&self, kind: UnlearningKind, run_id: &str) -> Result<(), ClientError> {
        let path = format!("{}/run/restore/{}", kind.root(), path_segment(run_id)?);
        self.run_action(kind, Method::PATCH, path, "restore", run_id)
    }

    /// Approves a run waiting in `AWAITING MANUAL APPROVAL` so it resumes.
    pub fn approve_unlearning_run(&self, kind: UnlearningKind, run_id: &str) -> Result<(), ClientError> {
        let path = format!("{}/run/{}/approve", kind.root(), path_segment(run_id)?);
        self.run_action(kind, Method::POST, path, "approve", run_id)
    }

    /// Lists unlearning runs as the server reports them.
    pub fn list_unlearning_runs(
        &self,
        kind: UnlearningKind,
        organization_id: Option<i64>,
        archived: bool,
    ) -> Result<Vec<Value>, ClientError> {
        let mut query: Vec<(&str, String)> = organization_id
            .map(|org| ("unlearning_organization_id", org.to_string()))
            .into_iter()
            .collect();
        query.push(("archived", archived.to_string()));
        self.fetch(&format!("{}/run/list", kind.root()), &query)
    }
}
