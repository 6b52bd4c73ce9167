//! Request and response types of the dataset optimization API, with the
//! checks the client applies before submitting them.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;
use crate::run::RunStatus;

/// Schemes accepted for dataset, metadata and label locations.
pub const DATASET_URL_SCHEMES: &[&str] = &["file", "https", "http", "s3", "gs", "ssh"];
/// Schemes accepted for git repository URLs.
pub const REPO_URL_SCHEMES: &[&str] = &["ssh", "https", "http"];

static S3_BUCKET_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^s3://[a-z0-9.\-]{3,64}(/.*)?$").expect("bucket URL pattern"));
static STORAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").expect("storage name pattern"));

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::Validation(message.into())
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<(), ClientError> {
    let parsed = url::Url::parse(value).map_err(|e| invalid(format!("{field}: invalid URL {value:?}: {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(invalid(format!(
            "{field}: scheme {:?} is not one of {}",
            parsed.scheme(),
            schemes.join(", ")
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelingType {
    #[serde(rename = "SingleLabelClassification")]
    SingleLabelClassification,
    #[serde(rename = "ObjectDetection")]
    ObjectDetection,
    #[serde(rename = "SpeechToText")]
    SpeechToText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetMetadataType {
    #[serde(rename = "HirundoCSV")]
    HirundoCsv,
    #[serde(rename = "COCO")]
    Coco,
    #[serde(rename = "YOLO")]
    Yolo,
    KeylabsObjDetImages,
    KeylabsObjDetVideo,
    KeylabsObjSegImages,
    KeylabsObjSegVideo,
}

/// Login used to link each sample back to its Keylabs project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylabsAuth {
    pub username: String,
    pub password: String,
    pub instance: String,
}

/// Labels exported from a Keylabs project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylabsLabels {
    pub project_id: String,
    pub labels_dir_url: String,
    /// Fold label attributes into the class name.
    #[serde(default = "default_true")]
    pub with_attributes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keylabs_auth: Option<KeylabsAuth>,
}

impl KeylabsLabels {
    pub fn new(project_id: impl Into<String>, labels_dir_url: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            labels_dir_url: labels_dir_url.into(),
            with_attributes: true,
            project_name: None,
            keylabs_auth: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Where and in which format a dataset's labels live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LabelingInfo {
    #[serde(rename = "HirundoCSV")]
    HirundoCsv { csv_url: String },
    #[serde(rename = "COCO")]
    Coco { json_url: String },
    #[serde(rename = "YOLO")]
    Yolo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_yaml_url: Option<String>,
        labels_dir_url: String,
    },
    KeylabsObjDetImages(KeylabsLabels),
    KeylabsObjDetVideo(KeylabsLabels),
    KeylabsObjSegImages(KeylabsLabels),
    KeylabsObjSegVideo(KeylabsLabels),
}

impl LabelingInfo {
    pub fn metadata_type(&self) -> DatasetMetadataType {
        match self {
            LabelingInfo::HirundoCsv { .. } => DatasetMetadataType::HirundoCsv,
            LabelingInfo::Coco { .. } => DatasetMetadataType::Coco,
            LabelingInfo::Yolo { .. } => DatasetMetadataType::Yolo,
            LabelingInfo::KeylabsObjDetImages(_) => DatasetMetadataType::KeylabsObjDetImages,
            LabelingInfo::KeylabsObjDetVideo(_) => DatasetMetadataType::KeylabsObjDetVideo,
            LabelingInfo::KeylabsObjSegImages(_) => DatasetMetadataType::KeylabsObjSegImages,
            LabelingInfo::KeylabsObjSegVideo(_) => DatasetMetadataType::KeylabsObjSegVideo,
        }
    }

    /// The main metadata location for this format.
    pub fn metadata_url(&self) -> &str {
        match self {
            LabelingInfo::HirundoCsv { csv_url } => csv_url,
            LabelingInfo::Coco { json_url } => json_url,
            LabelingInfo::Yolo { labels_dir_url, .. } => labels_dir_url,
            LabelingInfo::KeylabsObjDetImages(labels)
            | LabelingInfo::KeylabsObjDetVideo(labels)
            | LabelingInfo::KeylabsObjSegImages(labels)
            | LabelingInfo::KeylabsObjSegVideo(labels) => &labels.labels_dir_url,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        check_url("labeling_info", self.metadata_url(), DATASET_URL_SCHEMES)?;
        if let LabelingInfo::Yolo {
            data_yaml_url: Some(url),
            ..
        } = self
        {
            check_url("labeling_info.data_yaml_url", url, DATASET_URL_SCHEMES)?;
        }
        if let Some(labels) = self.keylabs()
            && labels.project_id.trim().is_empty()
        {
            return Err(invalid("labeling_info.project_id must not be empty"));
        }
        Ok(())
    }

    /// The Keylabs export settings, for Keylabs formats.
    pub fn keylabs(&self) -> Option<&KeylabsLabels> {
        match self {
            LabelingInfo::KeylabsObjDetImages(labels)
            | LabelingInfo::KeylabsObjDetVideo(labels)
            | LabelingInfo::KeylabsObjSegImages(labels)
            | LabelingInfo::KeylabsObjSegVideo(labels) => Some(labels),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    S3,
    #[serde(rename = "GCP")]
    Gcp,
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageS3 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub bucket_url: String,
    pub region_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageGcp {
    pub bucket_name: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_json: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageGit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<GitRepo>,
    pub branch: String,
}

/// Credentials and location of the storage holding a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<StorageS3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<StorageGcp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<StorageGit>,
}

impl StorageConfig {
    pub fn s3(name: impl Into<String>, s3: StorageS3) -> Self {
        Self {
            name: name.into(),
            storage_type: StorageType::S3,
            organization_id: None,
            s3: Some(s3),
            gcp: None,
            git: None,
        }
    }

    pub fn gcp(name: impl Into<String>, gcp: StorageGcp) -> Self {
        Self {
            name: name.into(),
            storage_type: StorageType::Gcp,
            organization_id: None,
            s3: None,
            gcp: Some(gcp),
            git: None,
        }
    }

    pub fn git(name: impl Into<String>, git: StorageGit) -> Self {
        Self {
            name: name.into(),
            storage_type: StorageType::Git,
            organization_id: None,
            s3: None,
            gcp: None,
            git: Some(git),
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.name.is_empty() || self.name.len() > 255 || !STORAGE_NAME.is_match(&self.name) {
            return Err(invalid(format!(
                "storage config name {:?} must be 1-255 letters, digits, '-' or '_'",
                self.name
            )));
        }
        let sections = [self.s3.is_some(), self.gcp.is_some(), self.git.is_some()];
        if sections.iter().filter(|present| **present).count() != 1 {
            return Err(invalid("storage config must set exactly one of s3, gcp or git"));
        }
        match (self.storage_type, &self.s3, &self.gcp, &self.git) {
            (StorageType::S3, Some(s3), _, _) => {
                let len = s3.bucket_url.len();
                if !(8..=1023).contains(&len) || !S3_BUCKET_URL.is_match(&s3.bucket_url) {
                    return Err(invalid(format!("invalid S3 bucket URL {:?}", s3.bucket_url)));
                }
                Ok(())
            }
            (StorageType::Gcp, _, Some(_), _) => Ok(()),
            (StorageType::Git, _, _, Some(git)) => match (&git.repo_id, &git.repo) {
                (Some(_), None) => Ok(()),
                (None, Some(repo)) => repo.validate(),
                _ => Err(invalid("git storage must set exactly one of repo_id or repo")),
            },
            (kind, ..) => Err(invalid(format!(
                "storage type {kind:?} does not match the populated section"
            ))),
        }
    }
}

/// A storage config as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfigRecord {
    pub id: i64,
    #[serde(flatten)]
    pub config: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPlainAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSshAuth {
    pub ssh_key: String,
    #[serde(default)]
    pub ssh_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepo {
    pub name: String,
    pub repository_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub plain_auth: Option<GitPlainAuth>,
    #[serde(default)]
    pub ssh_auth: Option<GitSshAuth>,
}

impl GitRepo {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.name.trim().is_empty() {
            return Err(invalid("git repo name must not be empty"));
        }
        check_url("repository_url", &self.repository_url, REPO_URL_SCHEMES)?;
        if self.plain_auth.is_some() && self.ssh_auth.is_some() {
            return Err(invalid("git repo accepts plain_auth or ssh_auth, not both"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepoRecord {
    pub id: i64,
    pub name: String,
    pub repository_url: String,
    #[serde(default)]
    pub organization_id: Option<i64>,
}

/// Optional knobs for a vision optimization run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    #[serde(default)]
    pub upsample: bool,
    #[serde(default)]
    pub min_abs_bbox_size: u32,
    #[serde(default)]
    pub min_abs_bbox_area: u32,
    #[serde(default)]
    pub min_rel_bbox_size: f64,
    #[serde(default)]
    pub min_rel_bbox_area: f64,
}

impl RunArgs {
    pub fn has_bbox_limits(&self) -> bool {
        self.min_abs_bbox_size != 0
            || self.min_abs_bbox_area != 0
            || self.min_rel_bbox_size != 0.0
            || self.min_rel_bbox_area != 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Augmentation {
    RandomHorizontalFlip,
    RandomVerticalFlip,
    RandomRotation,
    ColorJitter,
    RandomAffine,
    RandomPerspective,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modality {
    #[default]
    Image,
    Radar,
    #[serde(rename = "EKG")]
    Ekg,
}

/// A dataset to register for optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub labeling_type: LabelingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub storage_config_id: Option<i64>,
    /// Storage config created together with the dataset. Never sent as part
    /// of the dataset body.
    #[serde(default, skip_serializing)]
    pub storage_config: Option<StorageConfig>,
    pub data_root_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
    pub labeling_info: LabelingInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmentations: Option<Vec<Augmentation>>,
    #[serde(default)]
    pub modality: Modality,
}

impl Dataset {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.name.trim().is_empty() {
            return Err(invalid("dataset name must not be empty"));
        }
        match (&self.storage_config, self.storage_config_id) {
            (None, None) => {
                return Err(invalid(
                    "no dataset storage provided; set storage_config or storage_config_id",
                ));
            }
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "both storage_config and storage_config_id are set; pick one",
                ));
            }
            (Some(config), None) => config.validate()?,
            (None, Some(_)) => {}
        }
        let speech = self.labeling_type == LabelingType::SpeechToText;
        match (speech, self.language.is_some()) {
            (true, false) => return Err(invalid("language is required for speech-to-text datasets")),
            (false, true) => {
                return Err(invalid("language is only allowed for speech-to-text datasets"));
            }
            _ => {}
        }
        if let LabelingInfo::Yolo {
            data_yaml_url: Some(_),
            ..
        } = &self.labeling_info
            && self.classes.is_some()
        {
            return Err(invalid(
                "YOLO datasets take either classes or labeling_info.data_yaml_url, not both",
            ));
        }
        check_url("data_root_url", &self.data_root_url, DATASET_URL_SCHEMES)?;
        self.labeling_info.validate()
    }

    /// Checks `run_args` against this dataset's labeling type.
    pub fn validate_run_args(&self, run_args: &RunArgs) -> Result<(), ClientError> {
        match self.labeling_type {
            LabelingType::SpeechToText => Err(invalid("speech-to-text runs cannot set run_args")),
            LabelingType::ObjectDetection => Ok(()),
            other if run_args.has_bbox_limits() => Err(invalid(format!(
                "bounding box limits cannot be set for labeling type {other:?}"
            ))),
            _ => Ok(()),
        }
    }
}

/// A dataset as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: i64,
    pub name: String,
    pub labeling_type: LabelingType,
    #[serde(default)]
    pub storage_config: Option<StorageConfigRecord>,
    pub data_root_url: String,
    #[serde(default)]
    pub classes: Option<Vec<String>>,
    pub labeling_info: LabelingInfo,
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub creator_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One optimization run as listed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub name: String,
    pub run_id: String,
    pub status: RunStatus,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn s3_storage() -> StorageConfig {
        StorageConfig::s3(
            "my-bucket_1",
            StorageS3 {
                endpoint_url: None,
                bucket_url: "s3://my-bucket".into(),
                region_name: "us-west-2".into(),
                access_key_id: None,
                secret_access_key: None,
            },
        )
    }

    fn dataset() -> Dataset {
        Dataset {
            name: "cifar".into(),
            labeling_type: LabelingType::SingleLabelClassification,
            language: None,
            storage_config_id: Some(3),
            storage_config: None,
            data_root_url: "s3://my-bucket/images".into(),
            classes: Some(vec!["cat".into(), "dog".into()]),
            labeling_info: LabelingInfo::HirundoCsv {
                csv_url: "s3://my-bucket/meta.csv".into(),
            },
            augmentations: None,
            modality: Modality::Image,
        }
    }

    #[test]
    fn labeling_info_is_tagged_by_type() {
        let info = LabelingInfo::Yolo {
            data_yaml_url: None,
            labels_dir_url: "gs://b/labels".into(),
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"type": "YOLO", "labels_dir_url": "gs://b/labels"})
        );
        let parsed: LabelingInfo =
            serde_json::from_value(json!({"type": "HirundoCSV", "csv_url": "file:///d/m.csv"}))
                .unwrap();
        assert_eq!(parsed.metadata_type(), DatasetMetadataType::HirundoCsv);
    }

    #[test]
    fn keylabs_labeling_info_flattens_project_fields() {
        let mut labels = KeylabsLabels::new("proj-9", "s3://my-bucket/keylabs");
        labels.keylabs_auth = Some(KeylabsAuth {
            username: "ann".into(),
            password: "pw".into(),
            instance: "acme".into(),
        });
        let info = LabelingInfo::KeylabsObjSegVideo(labels);
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({
                "type": "KeylabsObjSegVideo",
                "project_id": "proj-9",
                "labels_dir_url": "s3://my-bucket/keylabs",
                "with_attributes": true,
                "keylabs_auth": {"username": "ann", "password": "pw", "instance": "acme"}
            })
        );
        assert_eq!(info.metadata_url(), "s3://my-bucket/keylabs");
        assert!(info.validate().is_ok());

        let parsed: LabelingInfo = serde_json::from_value(json!({
            "type": "KeylabsObjDetImages",
            "project_id": "p1",
            "labels_dir_url": "gs://b/labels"
        }))
        .unwrap();
        assert_eq!(parsed.metadata_type(), DatasetMetadataType::KeylabsObjDetImages);
        assert!(parsed.keylabs().is_some_and(|l| l.with_attributes && l.project_name.is_none()));

        let blank = LabelingInfo::KeylabsObjDetVideo(KeylabsLabels::new(" ", "gs://b/labels"));
        assert!(blank.validate().is_err());
    }

    #[test]
    fn dataset_requires_exactly_one_storage_source() {
        assert!(dataset().validate().is_ok());

        let mut both = dataset();
        both.storage_config = Some(s3_storage());
        assert!(both.validate().is_err());

        let mut neither = dataset();
        neither.storage_config_id = None;
        assert!(neither.validate().is_err());
    }

    #[test]
    fn language_only_for_speech_to_text() {
        let mut speech = dataset();
        speech.labeling_type = LabelingType::SpeechToText;
        assert!(speech.validate().is_err());
        speech.language = Some("en".into());
        assert!(speech.validate().is_ok());

        let mut vision = dataset();
        vision.language = Some("en".into());
        assert!(vision.validate().is_err());
    }

    #[test]
    fn yolo_rejects_classes_with_data_yaml() {
        let mut yolo = dataset();
        yolo.labeling_type = LabelingType::ObjectDetection;
        yolo.labeling_info = LabelingInfo::Yolo {
            data_yaml_url: Some("s3://my-bucket/data.yaml".into()),
            labels_dir_url: "s3://my-bucket/labels".into(),
        };
        assert!(yolo.validate().is_err());
        yolo.classes = None;
        assert!(yolo.validate().is_ok());
    }

    #[test]
    fn url_schemes_are_restricted() {
        let mut bad = dataset();
        bad.data_root_url = "ftp://host/images".into();
        assert!(matches!(bad.validate(), Err(ClientError::Validation(msg)) if msg.contains("ftp")));

        let repo = GitRepo {
            name: "repo".into(),
            repository_url: "file:///repo".into(),
            organization_id: None,
            plain_auth: None,
            ssh_auth: None,
        };
        assert!(repo.validate().is_err());
    }

    #[test]
    fn storage_name_and_bucket_patterns() {
        assert!(s3_storage().validate().is_ok());

        let mut bad_name = s3_storage();
        bad_name.name = "has space".into();
        assert!(bad_name.validate().is_err());

        let mut bad_bucket = s3_storage();
        if let Some(s3) = bad_bucket.s3.as_mut() {
            s3.bucket_url = "https://my-bucket".into();
        }
        assert!(bad_bucket.validate().is_err());

        let mut mismatched = s3_storage();
        mismatched.storage_type = StorageType::Gcp;
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn run_args_limits_depend_on_labeling_type() {
        let limits = RunArgs {
            min_abs_bbox_size: 4,
            ..RunArgs::default()
        };
        let mut ds = dataset();
        assert!(ds.validate_run_args(&limits).is_err());
        assert!(ds.validate_run_args(&RunArgs::default()).is_ok());
        ds.labeling_type = LabelingType::ObjectDetection;
        assert!(ds.validate_run_args(&limits).is_ok());
        ds.labeling_type = LabelingType::SpeechToText;
        assert!(ds.validate_run_args(&RunArgs::default()).is_err());
    }

    #[test]
    fn run_record_parses_server_payload() {
        let record: RunRecord = serde_json::from_value(json!({
            "id": 1,
            "name": "cifar",
            "run_id": "abc",
            "status": "AWAITING MANUAL APPROVAL",
            "approved": false,
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.status, RunStatus::AwaitingManualApproval);
    }

    #[test]
    fn storage_config_is_not_serialized_with_the_dataset() {
        let mut ds = dataset();
        ds.storage_config_id = None;
        ds.storage_config = Some(s3_storage());
        let body = serde_json::to_value(&ds).unwrap();
        assert!(body.get("storage_config").is_none());
        assert_eq!(body["labeling_info"]["type"], "HirundoCSV");
    }
}
