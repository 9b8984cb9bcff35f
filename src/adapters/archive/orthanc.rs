//! Orthanc REST client.
//!
//! Archive identifiers are Orthanc series ids. Payloads are fetched from
//! `/series/{id}/archive` and staged as `{images_dir}/{id}.zip` on the volume
//! shared with workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ArchiveConfig, StudyMetadata};
use crate::domain::ports::ArchiveClient;

#[derive(Debug, Default, Deserialize)]
struct Tags {
    #[serde(rename = "Modality")]
    modality: Option<String>,
    #[serde(rename = "PatientID")]
    patient_id: Option<String>,
    #[serde(rename = "StudyInstanceUID")]
    study_uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(rename = "MainDicomTags", default)]
    main_dicom_tags: Tags,
    #[serde(rename = "ParentStudy")]
    parent_study: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StudyResponse {
    #[serde(rename = "MainDicomTags", default)]
    main_dicom_tags: Tags,
    #[serde(rename = "PatientMainDicomTags", default)]
    patient_main_dicom_tags: Tags,
}

/// HTTP client for an Orthanc server.
#[derive(Debug, Clone)]
pub struct OrthancClient {
    http: Client,
    base_url: String,
    images_dir: PathBuf,
}

impl OrthancClient {
    /// Client for the configured archive; fails on a malformed URL.
    pub fn new(config: &ArchiveConfig) -> DomainResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DomainError::ArchiveUnavailable(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            images_dir: PathBuf::from(&config.images_dir),
        })
    }

    /// Where downloaded payloads are staged.
    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn payload_path(&self, study_ref: &str) -> PathBuf {
        self.images_dir.join(format!("{study_ref}.zip"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> DomainResult<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("GET {path} failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DomainError::StudyNotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DomainError::ArchiveUnavailable(format!(
                "GET {path} returned {status}: {body}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| DomainError::SerializationError(format!("GET {path} parse failed: {e}")))
    }

    async fn get_series(&self, study_ref: &str) -> DomainResult<SeriesResponse> {
        self.get_json(&format!("/series/{study_ref}")).await
    }
}

#[async_trait]
impl ArchiveClient for OrthancClient {
    async fn list_studies(&self) -> DomainResult<Vec<String>> {
        self.get_json("/series").await
    }

    async fn get_modality(&self, study_ref: &str) -> DomainResult<Option<String>> {
        Ok(self.get_series(study_ref).await?.main_dicom_tags.modality)
    }

    async fn get_metadata(&self, study_ref: &str) -> DomainResult<StudyMetadata> {
        let series = self.get_series(study_ref).await?;
        let mut metadata = StudyMetadata {
            modality: series.main_dicom_tags.modality,
            ..StudyMetadata::default()
        };

        if let Some(parent) = series.parent_study {
            let study: StudyResponse = self.get_json(&format!("/studies/{parent}")).await?;
            metadata.study_uid = study.main_dicom_tags.study_uid;
            metadata.patient_id = study
                .patient_main_dicom_tags
                .patient_id
                .or(study.main_dicom_tags.patient_id);
        }

        Ok(metadata)
    }

    async fn download(&self, study_ref: &str) -> DomainResult<PathBuf> {
        let path = format!("/series/{study_ref}/archive");
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("GET {path} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(DomainError::ArchiveUnavailable(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("cannot create images dir: {e}")))?;

        let target = self.payload_path(study_ref);
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("cannot create {}: {e}", target.display())))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| DomainError::ArchiveUnavailable(format!("download of {study_ref} interrupted: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DomainError::ArchiveUnavailable(format!("write to {} failed: {e}", target.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("flush of {} failed: {e}", target.display())))?;

        tracing::debug!(study_ref, path = %target.display(), "downloaded study payload");
        Ok(target)
    }

    async fn delete_local(&self, study_ref: &str) -> DomainResult<()> {
        let zip = self.payload_path(study_ref);
        let extracted = self.images_dir.join(study_ref);

        for result in [
            tokio::fs::remove_file(&zip).await,
            tokio::fs::remove_dir_all(&extracted).await,
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DomainError::ArchiveUnavailable(format!(
                        "failed to remove payload of {study_ref}: {e}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn delete_remote(&self, study_refs: &[String]) -> DomainResult<()> {
        if study_refs.is_empty() {
            return Ok(());
        }

        let url = format!("{}/tools/bulk-delete", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "Resources": study_refs }))
            .send()
            .await
            .map_err(|e| DomainError::ArchiveUnavailable(format!("bulk delete failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DomainError::ArchiveUnavailable(format!(
                "bulk delete returned {status}: {body}"
            )));
        }

        Ok(())
    }
}
