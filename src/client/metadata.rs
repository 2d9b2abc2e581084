//! Registration, finalize and status calls against the BFF and upload service

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    Envelope, FINALIZE, ITEM_STATUS, PRE_REGISTER, PREPARE_DOWNLOAD, PlatformClient, RESUME_LOOKUP,
    DOWNLOAD_STATUS, classify_rejection, read_json,
};
use crate::config::Zone;
use crate::error::{Error, Result};
use crate::services::{
    FinalizeRequest, ItemState, MetadataService, PreRegisterRequest, PrepareDownloadRequest,
    RegisteredFile, RemoteChunkState, ResumeLookupRequest,
};
use crate::session::decode_jwt_claims;
use crate::types::{DownloadJob, DownloadStatus, ItemStatus};
use crate::unit::Registration;

#[derive(Serialize)]
struct PreUploadPayload<'a> {
    project_code: &'a str,
    operator: &'a str,
    job_type: String,
    zone: &'a str,
    current_folder_node: &'a str,
    parent_folder_id: &'a str,
    folder_tags: &'a [String],
    data: Vec<PreUploadFile<'a>>,
}

#[derive(Serialize)]
struct PreUploadFile<'a> {
    resumable_filename: &'a str,
    resumable_relative_path: &'a str,
}

#[derive(Deserialize)]
struct PreUploadJob {
    target_names: Vec<String>,
    payload: PreUploadIds,
    job_id: String,
}

#[derive(Deserialize)]
struct PreUploadIds {
    resumable_identifier: String,
    item_id: String,
}

#[derive(Serialize)]
struct ResumePayload<'a> {
    bucket: &'a str,
    zone: &'a str,
    object_infos: Vec<ObjectInfo<'a>>,
}

#[derive(Serialize)]
struct ObjectInfo<'a> {
    object_path: &'a str,
    item_id: &'a str,
    resumable_id: &'a str,
}

#[derive(Deserialize)]
struct UploadedInfo {
    resumable_id: String,
    #[serde(default)]
    chunks_info: Option<BTreeMap<u32, String>>,
}

#[derive(Serialize)]
struct CombinePayload<'a> {
    project_code: &'a str,
    operator: &'a str,
    job_id: &'a str,
    item_id: &'a str,
    resumable_identifier: &'a str,
    #[serde(rename = "resumable_dataType")]
    resumable_data_type: &'static str,
    resumable_filename: &'a str,
    resumable_total_chunks: u32,
    resumable_total_size: u64,
    resumable_relative_path: &'a str,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    process_pipeline: Option<&'a str>,
    #[serde(skip_serializing_if = "str::is_empty")]
    upload_message: &'a str,
}

#[derive(Deserialize)]
struct CombineResponse {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct GeidQuery<'a> {
    geid: &'a [String],
}

#[derive(Deserialize)]
struct GeidEntry {
    result: GeidItem,
}

#[derive(Deserialize)]
struct GeidItem {
    id: String,
    status: ItemStatus,
}

#[derive(Serialize)]
struct DownloadPayload<'a> {
    files: Vec<DownloadFile<'a>>,
    zone: &'a str,
    operator: &'a str,
    container_code: &'a str,
    container_type: &'static str,
}

#[derive(Serialize)]
struct DownloadFile<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct DownloadTask {
    #[serde(default)]
    payload: Option<DownloadTaskPayload>,
    status: DownloadStatus,
}

#[derive(Deserialize)]
struct DownloadTaskPayload {
    hash_code: String,
}

#[derive(Deserialize)]
struct DownloadStatusResult {
    status: DownloadStatus,
}

/// Claims carried by a download hash code
#[derive(Deserialize, Default)]
struct HashCodeClaims {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    total_size: Option<u64>,
}

/// Decode the claims of a download hash code; opaque codes yield defaults.
fn hash_code_claims(hash_code: &str) -> HashCodeClaims {
    decode_jwt_claims(hash_code).unwrap_or_default()
}

#[async_trait]
impl MetadataService for PlatformClient {
    async fn pre_register(&self, request: &PreRegisterRequest) -> Result<Vec<RegisteredFile>> {
        let url = format!(
            "{}/v1/project/{}/files",
            self.endpoints.bff_url,
            urlencoding::encode(&request.project_code)
        );
        let payload = PreUploadPayload {
            project_code: &request.project_code,
            operator: &request.operator,
            job_type: request.upload_type.to_string(),
            zone: request.zone.as_str(),
            current_folder_node: &request.current_folder_node,
            parent_folder_id: &request.parent_folder_id,
            folder_tags: &request.folder_tags,
            data: request
                .files
                .iter()
                .map(|f| PreUploadFile {
                    resumable_filename: &f.file_name,
                    resumable_relative_path: &f.relative_path,
                })
                .collect(),
        };

        let response = self
            .authorize(self.http.post(&url), false)
            .await?
            .json(&payload)
            .send()
            .await?;
        let jobs: Envelope<Vec<PreUploadJob>> = read_json(PRE_REGISTER, response).await?;

        jobs.result
            .into_iter()
            .map(|job| {
                let object_path = job.target_names.into_iter().next().ok_or_else(|| {
                    Error::UnexpectedResponse {
                        operation: PRE_REGISTER,
                        reason: format!("job {} has no target name", job.job_id),
                    }
                })?;
                Ok(RegisteredFile {
                    object_path,
                    registration: Registration {
                        transfer_id: job.payload.resumable_identifier,
                        job_id: job.job_id,
                        item_id: job.payload.item_id,
                    },
                })
            })
            .collect()
    }

    async fn resume_lookup(&self, request: &ResumeLookupRequest) -> Result<Vec<RemoteChunkState>> {
        let url = format!(
            "{}/v1/project/{}/files/resumable",
            self.endpoints.bff_url,
            urlencoding::encode(&request.project_code)
        );
        let payload = ResumePayload {
            bucket: &request.bucket,
            zone: request.zone.as_str(),
            object_infos: request
                .targets
                .iter()
                .map(|t| ObjectInfo {
                    object_path: &t.object_path,
                    item_id: &t.item_id,
                    resumable_id: &t.transfer_id,
                })
                .collect(),
        };

        let response = self
            .authorize(self.http.post(&url), false)
            .await?
            .json(&payload)
            .send()
            .await?;
        let infos: Envelope<Vec<UploadedInfo>> = read_json(RESUME_LOOKUP, response).await?;

        Ok(infos
            .result
            .into_iter()
            .map(|info| RemoteChunkState {
                transfer_id: info.resumable_id,
                chunks: info.chunks_info.unwrap_or_default(),
            })
            .collect())
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<String> {
        let url = format!("{}/v1/files", self.endpoints.upload_url(request.zone));
        let payload = CombinePayload {
            project_code: &request.project_code,
            operator: &request.operator,
            job_id: &request.registration.job_id,
            item_id: &request.registration.item_id,
            resumable_identifier: &request.registration.transfer_id,
            resumable_data_type: "SINGLE_FILE_DATA",
            resumable_filename: &request.file_name,
            resumable_total_chunks: request.total_chunks,
            resumable_total_size: request.total_size,
            resumable_relative_path: &request.relative_path,
            tags: &request.tags,
            process_pipeline: request.process_pipeline.as_deref(),
            upload_message: &request.upload_message,
        };

        let response = self
            .authorize(self.http.post(&url), true)
            .await?
            .json(&payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body: CombineResponse = serde_json::from_str(&text).map_err(|e| {
            Error::UnexpectedResponse {
                operation: FINALIZE,
                reason: e.to_string(),
            }
        })?;
        // The upload service reports the outcome in the body code
        if body.code != 200 {
            return Err(classify_rejection(FINALIZE, body.code.max(status), text));
        }

        let item_id = body
            .result
            .as_ref()
            .and_then(|r| r.get("id"))
            .and_then(|id| id.as_str())
            .unwrap_or(&request.registration.item_id)
            .to_string();
        Ok(item_id)
    }

    async fn item_statuses(&self, item_ids: &[String]) -> Result<Vec<ItemState>> {
        let url = format!("{}/v1/query/geid", self.endpoints.bff_url);
        let response = self
            .authorize(self.http.post(&url), false)
            .await?
            .json(&GeidQuery { geid: item_ids })
            .send()
            .await?;
        let entries: Envelope<Vec<GeidEntry>> = read_json(ITEM_STATUS, response).await?;
        Ok(entries
            .result
            .into_iter()
            .map(|e| ItemState {
                item_id: e.result.id,
                status: e.result.status,
            })
            .collect())
    }

    async fn prepare_download(&self, request: &PrepareDownloadRequest) -> Result<DownloadJob> {
        let url = format!(
            "{}/v1/project/{}/files/download",
            self.endpoints.bff_url,
            urlencoding::encode(&request.project_code)
        );
        let payload = DownloadPayload {
            files: request
                .item_ids
                .iter()
                .map(|id| DownloadFile { id })
                .collect(),
            zone: request.zone.as_str(),
            operator: &request.operator,
            container_code: &request.project_code,
            container_type: "project",
        };

        let response = self
            .authorize(self.http.post(&url), true)
            .await?
            .json(&payload)
            .send()
            .await?;
        let task: Envelope<DownloadTask> = read_json(PREPARE_DOWNLOAD, response).await?;
        let hash_code = task
            .result
            .payload
            .map(|p| p.hash_code)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::UnexpectedResponse {
                operation: PREPARE_DOWNLOAD,
                reason: "missing hash code".to_string(),
            })?;

        let claims = hash_code_claims(&hash_code);
        Ok(DownloadJob {
            hash_code,
            status: task.result.status,
            total_size: claims.total_size,
            file_path: claims.file_path,
        })
    }

    async fn download_status(&self, zone: Zone, hash_code: &str) -> Result<DownloadJob> {
        let url = format!(
            "{}v1/download/status/{}",
            self.endpoints.download_url(zone),
            hash_code
        );
        let response = self.http.get(&url).send().await?;
        let status: Envelope<DownloadStatusResult> = read_json(DOWNLOAD_STATUS, response).await?;
        let claims = hash_code_claims(hash_code);
        Ok(DownloadJob {
            hash_code: hash_code.to_string(),
            status: status.result.status,
            total_size: claims.total_size,
            file_path: claims.file_path,
        })
    }
}
