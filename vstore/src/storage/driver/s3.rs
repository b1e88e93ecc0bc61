//! S3-compatible backstore built on aws-sdk-s3.
//!
//! A single-chunk upload is one `PutObject`. A chunked upload maps onto a
//! multipart upload: the first chunk creates it, each chunk becomes one part,
//! and the final chunk completes it. The upload id and part etags are the
//! resumption state, so a retried chunk re-sends the same part number.
//! S3 requires every part except the last to be at least 5 MiB; callers pick
//! chunk sizes accordingly.

use std::path::{Path, PathBuf};

use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use crate::config::S3Settings;
use crate::error::BackstoreError;
use crate::storage::paths::PathManager;
use crate::storage::{
    Backstore, BackstoreData, BlobLocation, DownloadDescriptor, DownloadKind, DownloadRequest,
    StoreRequest,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct S3Part {
    number: i32,
    e_tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct S3State {
    size: u64,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(default)]
    parts: Vec<S3Part>,
    #[serde(default)]
    e_tag: Option<String>,
}

pub struct S3Backstore {
    client: Client,
    settings: S3Settings,
    temp_dir: PathBuf,
}

impl S3Backstore {
    pub async fn new(settings: S3Settings, temp_dir: &Path) -> Self {
        let mut loader = aws_config::ConfigLoader::default()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
            .region(aws_config::Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(settings.endpoint.is_some())
            .build();
        S3Backstore {
            client: Client::from_conf(s3_conf),
            settings,
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    fn key(location: &BlobLocation) -> String {
        PathManager::object_key(location.zone_id, &location.storage_path)
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T, BackstoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 0;
        let max_retries = self.settings.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        return Err(BackstoreError::s3(operation_name, e));
                    }
                    tracing::warn!("{operation_name} attempt {attempt} failed: {e}");
                    sleep(retry_delay(self.settings.initial_retry_delay_ms, attempt)).await;
                }
            }
        }
    }

    async fn put_whole(&self, key: &str, data: Vec<u8>) -> Result<Option<String>, BackstoreError> {
        let checksum = Self::md5_base64(&data);
        let operation = || async {
            self.client
                .put_object()
                .bucket(&self.settings.bucket)
                .key(key)
                .content_md5(checksum.clone())
                .body(S3ByteStream::from(data.clone()))
                .send()
                .await
        };
        let resp = self.execute_with_retry(operation, "put_object").await?;
        Ok(resp.e_tag().map(str::to_string))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<S3Part, BackstoreError> {
        let checksum = Self::md5_base64(&data);
        let operation = || async {
            self.client
                .upload_part()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(checksum.clone())
                .body(S3ByteStream::from(data.clone()))
                .send()
                .await
        };
        let resp = self.execute_with_retry(operation, "upload_part").await?;
        Ok(S3Part {
            number: part_number,
            e_tag: resp.e_tag().map(str::to_string),
        })
    }

    async fn complete(&self, key: &str, state: &S3State) -> Result<Option<String>, BackstoreError> {
        let upload_id = state
            .upload_id
            .as_deref()
            .ok_or_else(|| BackstoreError::InvalidState("no multipart upload to complete".into()))?;
        let parts = state
            .parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.number)
                    .set_e_tag(p.e_tag.clone())
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| BackstoreError::s3("complete_multipart_upload", e))?;
        Ok(resp.e_tag().map(str::to_string))
    }

    async fn fetch(&self, key: &str) -> Result<S3ByteStream, BackstoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackstoreError::s3("get_object", e))?;
        Ok(resp.body)
    }
}

#[async_trait::async_trait]
impl Backstore for S3Backstore {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn store_file(&self, req: &StoreRequest<'_>) -> Result<BackstoreData, BackstoreError> {
        let key = Self::key(req.location);
        let data = tokio::fs::read(req.source).await?;
        let size = data.len() as u64;

        if req.final_chunk {
            let e_tag = self.put_whole(&key, data).await?;
            return BackstoreData::encode(&S3State {
                size,
                e_tag,
                ..Default::default()
            });
        }

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BackstoreError::s3("create_multipart_upload", e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| BackstoreError::InvalidState("s3 returned no upload id".into()))?
            .to_string();
        let part = self.upload_part(&key, &upload_id, 1, data).await?;
        tracing::debug!("started multipart upload {} for {}", upload_id, key);
        BackstoreData::encode(&S3State {
            size,
            upload_id: Some(upload_id),
            parts: vec![part],
            e_tag: None,
        })
    }

    async fn append_to_existing(
        &self,
        req: &StoreRequest<'_>,
        prior: &BackstoreData,
    ) -> Result<BackstoreData, BackstoreError> {
        let mut state: S3State = prior.decode()?;
        let upload_id = state
            .upload_id
            .clone()
            .ok_or_else(|| BackstoreError::InvalidState("upload is already complete".into()))?;
        let key = Self::key(req.location);
        let data = tokio::fs::read(req.source).await?;
        let written = data.len() as u64;

        let part_number = state.parts.len() as i32 + 1;
        let part = self.upload_part(&key, &upload_id, part_number, data).await?;
        state.parts.push(part);
        state.size += written;

        if req.final_chunk {
            state.e_tag = self.complete(&key, &state).await?;
            state.upload_id = None;
            state.parts.clear();
        }
        BackstoreData::encode(&state)
    }

    async fn copy_file(
        &self,
        src: &BlobLocation,
        src_data: &BackstoreData,
        dst: &BlobLocation,
    ) -> Result<BackstoreData, BackstoreError> {
        let state: S3State = src_data.decode()?;
        if state.upload_id.is_some() {
            return Err(BackstoreError::InvalidState(
                "cannot copy an unfinished multipart upload".into(),
            ));
        }
        let resp = self
            .client
            .copy_object()
            .bucket(&self.settings.bucket)
            .copy_source(format!("{}/{}", self.settings.bucket, Self::key(src)))
            .key(Self::key(dst))
            .send()
            .await
            .map_err(|e| BackstoreError::s3("copy_object", e))?;
        let e_tag = resp
            .copy_object_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string);
        BackstoreData::encode(&S3State {
            size: state.size,
            e_tag,
            ..Default::default()
        })
    }

    async fn create_download_response(
        &self,
        req: &DownloadRequest<'_>,
        kind: DownloadKind,
    ) -> Result<DownloadDescriptor, BackstoreError> {
        let key = Self::key(req.location);
        let extension = req.extension.map(str::to_string);
        match kind {
            DownloadKind::Redirect => {
                let presign = PresigningConfig::expires_in(Duration::from_secs(
                    self.settings.presign_ttl_secs,
                ))
                .map_err(|e| BackstoreError::s3("presign", e))?;
                let presigned = self
                    .client
                    .get_object()
                    .bucket(&self.settings.bucket)
                    .key(&key)
                    .response_content_disposition(format!(
                        "attachment; filename=\"{}\"",
                        req.file_name
                    ))
                    .presigned(presign)
                    .await
                    .map_err(|e| BackstoreError::s3("presign", e))?;
                Ok(DownloadDescriptor::Redirect {
                    url: presigned.uri().to_string(),
                })
            }
            DownloadKind::Local => {
                let body = self.fetch(&key).await?;
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| BackstoreError::s3("get_object", e))?
                    .into_bytes();
                tokio::fs::create_dir_all(&self.temp_dir).await?;
                let temp = tempfile::Builder::new()
                    .prefix("vstore-dl-")
                    .tempfile_in(&self.temp_dir)?
                    .into_temp_path();
                tokio::fs::write(&temp, &bytes).await?;
                Ok(DownloadDescriptor::Local {
                    file: temp,
                    extension,
                    size: bytes.len() as u64,
                })
            }
            DownloadKind::Stream => {
                let body = self.fetch(&key).await?;
                let stream = futures::stream::unfold(body, |mut body| async move {
                    body.next()
                        .await
                        .map(|chunk| (chunk.map_err(std::io::Error::other), body))
                });
                Ok(DownloadDescriptor::Stream {
                    stream: stream.boxed(),
                    extension,
                    size: req.size,
                })
            }
        }
    }

    async fn delete_file(
        &self,
        location: &BlobLocation,
        data: &BackstoreData,
    ) -> Result<(), BackstoreError> {
        let key = Self::key(location);
        let state: S3State = data.decode().unwrap_or_default();
        if let Some(upload_id) = state.upload_id {
            self.client
                .abort_multipart_upload()
                .bucket(&self.settings.bucket)
                .key(&key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| BackstoreError::s3("abort_multipart_upload", e))?;
            return Ok(());
        }
        self.client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BackstoreError::s3("delete_object", e))?;
        Ok(())
    }
}

/// Exponential backoff for the given 1-based attempt, saturating instead of overflowing.
fn retry_delay(initial_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(initial_ms.saturating_mul(factor))
}
