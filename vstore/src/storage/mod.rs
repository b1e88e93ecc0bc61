use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use crate::config::{StorageConfig, ZoneDriver};
use crate::error::{BackstoreError, StorageError};

pub mod driver;
pub mod paths;

use driver::filesystem::FilesystemBackstore;
use driver::s3::S3Backstore;

/// Opaque resumption state owned by a backstore and persisted on the metadata row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackstoreData(serde_json::Value);

impl BackstoreData {
    pub fn empty() -> Self {
        BackstoreData(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn encode<T: Serialize>(state: &T) -> Result<Self, BackstoreError> {
        serde_json::to_value(state)
            .map(BackstoreData)
            .map_err(|e| BackstoreError::InvalidState(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BackstoreError> {
        serde_json::from_value(self.0.clone())
            .map_err(|e| BackstoreError::InvalidState(e.to_string()))
    }

    pub fn from_json(text: Option<&str>) -> Result<Self, serde_json::Error> {
        match text {
            Some(t) if !t.is_empty() => serde_json::from_str(t).map(BackstoreData),
            _ => Ok(BackstoreData::empty()),
        }
    }

    pub fn to_json(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.0.to_string())
        }
    }
}

/// Where a blob lives inside a storage zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub zone_id: i64,
    pub file_id: String,
    pub storage_path: String,
}

impl BlobLocation {
    /// A fresh location under a newly generated backstore file id.
    pub fn generate(zone_id: i64) -> Self {
        let file_id = uuid::Uuid::new_v4().simple().to_string();
        let storage_path = paths::PathManager::storage_path_for(&file_id);
        BlobLocation {
            zone_id,
            file_id,
            storage_path,
        }
    }
}

/// Payload of one `store_file` / `append_to_existing` call.
#[derive(Debug, Clone, Copy)]
pub struct StoreRequest<'a> {
    pub location: &'a BlobLocation,
    pub source: &'a Path,
    pub chunk_start: u64,
    pub final_chunk: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    pub location: &'a BlobLocation,
    pub data: &'a BackstoreData,
    pub file_name: &'a str,
    pub extension: Option<&'a str>,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadKind {
    Redirect,
    Local,
    #[default]
    Stream,
}

impl FromStr for DownloadKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redirect" => Ok(DownloadKind::Redirect),
            "local" => Ok(DownloadKind::Local),
            "stream" => Ok(DownloadKind::Stream),
            other => Err(StorageError::service(format!(
                "unknown download kind `{other}`"
            ))),
        }
    }
}

impl fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadKind::Redirect => write!(f, "redirect"),
            DownloadKind::Local => write!(f, "local"),
            DownloadKind::Stream => write!(f, "stream"),
        }
    }
}

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// What a caller gets back from a download request.
pub enum DownloadDescriptor {
    Redirect {
        url: String,
    },
    /// A temporary copy of the content; removed when the `TempPath` drops.
    Local {
        file: TempPath,
        extension: Option<String>,
        size: u64,
    },
    Stream {
        stream: ByteStream,
        extension: Option<String>,
        size: u64,
    },
}

impl DownloadDescriptor {
    pub fn kind(&self) -> DownloadKind {
        match self {
            DownloadDescriptor::Redirect { .. } => DownloadKind::Redirect,
            DownloadDescriptor::Local { .. } => DownloadKind::Local,
            DownloadDescriptor::Stream { .. } => DownloadKind::Stream,
        }
    }
}

impl fmt::Debug for DownloadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadDescriptor::Redirect { url } => {
                f.debug_struct("Redirect").field("url", url).finish()
            }
            DownloadDescriptor::Local {
                file,
                extension,
                size,
            } => f
                .debug_struct("Local")
                .field("file", &file.to_path_buf())
                .field("extension", extension)
                .field("size", size)
                .finish(),
            DownloadDescriptor::Stream {
                extension, size, ..
            } => f
                .debug_struct("Stream")
                .field("extension", extension)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Byte storage for one storage zone.
///
/// Implementations own the contents of [`BackstoreData`]; callers only thread it
/// through. A failed `append_to_existing` must leave the prior state usable for
/// a retry of the same chunk.
#[async_trait::async_trait]
pub trait Backstore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Write a complete payload or the first chunk of a resumable upload.
    async fn store_file(&self, req: &StoreRequest<'_>) -> Result<BackstoreData, BackstoreError>;

    /// Continue a partial upload from `prior`.
    async fn append_to_existing(
        &self,
        req: &StoreRequest<'_>,
        prior: &BackstoreData,
    ) -> Result<BackstoreData, BackstoreError>;

    /// Duplicate the bytes of `src` under `dst`.
    async fn copy_file(
        &self,
        src: &BlobLocation,
        src_data: &BackstoreData,
        dst: &BlobLocation,
    ) -> Result<BackstoreData, BackstoreError>;

    async fn create_download_response(
        &self,
        req: &DownloadRequest<'_>,
        kind: DownloadKind,
    ) -> Result<DownloadDescriptor, BackstoreError>;

    /// Remove the bytes (or abandon a partial upload). Missing blobs are not an error.
    async fn delete_file(
        &self,
        location: &BlobLocation,
        data: &BackstoreData,
    ) -> Result<(), BackstoreError>;
}

/// Zone id -> backstore registry injected into the orchestrator.
#[derive(Clone)]
pub struct BackstoreProvider {
    zones: HashMap<i64, Arc<dyn Backstore>>,
    default_zone: i64,
}

impl BackstoreProvider {
    pub fn new(default_zone: i64) -> Self {
        BackstoreProvider {
            zones: HashMap::new(),
            default_zone,
        }
    }

    pub fn with_zone(mut self, zone_id: i64, backstore: Arc<dyn Backstore>) -> Self {
        self.zones.insert(zone_id, backstore);
        self
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self, BackstoreError> {
        let mut provider = BackstoreProvider::new(config.default_zone);
        for zone in &config.zones {
            let backstore: Arc<dyn Backstore> = match &zone.driver {
                ZoneDriver::Filesystem {
                    root,
                    public_base_url,
                } => Arc::new(FilesystemBackstore::new(
                    root,
                    public_base_url.clone(),
                    &config.temp_dir,
                )),
                ZoneDriver::S3(settings) => {
                    Arc::new(S3Backstore::new(settings.clone(), &config.temp_dir).await)
                }
            };
            tracing::info!("registered {} backstore for zone {}", backstore.kind(), zone.id);
            provider = provider.with_zone(zone.id, backstore);
        }
        provider.get(config.default_zone)?;
        Ok(provider)
    }

    pub fn default_zone(&self) -> i64 {
        self.default_zone
    }

    pub fn get(&self, zone_id: i64) -> Result<Arc<dyn Backstore>, BackstoreError> {
        self.zones
            .get(&zone_id)
            .cloned()
            .ok_or(BackstoreError::UnknownZone(zone_id))
    }

    pub fn zone_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.zones.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backstore_data_json() {
        let empty = BackstoreData::from_json(None).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.to_json(), None);

        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct State {
            size: u64,
        }
        let data = BackstoreData::encode(&State { size: 42 }).unwrap();
        let text = data.to_json().unwrap();
        let back = BackstoreData::from_json(Some(&text)).unwrap();
        assert_eq!(back.decode::<State>().unwrap(), State { size: 42 });
        assert!(matches!(
            BackstoreData::empty().decode::<State>(),
            Err(BackstoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_generated_locations_are_unique() {
        let a = BlobLocation::generate(1);
        let b = BlobLocation::generate(1);
        assert_ne!(a.file_id, b.file_id);
        assert!(a.storage_path.ends_with(&a.file_id));
        assert_eq!(&a.storage_path[..2], &a.file_id[..2]);
    }

    #[test]
    fn test_provider_unknown_zone() {
        let provider = BackstoreProvider::new(1);
        assert!(matches!(provider.get(7), Err(BackstoreError::UnknownZone(7))));
        assert!("ftp".parse::<DownloadKind>().is_err());
        assert_eq!("local".parse::<DownloadKind>().unwrap(), DownloadKind::Local);
    }
}
