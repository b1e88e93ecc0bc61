use std::path::{Path, PathBuf};

use crate::error::BackstoreError;
use crate::storage::paths::PathManager;
use crate::storage::{
    Backstore, BackstoreData, BlobLocation, DownloadDescriptor, DownloadKind, DownloadRequest,
    StoreRequest,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions, copy, create_dir_all, remove_file},
    io::{self, AsyncSeekExt, AsyncWriteExt, BufWriter},
};
use tokio_util::io::ReaderStream;

/// Resumption state: the number of durable bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct LocalState {
    size: u64,
}

pub struct FilesystemBackstore {
    path_manager: PathManager,
    public_base_url: Option<String>,
    temp_dir: PathBuf,
}

impl FilesystemBackstore {
    pub fn new(root: impl AsRef<Path>, public_base_url: Option<String>, temp_dir: &Path) -> Self {
        FilesystemBackstore {
            path_manager: PathManager::new(root),
            public_base_url,
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    pub fn blob_path(&self, location: &BlobLocation) -> PathBuf {
        self.path_manager
            .blob_data_path(location.zone_id, &location.storage_path)
    }

    async fn crate_path(&self, location: &BlobLocation) -> io::Result<PathBuf> {
        let file_path = self.blob_path(location);
        if let Some(parent) = file_path.parent() {
            create_dir_all(parent).await?;
        }
        Ok(file_path)
    }

    /// Copy `source` onto the end of `writer`, returning the bytes written.
    async fn write_from(source: &Path, file: File) -> io::Result<u64> {
        let mut reader = File::open(source).await?;
        let mut writer = BufWriter::new(file);
        let written = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(written)
    }
}

#[async_trait::async_trait]
impl Backstore for FilesystemBackstore {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    async fn store_file(&self, req: &StoreRequest<'_>) -> Result<BackstoreData, BackstoreError> {
        let file_path = self.crate_path(req.location).await?;
        let file = File::create(&file_path).await?;
        let size = Self::write_from(req.source, file).await?;
        tracing::debug!("stored {} bytes at {}", size, file_path.display());
        BackstoreData::encode(&LocalState { size })
    }

    async fn append_to_existing(
        &self,
        req: &StoreRequest<'_>,
        prior: &BackstoreData,
    ) -> Result<BackstoreData, BackstoreError> {
        let prior: LocalState = prior.decode()?;
        let file_path = self.blob_path(req.location);
        let mut file = match OpenOptions::new().write(true).open(&file_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackstoreError::InvalidState(format!(
                    "partial upload {} is gone",
                    req.location.file_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let on_disk = file.metadata().await?.len();
        if on_disk < prior.size {
            return Err(BackstoreError::InvalidState(format!(
                "partial upload {} holds {} bytes, expected {}",
                req.location.file_id, on_disk, prior.size
            )));
        }
        if on_disk > prior.size {
            // leftover from an append that never got recorded
            tracing::debug!(
                "trimming {} stray bytes from {}",
                on_disk - prior.size,
                file_path.display()
            );
            file.set_len(prior.size).await?;
        }
        file.seek(io::SeekFrom::Start(prior.size)).await?;

        let written = Self::write_from(req.source, file).await?;
        BackstoreData::encode(&LocalState {
            size: prior.size + written,
        })
    }

    async fn copy_file(
        &self,
        src: &BlobLocation,
        _src_data: &BackstoreData,
        dst: &BlobLocation,
    ) -> Result<BackstoreData, BackstoreError> {
        let src_path = self.blob_path(src);
        let dst_path = self.crate_path(dst).await?;
        let size = copy(&src_path, &dst_path).await?;
        BackstoreData::encode(&LocalState { size })
    }

    async fn create_download_response(
        &self,
        req: &DownloadRequest<'_>,
        kind: DownloadKind,
    ) -> Result<DownloadDescriptor, BackstoreError> {
        let file_path = self.blob_path(req.location);
        let extension = req.extension.map(str::to_string);
        match kind {
            DownloadKind::Redirect => {
                let base = self.public_base_url.as_deref().ok_or_else(|| {
                    BackstoreError::Unsupported(
                        "redirect downloads need a public base url".to_string(),
                    )
                })?;
                Ok(DownloadDescriptor::Redirect {
                    url: format!(
                        "{}/{}",
                        base.trim_end_matches('/'),
                        PathManager::object_key(req.location.zone_id, &req.location.storage_path)
                    ),
                })
            }
            DownloadKind::Local => {
                create_dir_all(&self.temp_dir).await?;
                let temp = tempfile::Builder::new()
                    .prefix("vstore-dl-")
                    .tempfile_in(&self.temp_dir)?
                    .into_temp_path();
                let size = copy(&file_path, &temp).await?;
                Ok(DownloadDescriptor::Local {
                    file: temp,
                    extension,
                    size,
                })
            }
            DownloadKind::Stream => {
                let file = File::open(&file_path).await?;
                let size = file.metadata().await?.len();
                Ok(DownloadDescriptor::Stream {
                    stream: ReaderStream::new(file).boxed(),
                    extension,
                    size,
                })
            }
        }
    }

    async fn delete_file(
        &self,
        location: &BlobLocation,
        _data: &BackstoreData,
    ) -> Result<(), BackstoreError> {
        match remove_file(self.blob_path(location)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
