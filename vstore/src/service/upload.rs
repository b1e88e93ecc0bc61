use std::path::Path;

use super::storage::{Result, StorageService};
use crate::domain::{FileEntry, FsEntry, SidecarEntry, extension_of};
use crate::error::{MapToStorageError, StorageError};
use crate::meta::{NewFile, SidecarLink, Supersede};
use crate::storage::{BlobLocation, StoreRequest};
use crate::utils::path::{join, normalize, validate_name};

impl StorageService {
    /// Store one chunk of `parent_path/name` read from `source`.
    ///
    /// Chunk 0 starts a fresh upload (archiving a complete predecessor as a
    /// version, discarding an unfinished one, both only once the new chunk is
    /// stored). Later chunks must start exactly
    /// at the size uploaded so far. Returns the file once `final_chunk` lands,
    /// `None` before that.
    pub async fn upload_file(
        &self,
        parent_path: &str,
        name: &str,
        source: &Path,
        chunk_start: u64,
        final_chunk: bool,
        owner: &str,
    ) -> Result<Option<FileEntry>> {
        validate_name(name)?;
        let parent_path = normalize(parent_path)?;
        let path = join(&parent_path, name);
        let _guard = self.locks.acquire([path.clone()]).await;

        let parent = self.resolve_folder(&parent_path).await?;
        let existing = self.meta.resolve(&path).await?;
        let id = match (chunk_start, existing) {
            (_, Some(FsEntry::Folder(_))) => {
                return Err(StorageError::DestinyPathAlreadyExists(path));
            }
            (0, existing) => {
                let supersede = match existing {
                    Some(FsEntry::File(old)) if old.is_complete() => Some(Supersede::Archive(old.meta.id)),
                    Some(FsEntry::File(stale)) => Some(Supersede::Remove(stale.meta.id)),
                    _ => None,
                };
                let file = NewFile {
                    parent_id: parent.child_parent_id(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                    complete: final_chunk,
                    size: 0,
                    location: BlobLocation::generate(self.backstores.default_zone()),
                    backstore_data: Default::default(),
                    extension: extension_of(name),
                    sidecar: None,
                };
                let id = self.store_new(file, source, supersede).await?;
                match supersede {
                    Some(Supersede::Archive(old)) => tracing::debug!("archived {} as version {}", path, old),
                    Some(Supersede::Remove(_)) => tracing::debug!("discarded unfinished upload {}", path),
                    None => {}
                }
                id
            }
            (_, Some(FsEntry::File(current))) if !current.is_complete() => {
                self.append(current, source, chunk_start, final_chunk).await?
            }
            _ => {
                return Err(StorageError::NotFound(format!(
                    "resume target {path} at offset {chunk_start}"
                )));
            }
        };

        if !final_chunk {
            tracing::debug!("accepted chunk at {} for {}", chunk_start, path);
            return Ok(None);
        }
        let file = self
            .meta
            .get(id)
            .await?
            .and_then(FsEntry::into_file)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;
        tracing::info!("upload of {} complete ({} bytes)", path, file.size);
        Ok(Some(file))
    }

    /// Attach `source` to the live file at `main_path` under `tag`, replacing
    /// any sidecar already stored for that tag.
    pub async fn upload_sidecar(&self, main_path: &str, tag: &str, source: &Path) -> Result<SidecarEntry> {
        if tag.is_empty() {
            return Err(StorageError::service("sidecar tag must not be empty"));
        }
        let path = normalize(main_path)?;
        let _guard = self.locks.acquire([path.clone()]).await;
        let main = self.resolve_file(&path).await?;
        let supersede = self
            .meta
            .resolve_sidecar(&path, tag)
            .await?
            .map(|old| Supersede::Remove(old.id()));
        let file = NewFile {
            parent_id: main.meta.parent_id,
            name: main.meta.name.clone(),
            owner: main.meta.owner.clone(),
            complete: true,
            size: 0,
            location: BlobLocation::generate(self.backstores.default_zone()),
            backstore_data: Default::default(),
            extension: main.extension.clone(),
            sidecar: Some(SidecarLink {
                main_entry_id: main.meta.id,
                tag: tag.to_string(),
            }),
        };
        let id = self.store_new(file, source, supersede).await?;
        match self.meta.get(id).await? {
            Some(FsEntry::Sidecar(sidecar)) => {
                tracing::info!("stored sidecar `{}` of {}", tag, path);
                Ok(sidecar)
            }
            _ => Err(StorageError::NotFound(format!("sidecar `{tag}` of {path}"))),
        }
    }

    /// Write the first (or only) chunk into a fresh blob, then insert its row,
    /// retiring `supersede` in the same metadata transaction. The previous
    /// entry stays live if anything before the commit fails.
    async fn store_new(&self, mut file: NewFile, source: &Path, supersede: Option<Supersede>) -> Result<i64> {
        let backstore = self.backstores.get(file.location.zone_id)?;
        file.size = chunk_len(source).await?;
        let request = StoreRequest {
            location: &file.location,
            source,
            chunk_start: 0,
            final_chunk: file.complete,
        };
        file.backstore_data = backstore.store_file(&request).await?;

        let location = file.location.clone();
        let data = file.backstore_data.clone();
        let inserted = match supersede {
            Some(old) => self.meta.replace_file(old, file).await,
            None => self.meta.create_file(file).await.map(|id| (id, Vec::new())),
        };
        match inserted {
            Ok((id, removed)) => {
                self.purge_blobs(&removed).await;
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = backstore.delete_file(&location, &data).await {
                    tracing::warn!("failed to delete orphaned blob {}: {}", location.file_id, cleanup);
                }
                Err(e.into())
            }
        }
    }

    async fn append(
        &self,
        current: FileEntry,
        source: &Path,
        chunk_start: u64,
        final_chunk: bool,
    ) -> Result<i64> {
        if chunk_start != current.size {
            return Err(StorageError::service(format!(
                "chunk offset {} does not match the {} bytes uploaded to {}",
                chunk_start, current.size, current.meta.path
            )));
        }
        let backstore = self.backstores.get(current.storage_zone_id)?;
        let len = chunk_len(source).await?;
        let location = current.location();
        let request = StoreRequest {
            location: &location,
            source,
            chunk_start,
            final_chunk,
        };
        let data = backstore
            .append_to_existing(&request, &current.backstore_data)
            .await?;
        Ok(self
            .meta
            .update_file_progress(
                current.meta.parent_id,
                &current.meta.name,
                final_chunk,
                chunk_start + len,
                &data,
            )
            .await?)
    }
}

async fn chunk_len(source: &Path) -> Result<u64> {
    Ok(tokio::fs::metadata(source)
        .await
        .map_to_service("reading upload chunk")?
        .len())
}
