use std::sync::Arc;

use crate::config::{DEFAULT_COPY_CONCURRENCY, DEFAULT_PAGE_SIZE, StorageConfig};
use crate::domain::{FileEntry, FolderEntry, FolderProperties, FsEntry, ListOptions};
use crate::error::StorageError;
use crate::meta::{MetadataStore, SqliteMetadataStore};
use crate::storage::{BackstoreProvider, DownloadDescriptor, DownloadKind, DownloadRequest};
use crate::utils::locks::PathLocks;
use crate::utils::path::{join, normalize, split, validate_name};

pub(super) type Result<T> = std::result::Result<T, StorageError>;

/// Entry point for every namespace operation.
#[derive(Clone)]
pub struct StorageService {
    pub(super) meta: Arc<dyn MetadataStore>,
    pub(super) backstores: BackstoreProvider,
    pub(super) locks: PathLocks,
    pub(super) page_size: u32,
    pub(super) copy_concurrency: usize,
}

impl StorageService {
    pub fn new(meta: Arc<dyn MetadataStore>, backstores: BackstoreProvider) -> Self {
        StorageService {
            meta,
            backstores,
            locks: PathLocks::new(),
            page_size: DEFAULT_PAGE_SIZE,
            copy_concurrency: DEFAULT_COPY_CONCURRENCY,
        }
    }

    /// Connect the SQLite metadata store and register every configured zone.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let meta =
            SqliteMetadataStore::connect(&config.database_url, config.max_connections).await?;
        let backstores = BackstoreProvider::from_config(config).await?;
        Ok(StorageService::new(Arc::new(meta), backstores)
            .with_page_size(config.list_page_size)
            .with_copy_concurrency(config.copy_concurrency))
    }

    /// Page size used by listings without `limit_after` and by tree walks.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_copy_concurrency(mut self, copy_concurrency: usize) -> Self {
        self.copy_concurrency = copy_concurrency.max(1);
        self
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    pub fn backstores(&self) -> &BackstoreProvider {
        &self.backstores
    }

    pub(super) async fn resolve_entry(&self, path: &str) -> Result<FsEntry> {
        self.meta
            .resolve(path)
            .await?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    pub(super) async fn resolve_folder(&self, path: &str) -> Result<FolderEntry> {
        match self.resolve_entry(path).await? {
            FsEntry::Folder(folder) => Ok(folder),
            _ => Err(StorageError::NotAFolder(path.to_string())),
        }
    }

    pub(super) async fn resolve_file(&self, path: &str) -> Result<FileEntry> {
        match self.resolve_entry(path).await? {
            FsEntry::File(file) => Ok(file),
            _ => Err(StorageError::NotAFile(path.to_string())),
        }
    }

    /// Delete the blobs behind rows that were removed with `force`.
    pub(super) async fn purge_blobs(&self, removed: &[FsEntry]) {
        for entry in removed {
            let file = match entry {
                FsEntry::File(f) => f,
                FsEntry::Sidecar(s) => &s.file,
                FsEntry::Folder(_) => continue,
            };
            let result = match self.backstores.get(file.storage_zone_id) {
                Ok(backstore) => backstore
                    .delete_file(&file.location(), &file.backstore_data)
                    .await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(
                    "failed to delete blob {} of {}: {}",
                    file.backstore_file_id,
                    file.meta.path,
                    e
                );
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize(path)?;
        Ok(self.meta.exists(&path).await?)
    }

    pub async fn info(&self, path: &str) -> Result<FsEntry> {
        let path = normalize(path)?;
        self.resolve_entry(&path).await
    }

    pub async fn list(&self, path: &str, options: ListOptions) -> Result<Vec<FsEntry>> {
        let query = options.into_query(self.page_size)?;
        let path = normalize(path)?;
        let folder = self.resolve_folder(&path).await?;
        Ok(self
            .meta
            .list(folder.child_parent_id(), &folder.meta.path, &query)
            .await?)
    }

    /// Create the top-level folder `/name`.
    pub async fn create_root(&self, name: &str, owner: &str) -> Result<i64> {
        self.create_folder("/", name, owner).await
    }

    pub async fn create_folder(&self, parent_path: &str, name: &str, owner: &str) -> Result<i64> {
        validate_name(name)?;
        let parent_path = normalize(parent_path)?;
        let target = join(&parent_path, name);
        let _guard = self.locks.acquire([target.clone()]).await;

        let parent = self.resolve_folder(&parent_path).await?;
        if self.meta.exists(&target).await? {
            return Err(StorageError::DestinyPathAlreadyExists(target));
        }
        let id = self
            .meta
            .create_folder(parent.child_parent_id(), name, owner)
            .await?;
        tracing::info!("created folder {} ({})", target, id);
        Ok(id)
    }

    /// Soft-delete the entry at `path` together with its descendants and sidecars.
    ///
    /// `children` is accepted for compatibility; deleting only the contents of a
    /// folder is not supported and the flag does not change the outcome.
    pub async fn delete(&self, path: &str, children: bool) -> Result<()> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(StorageError::InvalidPath("the root cannot be deleted".into()));
        }
        let _guard = self.locks.acquire([path.clone()]).await;
        let entry = self.resolve_entry(&path).await?;
        if children {
            tracing::warn!("children-only delete is not supported, deleting {} itself", path);
        }
        let removed = self.meta.delete_entry(entry.id(), false).await?;
        tracing::info!("deleted {} ({} rows)", path, removed.len());
        Ok(())
    }

    pub async fn folder_properties(&self, path: &str) -> Result<FolderProperties> {
        let path = normalize(path)?;
        let folder = self.resolve_folder(&path).await?;
        Ok(self
            .meta
            .calculate_folder_sizes(folder.child_parent_id())
            .await?)
    }

    /// Historical versions of the file at `path`, newest first.
    pub async fn versions(&self, path: &str) -> Result<Vec<FsEntry>> {
        let path = normalize(path)?;
        let file = self.resolve_file(&path).await?;
        let (parent_path, _) = split(&path)?;
        Ok(self
            .meta
            .get_versions(file.meta.parent_id, &parent_path, &file.meta.name)
            .await?)
    }

    pub async fn info_sidecar(&self, path: &str, tag: &str) -> Result<FsEntry> {
        let path = normalize(path)?;
        self.meta
            .resolve_sidecar(&path, tag)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("sidecar `{tag}` of {path}")))
    }

    /// Download the live file at `path`, or the historical version with id `version`.
    pub async fn download(
        &self,
        path: &str,
        version: Option<i64>,
        kind: DownloadKind,
    ) -> Result<DownloadDescriptor> {
        let path = normalize(path)?;
        let file = match version {
            None => self.resolve_file(&path).await?,
            Some(id) => match self.meta.get(id).await? {
                Some(FsEntry::File(f)) if !f.is_live() && f.meta.path == path => f,
                _ => return Err(StorageError::NotFound(format!("version {id} of {path}"))),
            },
        };
        self.download_file(&file, kind).await
    }

    pub async fn download_sidecar(
        &self,
        path: &str,
        tag: &str,
        kind: DownloadKind,
    ) -> Result<DownloadDescriptor> {
        match self.info_sidecar(path, tag).await? {
            FsEntry::Sidecar(sidecar) => self.download_file(&sidecar.file, kind).await,
            other => Err(StorageError::NotAFile(other.path().to_string())),
        }
    }

    async fn download_file(&self, file: &FileEntry, kind: DownloadKind) -> Result<DownloadDescriptor> {
        if !file.is_complete() {
            return Err(StorageError::service(format!(
                "upload of {} is still in progress",
                file.meta.path
            )));
        }
        let backstore = self.backstores.get(file.storage_zone_id)?;
        let location = file.location();
        let request = DownloadRequest {
            location: &location,
            data: &file.backstore_data,
            file_name: &file.meta.name,
            extension: file.extension.as_deref(),
            size: file.size,
        };
        tracing::debug!("{} download of {}", kind, file.meta.path);
        Ok(backstore.create_download_response(&request, kind).await?)
    }
}
