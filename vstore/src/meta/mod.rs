//! Metadata store
//!
//! Responsibilities:
//! - Own the `fs_entries` namespace table (SQLite via SQLx) and its migrations.
//! - Resolve materialized paths to entries and page through folders.
//! - Apply row-level mutations atomically; multi-row changes (folder moves,
//!   recursive deletes) run in one transaction.
//!
//! Submodules:
//! - `row`: the persisted row shape and its conversion into [`FsEntry`]
//! - `sqlite`: the SQLx implementation of [`MetadataStore`]
use crate::domain::{FileEntry, FolderProperties, FsEntry, ListQuery};
use crate::error::StoreError;
use crate::storage::{BackstoreData, BlobLocation};

pub mod row;
pub mod sqlite;

pub use sqlite::SqliteMetadataStore;

type Result<T> = std::result::Result<T, StoreError>;

/// A file row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub parent_id: Option<i64>,
    pub name: String,
    pub owner: String,
    pub complete: bool,
    pub size: u64,
    pub location: BlobLocation,
    pub backstore_data: BackstoreData,
    pub extension: Option<String>,
    pub sidecar: Option<SidecarLink>,
}

#[derive(Debug, Clone)]
pub struct SidecarLink {
    pub main_entry_id: i64,
    pub tag: String,
}

/// What happens to the entry a [`MetadataStore::replace_file`] call supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supersede {
    /// Keep the live complete file as a historical version.
    Archive(i64),
    /// Remove the row and its sidecars outright.
    Remove(i64),
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Live, non-sidecar entry at `path`. `/` resolves to the virtual root.
    async fn resolve(&self, path: &str) -> Result<Option<FsEntry>>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).await?.is_some())
    }

    /// Any non-deleted entry by id, historical versions included.
    async fn get(&self, id: i64) -> Result<Option<FsEntry>>;

    async fn list(
        &self,
        folder_id: Option<i64>,
        path: &str,
        query: &ListQuery,
    ) -> Result<Vec<FsEntry>>;

    async fn create_folder(&self, parent_id: Option<i64>, name: &str, owner: &str) -> Result<i64>;

    async fn create_file(&self, file: NewFile) -> Result<i64>;

    /// Retire `old` and insert `file` in one transaction; either both land or
    /// neither does. Returns the new id and the removed rows.
    async fn replace_file(&self, old: Supersede, file: NewFile) -> Result<(i64, Vec<FsEntry>)>;

    /// Fails [`StoreError::NotFound`] unless an in-progress live file matches.
    async fn update_file_progress(
        &self,
        parent_id: Option<i64>,
        name: &str,
        complete: bool,
        size: u64,
        backstore_data: &BackstoreData,
    ) -> Result<i64>;

    /// Archive the live complete file, freeing its slot.
    async fn create_version(&self, file: &FileEntry) -> Result<bool>;

    async fn move_entry(&self, entry_id: i64, new_parent_id: Option<i64>, new_name: &str)
    -> Result<()>;

    /// Copy one row. Folder children are not copied.
    async fn copy_entry(
        &self,
        entry_id: i64,
        new_parent_id: Option<i64>,
        new_name: &str,
        new_blob: Option<(&BlobLocation, &BackstoreData)>,
    ) -> Result<i64>;

    /// Soft delete (or remove with `force`) an entry with its descendants,
    /// sidecars and, for a live file, its archived versions. Returns the
    /// affected rows.
    async fn delete_entry(&self, entry_id: i64, force: bool) -> Result<Vec<FsEntry>>;

    async fn calculate_folder_sizes(&self, folder_id: Option<i64>) -> Result<FolderProperties>;

    /// Historical versions, newest first.
    async fn get_versions(
        &self,
        parent_id: Option<i64>,
        parent_path: &str,
        name: &str,
    ) -> Result<Vec<FsEntry>>;

    async fn resolve_sidecar(&self, path: &str, tag: &str) -> Result<Option<FsEntry>>;
}
