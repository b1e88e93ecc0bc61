use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::domain::{EntryMeta, FileEntry, FolderEntry, FsEntry, SidecarEntry};
use crate::error::StoreError;
use crate::storage::BackstoreData;

pub const ENTRY_COLUMNS: &[&str] = &[
    "id",
    "parent_id",
    "path",
    "name",
    "entry_type",
    "extension",
    "size_bytes",
    "owner",
    "storage_zone_id",
    "backstore_file_id",
    "storage_path",
    "backstore_data",
    "is_complete",
    "versioned_on",
    "sidecar_tag",
    "main_entry_id",
    "created_on",
    "updated_on",
    "deleted_on",
];

/// Comma-separated column list, optionally qualified with a table alias.
pub fn columns(alias: Option<&str>) -> String {
    ENTRY_COLUMNS
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{a}.{c}"),
            None => (*c).to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// One row of `fs_entries`.
#[derive(Debug, Clone, FromRow)]
pub struct EntryRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub path: String,
    pub name: String,
    pub entry_type: String,
    pub extension: Option<String>,
    pub size_bytes: i64,
    pub owner: String,
    pub storage_zone_id: Option<i64>,
    pub backstore_file_id: Option<String>,
    pub storage_path: Option<String>,
    pub backstore_data: Option<String>,
    pub is_complete: bool,
    pub versioned_on: Option<DateTime<Utc>>,
    pub sidecar_tag: Option<String>,
    pub main_entry_id: Option<i64>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    pub deleted_on: Option<DateTime<Utc>>,
}

impl EntryRow {
    pub fn is_folder(&self) -> bool {
        self.entry_type == "folder"
    }

    fn corrupt(&self, reason: &str) -> StoreError {
        StoreError::Corrupt {
            id: self.id,
            reason: reason.to_string(),
        }
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            id: self.id,
            parent_id: self.parent_id,
            path: self.path.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            created_on: self.created_on,
            updated_on: self.updated_on,
        }
    }

    fn file(&self) -> Result<FileEntry, StoreError> {
        let storage_zone_id = self
            .storage_zone_id
            .ok_or_else(|| self.corrupt("file without storage zone"))?;
        let backstore_file_id = self
            .backstore_file_id
            .clone()
            .ok_or_else(|| self.corrupt("file without backstore id"))?;
        let storage_path = self
            .storage_path
            .clone()
            .ok_or_else(|| self.corrupt("file without storage path"))?;
        let backstore_data = BackstoreData::from_json(self.backstore_data.as_deref())
            .map_err(|e| self.corrupt(&format!("undecodable backstore data: {e}")))?;
        Ok(FileEntry {
            meta: self.meta(),
            extension: self.extension.clone(),
            size: u64::try_from(self.size_bytes).map_err(|_| self.corrupt("negative size"))?,
            storage_zone_id,
            backstore_file_id,
            storage_path,
            backstore_data,
            complete: self.is_complete,
            versioned_on: self.versioned_on,
        })
    }
}

impl TryFrom<EntryRow> for FsEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        match row.entry_type.as_str() {
            "folder" => Ok(FsEntry::Folder(FolderEntry { meta: row.meta() })),
            "file" => {
                let file = row.file()?;
                match &row.sidecar_tag {
                    Some(tag) => Ok(FsEntry::Sidecar(SidecarEntry {
                        file,
                        main_entry_id: row
                            .main_entry_id
                            .ok_or_else(|| row.corrupt("sidecar without main entry"))?,
                        metadata_tag: tag.clone(),
                    })),
                    None => Ok(FsEntry::File(file)),
                }
            }
            other => Err(row.corrupt(&format!("unknown entry type `{other}`"))),
        }
    }
}

pub fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<FsEntry>, StoreError> {
    rows.into_iter().map(FsEntry::try_from).collect()
}
