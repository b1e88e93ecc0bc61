use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{BackstoreData, BlobLocation};

/// Id reported for the virtual root folder `/`.
pub const ROOT_ID: i64 = 0;

/// Identity shared by every namespace entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub path: String,
    pub name: String,
    pub owner: String,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub meta: EntryMeta,
    pub extension: Option<String>,
    pub size: u64,
    pub storage_zone_id: i64,
    pub backstore_file_id: String,
    pub storage_path: String,
    pub backstore_data: BackstoreData,
    pub complete: bool,
    /// `None` for the live entry, the archive time for a historical version.
    pub versioned_on: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_live(&self) -> bool {
        self.versioned_on.is_none()
    }

    pub fn location(&self) -> BlobLocation {
        BlobLocation {
            zone_id: self.storage_zone_id,
            file_id: self.backstore_file_id.clone(),
            storage_path: self.storage_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub meta: EntryMeta,
}

impl FolderEntry {
    /// The virtual `/` folder. It has no row in the metadata store.
    pub fn root() -> Self {
        let epoch = DateTime::<Utc>::default();
        FolderEntry {
            meta: EntryMeta {
                id: ROOT_ID,
                parent_id: None,
                path: "/".to_string(),
                name: String::new(),
                owner: String::new(),
                created_on: epoch,
                updated_on: epoch,
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.meta.id == ROOT_ID && self.meta.path == "/"
    }

    /// Parent id to store on rows created directly below this folder.
    pub fn child_parent_id(&self) -> Option<i64> {
        if self.is_root() { None } else { Some(self.meta.id) }
    }
}

/// A derived artifact (thumbnail, preview) hanging off a main file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarEntry {
    pub file: FileEntry,
    pub main_entry_id: i64,
    pub metadata_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FsEntry {
    File(FileEntry),
    Folder(FolderEntry),
    Sidecar(SidecarEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
    Sidecar,
}

impl FsEntry {
    pub fn meta(&self) -> &EntryMeta {
        match self {
            FsEntry::File(f) => &f.meta,
            FsEntry::Folder(f) => &f.meta,
            FsEntry::Sidecar(s) => &s.file.meta,
        }
    }

    pub fn id(&self) -> i64 {
        self.meta().id
    }

    pub fn path(&self) -> &str {
        &self.meta().path
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            FsEntry::File(_) => EntryKind::File,
            FsEntry::Folder(_) => EntryKind::Folder,
            FsEntry::Sidecar(_) => EntryKind::Sidecar,
        }
    }

    pub fn into_file(self) -> Option<FileEntry> {
        match self {
            FsEntry::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_folder(self) -> Option<FolderEntry> {
        match self {
            FsEntry::Folder(f) => Some(f),
            _ => None,
        }
    }

    /// Bytes attributed to the entry; folders report zero.
    pub fn size(&self) -> u64 {
        match self {
            FsEntry::File(f) => f.size,
            FsEntry::Folder(_) => 0,
            FsEntry::Sidecar(s) => s.file.size,
        }
    }
}

/// Aggregate returned by `folder_properties`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderProperties {
    pub file_count: u64,
    pub folder_count: u64,
    pub total_size: u64,
}

/// Lower-cased final `.suffix` of a name; dot-files and bare names have none.
pub fn extension_of(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}
