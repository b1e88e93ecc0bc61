pub mod entry;
pub mod list;

pub use entry::{
    EntryKind, EntryMeta, FileEntry, FolderEntry, FolderProperties, FsEntry, ROOT_ID,
    SidecarEntry, extension_of,
};
pub use list::{ListOptions, ListQuery, SortKey};
