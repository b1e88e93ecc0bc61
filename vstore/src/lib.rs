pub mod config;
pub mod domain;
pub mod error;
pub mod meta;
pub mod service;
pub mod storage;
pub mod utils;

pub use config::StorageConfig;
pub use domain::{FileEntry, FolderEntry, FsEntry, ListOptions, SidecarEntry};
pub use error::StorageError;
pub use service::StorageService;
pub use storage::{DownloadDescriptor, DownloadKind};
