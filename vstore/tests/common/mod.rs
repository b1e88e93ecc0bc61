#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::TryStreamExt;
use tempfile::TempDir;
use vstore::{DownloadDescriptor, DownloadKind, FileEntry, StorageConfig, StorageService};

pub const OWNER: &str = "alice";

pub struct TestStore {
    pub service: StorageService,
    pub dir: TempDir,
    chunks: AtomicUsize,
}

impl TestStore {
    pub async fn new() -> Self {
        Self::with_page_size(100).await
    }

    pub async fn with_page_size(page_size: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::local(dir.path().join("blobs"), "sqlite::memory:");
        config.list_page_size = page_size;
        let service = StorageService::from_config(&config).await.unwrap();
        TestStore {
            service,
            dir,
            chunks: AtomicUsize::new(0),
        }
    }

    /// Write `bytes` to a fresh scratch file.
    pub fn chunk(&self, bytes: &[u8]) -> PathBuf {
        let n = self.chunks.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("chunk-{n}"));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub async fn put(&self, parent: &str, name: &str, bytes: &[u8]) -> FileEntry {
        let chunk = self.chunk(bytes);
        self.service
            .upload_file(parent, name, &chunk, 0, true, OWNER)
            .await
            .unwrap()
            .expect("single chunk upload completes")
    }

    pub async fn mkdir(&self, parent: &str, name: &str) -> i64 {
        self.service.create_folder(parent, name, OWNER).await.unwrap()
    }

    pub async fn read(&self, path: &str) -> Vec<u8> {
        self.read_version(path, None).await
    }

    pub async fn read_version(&self, path: &str, version: Option<i64>) -> Vec<u8> {
        match self
            .service
            .download(path, version, DownloadKind::Local)
            .await
            .unwrap()
        {
            DownloadDescriptor::Local { file, .. } => std::fs::read(&file).unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    pub async fn names(&self, path: &str) -> Vec<String> {
        self.service
            .list(path, Default::default())
            .await
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }
}

pub async fn collect(descriptor: DownloadDescriptor) -> Vec<u8> {
    match descriptor {
        DownloadDescriptor::Stream { stream, .. } => {
            let parts: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
            parts.concat()
        }
        DownloadDescriptor::Local { file, .. } => std::fs::read(&file).unwrap(),
        other => panic!("unexpected {other:?}"),
    }
}
