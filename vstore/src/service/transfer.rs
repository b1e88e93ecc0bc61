use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;

use super::storage::{Result, StorageService};
use crate::domain::{FileEntry, FolderEntry, FsEntry, ListQuery};
use crate::error::StorageError;
use crate::storage::BlobLocation;
use crate::utils::path::{is_within, join, normalize, split};

enum MoveJob {
    /// Put `entry` at `dst`, merging into an existing entry when allowed.
    Relocate { entry: FsEntry, dst: String },
    /// Move what is left in a merged source folder, then remove the folder.
    Drain { folder: FolderEntry, dst: String },
}

struct CopyJob {
    src: FolderEntry,
    dst_id: i64,
    dst_path: String,
}

impl StorageService {
    pub async fn move_entry(&self, src: &str, dst: &str, merge: bool) -> Result<()> {
        self.move_with(src, dst, merge, &CancellationToken::new()).await
    }

    /// Move `src` to `dst`. With `merge`, an existing destination of the same
    /// kind is merged into instead of rejected. `cancel` is checked between
    /// worklist items.
    pub async fn move_with(
        &self,
        src: &str,
        dst: &str,
        merge: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (src, dst) = transfer_paths(src, dst, "moved")?;
        let _guard = self.locks.acquire([src.clone(), dst.clone()]).await;
        let entry = self.resolve_entry(&src).await?;

        let mut work = vec![MoveJob::Relocate {
            entry,
            dst: dst.clone(),
        }];
        while let Some(job) = work.pop() {
            if cancel.is_cancelled() {
                tracing::info!("move {} -> {} cancelled", src, dst);
                return Err(StorageError::Cancelled);
            }
            match job {
                MoveJob::Relocate { entry, dst } => {
                    self.relocate(entry, dst, merge, &mut work).await?
                }
                MoveJob::Drain { folder, dst } => self.drain(folder, dst, &mut work).await?,
            }
        }
        tracing::info!("moved {} -> {}", src, dst);
        Ok(())
    }

    async fn relocate(
        &self,
        entry: FsEntry,
        dst: String,
        merge: bool,
        work: &mut Vec<MoveJob>,
    ) -> Result<()> {
        let (parent_path, name) = split(&dst)?;
        let parent = self.resolve_folder(&parent_path).await?;
        let existing = self.meta.resolve(&dst).await?;
        match (entry, existing) {
            (entry, None) => {
                self.meta
                    .move_entry(entry.id(), parent.child_parent_id(), &name)
                    .await?;
                tracing::debug!("moved {} -> {}", entry.path(), dst);
            }
            (_, Some(_)) if !merge => return Err(StorageError::DestinyPathAlreadyExists(dst)),
            (FsEntry::File(file), Some(FsEntry::File(old))) => {
                self.meta.delete_entry(old.meta.id, false).await?;
                self.meta
                    .move_entry(file.meta.id, parent.child_parent_id(), &name)
                    .await?;
                tracing::debug!("replaced {} with {}", dst, file.meta.path);
            }
            (FsEntry::Folder(folder), Some(FsEntry::Folder(_))) => {
                work.push(MoveJob::Drain { folder, dst });
            }
            (entry, Some(other)) => {
                return Err(StorageError::service(format!(
                    "cannot merge {:?} {} into {:?} {}",
                    entry.kind(),
                    entry.path(),
                    other.kind(),
                    other.path()
                )));
            }
        }
        Ok(())
    }

    async fn drain(&self, folder: FolderEntry, dst: String, work: &mut Vec<MoveJob>) -> Result<()> {
        // moved children leave the folder, so the first page is always the next one
        let query = ListQuery::children_page(None, self.page_size);
        let page = self
            .meta
            .list(Some(folder.meta.id), &folder.meta.path, &query)
            .await?;
        if page.is_empty() {
            let removed = self.meta.delete_entry(folder.meta.id, true).await?;
            self.purge_blobs(&removed).await;
            tracing::debug!("merged {} into {}", folder.meta.path, dst);
            return Ok(());
        }
        let children: Vec<MoveJob> = page
            .into_iter()
            .rev()
            .map(|child| MoveJob::Relocate {
                dst: join(&dst, child.name()),
                entry: child,
            })
            .collect();
        work.push(MoveJob::Drain { folder, dst });
        work.extend(children);
        Ok(())
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_with(src, dst, &CancellationToken::new()).await
    }

    /// Recursively copy `src` to the free path `dst`. Blobs are duplicated
    /// within the source zone. A failure or cancellation leaves the part of
    /// the tree copied so far in place.
    pub async fn copy_with(&self, src: &str, dst: &str, cancel: &CancellationToken) -> Result<()> {
        let (src, dst) = transfer_paths(src, dst, "copied")?;
        let _guard = self.locks.acquire([src.clone(), dst.clone()]).await;
        let entry = self.resolve_entry(&src).await?;
        let (parent_path, name) = split(&dst)?;
        let parent = self.resolve_folder(&parent_path).await?;
        if self.meta.exists(&dst).await? {
            return Err(StorageError::DestinyPathAlreadyExists(dst));
        }

        match entry {
            FsEntry::File(file) => {
                if !file.is_complete() {
                    return Err(StorageError::service(format!(
                        "cannot copy {}: upload still in progress",
                        file.meta.path
                    )));
                }
                self.copy_file(&file, parent.child_parent_id(), &name).await?;
            }
            FsEntry::Folder(folder) => {
                let dst_id = self
                    .meta
                    .copy_entry(folder.meta.id, parent.child_parent_id(), &name, None)
                    .await?;
                let mut work = vec![CopyJob {
                    src: folder,
                    dst_id,
                    dst_path: dst.clone(),
                }];
                while let Some(job) = work.pop() {
                    self.copy_children(job, &mut work, cancel).await?;
                }
            }
            FsEntry::Sidecar(_) => return Err(StorageError::NotAFile(src)),
        }
        tracing::info!("copied {} -> {}", src, dst);
        Ok(())
    }

    async fn copy_children(
        &self,
        job: CopyJob,
        work: &mut Vec<CopyJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cursor = None;
        loop {
            if cancel.is_cancelled() {
                tracing::info!("copy into {} cancelled", job.dst_path);
                return Err(StorageError::Cancelled);
            }
            let query = ListQuery::children_page(cursor.take(), self.page_size);
            let page = self
                .meta
                .list(Some(job.src.meta.id), &job.src.meta.path, &query)
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            cursor = Some(last.path().to_string());

            let mut files = Vec::new();
            for child in page {
                match child {
                    FsEntry::Folder(sub) => {
                        let dst_id = self
                            .meta
                            .copy_entry(sub.meta.id, Some(job.dst_id), &sub.meta.name, None)
                            .await?;
                        work.push(CopyJob {
                            dst_path: join(&job.dst_path, &sub.meta.name),
                            src: sub,
                            dst_id,
                        });
                    }
                    FsEntry::File(file) if file.is_complete() => files.push(file),
                    FsEntry::File(file) => {
                        tracing::debug!("skipping in-progress upload {}", file.meta.path)
                    }
                    FsEntry::Sidecar(_) => {}
                }
            }

            let parent_id = Some(job.dst_id);
            let results: Vec<Result<i64>> = stream::iter(files)
                .map(|file| async move { self.copy_file(&file, parent_id, &file.meta.name).await })
                .buffer_unordered(self.copy_concurrency)
                .collect()
                .await;
            results.into_iter().collect::<Result<Vec<_>>>()?;
        }
    }

    async fn copy_file(&self, file: &FileEntry, parent_id: Option<i64>, name: &str) -> Result<i64> {
        let backstore = self.backstores.get(file.storage_zone_id)?;
        let dst = BlobLocation::generate(file.storage_zone_id);
        let data = backstore
            .copy_file(&file.location(), &file.backstore_data, &dst)
            .await?;
        match self
            .meta
            .copy_entry(file.meta.id, parent_id, name, Some((&dst, &data)))
            .await
        {
            Ok(id) => {
                tracing::debug!("copied blob {} -> {}", file.backstore_file_id, dst.file_id);
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = backstore.delete_file(&dst, &data).await {
                    tracing::warn!("failed to delete orphaned blob {}: {}", dst.file_id, cleanup);
                }
                Err(e.into())
            }
        }
    }
}

fn transfer_paths(src: &str, dst: &str, verb: &str) -> Result<(String, String)> {
    let src = normalize(src)?;
    let dst = normalize(dst)?;
    if src == "/" || dst == "/" {
        return Err(StorageError::InvalidPath(format!("the root cannot be {verb}")));
    }
    if is_within(&dst, &src) {
        return Err(StorageError::InvalidPath(format!(
            "{src} cannot be {verb} into itself ({dst})"
        )));
    }
    Ok((src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_paths() {
        assert_eq!(
            transfer_paths("/a/", "/b", "moved").unwrap(),
            ("/a".to_string(), "/b".to_string())
        );
        assert!(matches!(
            transfer_paths("/", "/b", "moved"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            transfer_paths("/a", "/a/sub", "moved"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            transfer_paths("/a", "/a", "moved"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(transfer_paths("/a", "/ab", "moved").is_ok());
    }
}
