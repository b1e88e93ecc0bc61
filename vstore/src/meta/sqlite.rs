use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::domain::{
    FileEntry, FolderEntry, FolderProperties, FsEntry, ListQuery, SortKey, extension_of,
};
use crate::error::StoreError;
use crate::meta::row::{EntryRow, columns, into_entries};
use crate::meta::{MetadataStore, NewFile, Supersede};
use crate::storage::{BackstoreData, BlobLocation};
use crate::utils::path::{descendant_prefix, join};

type Result<T> = std::result::Result<T, StoreError>;

/// Predicate selecting rows visible through the normal namespace.
const LIVE: &str = "deleted_on IS NULL AND versioned_on IS NULL AND sidecar_tag IS NULL";

#[derive(Debug)]
pub struct SqliteMetadataStore {
    pool: Arc<SqlitePool>,
}

enum CursorKey {
    Name(String),
    Updated(DateTime<Utc>),
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn on_conflict(path: &str) -> impl FnOnce(StoreError) -> StoreError + '_ {
    move |err| match err {
        StoreError::Conflict(_) => StoreError::Conflict(path.to_string()),
        other => other,
    }
}

impl SqliteMetadataStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        // every connection to `:memory:` is a separate database
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let mut pool_options =
            SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { max_connections });
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }

    async fn fetch_row(conn: &mut SqliteConnection, id: i64, live: bool) -> Result<Option<EntryRow>> {
        let filter = if live { LIVE } else { "deleted_on IS NULL" };
        let sql = format!("SELECT {} FROM fs_entries WHERE id = ? AND {filter}", columns(None));
        Ok(sqlx::query_as::<_, EntryRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Path of the live folder `parent_id`; `None` is the root.
    async fn folder_path(conn: &mut SqliteConnection, parent_id: Option<i64>) -> Result<String> {
        let Some(id) = parent_id else {
            return Ok("/".to_string());
        };
        let sql = format!(
            "SELECT path FROM fs_entries WHERE id = ? AND entry_type = 'folder' AND {LIVE}"
        );
        sqlx::query_scalar::<_, String>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("folder {id}")))
    }

    async fn insert_row(conn: &mut SqliteConnection, row: &EntryRow) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO fs_entries (parent_id, path, name, entry_type, extension, size_bytes, owner, \
             storage_zone_id, backstore_file_id, storage_path, backstore_data, is_complete, \
             versioned_on, sidecar_tag, main_entry_id, created_on, updated_on, deleted_on) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.parent_id)
        .bind(&row.path)
        .bind(&row.name)
        .bind(&row.entry_type)
        .bind(&row.extension)
        .bind(row.size_bytes)
        .bind(&row.owner)
        .bind(row.storage_zone_id)
        .bind(&row.backstore_file_id)
        .bind(&row.storage_path)
        .bind(&row.backstore_data)
        .bind(row.is_complete)
        .bind(row.versioned_on)
        .bind(&row.sidecar_tag)
        .bind(row.main_entry_id)
        .bind(row.created_on)
        .bind(row.updated_on)
        .bind(row.deleted_on)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn archive_row(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE fs_entries SET versioned_on = ? \
             WHERE id = ? AND entry_type = 'file' AND is_complete = 1 AND {LIVE}"
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_file(conn: &mut SqliteConnection, file: NewFile) -> Result<i64> {
        let parent_path = Self::folder_path(conn, file.parent_id).await?;
        let path = join(&parent_path, &file.name);
        let now = Utc::now();
        let (sidecar_tag, main_entry_id) = match file.sidecar {
            Some(link) => (Some(link.tag), Some(link.main_entry_id)),
            None => (None, None),
        };
        let row = EntryRow {
            id: 0,
            parent_id: file.parent_id,
            path: path.clone(),
            name: file.name,
            entry_type: "file".to_string(),
            extension: file.extension,
            size_bytes: to_i64(file.size),
            owner: file.owner,
            storage_zone_id: Some(file.location.zone_id),
            backstore_file_id: Some(file.location.file_id),
            storage_path: Some(file.location.storage_path),
            backstore_data: file.backstore_data.to_json(),
            is_complete: file.complete,
            versioned_on: None,
            sidecar_tag,
            main_entry_id,
            created_on: now,
            updated_on: now,
            deleted_on: None,
        };
        Self::insert_row(conn, &row).await.map_err(on_conflict(&path))
    }

    async fn cursor_key(&self, cursor: &str, sort: SortKey) -> Result<CursorKey> {
        let sql = format!("SELECT name, updated_on FROM fs_entries WHERE path = ? AND {LIVE} LIMIT 1");
        let (name, updated_on) = sqlx::query_as::<_, (String, DateTime<Utc>)>(&sql)
            .bind(cursor)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("cursor {cursor}")))?;
        Ok(match sort {
            SortKey::Name => CursorKey::Name(name),
            SortKey::UpdatedOn => CursorKey::Updated(updated_on),
        })
    }

    fn list_query(folder_id: Option<i64>, path: &str, query: &ListQuery) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM fs_entries WHERE {LIVE}",
            columns(None)
        ));
        if query.recursive {
            let prefix = descendant_prefix(path);
            qb.push(" AND substr(path, 1, ")
                .push_bind(prefix.chars().count() as i64)
                .push(") = ")
                .push_bind(prefix);
        } else {
            match folder_id {
                Some(id) => {
                    qb.push(" AND parent_id = ").push_bind(id);
                }
                None => {
                    qb.push(" AND parent_id IS NULL");
                }
            }
        }
        if !query.include_incomplete {
            qb.push(" AND (entry_type = 'folder' OR is_complete = 1)");
        }
        if query.ignore_folders {
            qb.push(" AND entry_type = 'file'");
        }
        if let Some(ids) = &query.id_filter {
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(*id);
            }
            sep.push_unseparated(")");
        }
        if !query.ext_whitelist.is_empty() {
            qb.push(" AND (entry_type = 'folder' OR extension IN (");
            let mut sep = qb.separated(", ");
            for ext in &query.ext_whitelist {
                sep.push_bind(ext.clone());
            }
            sep.push_unseparated("))");
        }
        if !query.ext_blacklist.is_empty() {
            qb.push(" AND (entry_type = 'folder' OR extension IS NULL OR extension NOT IN (");
            let mut sep = qb.separated(", ");
            for ext in &query.ext_blacklist {
                sep.push_bind(ext.clone());
            }
            sep.push_unseparated("))");
        }
        qb
    }

    /// Append the cursor bound, ordering and limit. `after` selects the side
    /// of the cursor; results always come back nearest-first.
    fn push_page(
        qb: &mut QueryBuilder<'static, Sqlite>,
        query: &ListQuery,
        cursor: Option<(&CursorKey, &str)>,
        after: bool,
        limit: u32,
    ) {
        let column = query.sort.column();
        let ascending = after != query.desc;
        let (op, dir) = if ascending { (">", "ASC") } else { ("<", "DESC") };
        if let Some((key, path)) = cursor {
            qb.push(format!(" AND ({column}, path) {op} ("));
            match key {
                CursorKey::Name(name) => qb.push_bind(name.clone()),
                CursorKey::Updated(ts) => qb.push_bind(*ts),
            };
            qb.push(", ").push_bind(path.to_string()).push(")");
        }
        qb.push(format!(" ORDER BY {column} {dir}, path {dir} LIMIT "))
            .push_bind(i64::from(limit));
    }

    async fn select_affected(
        conn: &mut SqliteConnection,
        row: &EntryRow,
        force: bool,
    ) -> Result<Vec<EntryRow>> {
        let state = if force { "" } else { " AND deleted_on IS NULL" };
        let rows = if row.is_folder() {
            let prefix = descendant_prefix(&row.path);
            let sql = format!(
                "SELECT {} FROM fs_entries WHERE (id = ? OR substr(path, 1, ?) = ?){state}",
                columns(None)
            );
            sqlx::query_as::<_, EntryRow>(&sql)
                .bind(row.id)
                .bind(prefix.chars().count() as i64)
                .bind(prefix)
                .fetch_all(&mut *conn)
                .await?
        } else if row.versioned_on.is_none() && row.sidecar_tag.is_none() {
            // a live main file takes its archived versions and their sidecars along
            let sql = format!(
                "SELECT {} FROM fs_entries WHERE (id = ? OR main_entry_id = ? \
                 OR id IN ({history}) OR main_entry_id IN ({history})){state}",
                columns(None),
                history = "SELECT id FROM fs_entries WHERE entry_type = 'file' \
                     AND versioned_on IS NOT NULL AND sidecar_tag IS NULL \
                     AND parent_id IS ? AND name = ? AND path = ?",
            );
            sqlx::query_as::<_, EntryRow>(&sql)
                .bind(row.id)
                .bind(row.id)
                .bind(row.parent_id)
                .bind(&row.name)
                .bind(&row.path)
                .bind(row.parent_id)
                .bind(&row.name)
                .bind(&row.path)
                .fetch_all(&mut *conn)
                .await?
        } else {
            let sql = format!(
                "SELECT {} FROM fs_entries WHERE (id = ? OR main_entry_id = ?){state}",
                columns(None)
            );
            sqlx::query_as::<_, EntryRow>(&sql)
                .bind(row.id)
                .bind(row.id)
                .fetch_all(&mut *conn)
                .await?
        };
        Ok(rows)
    }

    /// Soft-delete (or with `force` remove) `rows` in id batches.
    async fn remove_rows(conn: &mut SqliteConnection, rows: &[EntryRow], force: bool) -> Result<()> {
        let now = Utc::now();
        for ids in rows.chunks(500) {
            let mut qb: QueryBuilder<Sqlite> = if force {
                QueryBuilder::new("DELETE FROM fs_entries WHERE id IN (")
            } else {
                let mut qb = QueryBuilder::new("UPDATE fs_entries SET deleted_on = ");
                qb.push_bind(now).push(" WHERE id IN (");
                qb
            };
            let mut sep = qb.separated(", ");
            for r in ids {
                sep.push_bind(r.id);
            }
            sep.push_unseparated(")");
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn resolve(&self, path: &str) -> Result<Option<FsEntry>> {
        if path == "/" {
            return Ok(Some(FsEntry::Folder(FolderEntry::root())));
        }
        let sql = format!("SELECT {} FROM fs_entries WHERE path = ? AND {LIVE} LIMIT 1", columns(None));
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(path)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(FsEntry::try_from)
            .transpose()
    }

    async fn get(&self, id: i64) -> Result<Option<FsEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_row(&mut conn, id, false)
            .await?
            .map(FsEntry::try_from)
            .transpose()
    }

    async fn list(
        &self,
        folder_id: Option<i64>,
        path: &str,
        query: &ListQuery,
    ) -> Result<Vec<FsEntry>> {
        if query.id_filter.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }
        let cursor = match &query.cursor {
            Some(c) => Some((self.cursor_key(c, query.sort).await?, c.as_str())),
            None => None,
        };
        let cursor_ref = cursor.as_ref().map(|(k, p)| (k, *p));

        let mut rows = Vec::new();
        if cursor_ref.is_some() && query.limit_before > 0 {
            let mut qb = Self::list_query(folder_id, path, query);
            Self::push_page(&mut qb, query, cursor_ref, false, query.limit_before);
            let mut before = qb
                .build_query_as::<EntryRow>()
                .fetch_all(self.pool.as_ref())
                .await?;
            before.reverse();
            rows.extend(before);
        }
        if query.limit_after > 0 {
            let mut qb = Self::list_query(folder_id, path, query);
            Self::push_page(&mut qb, query, cursor_ref, true, query.limit_after);
            rows.extend(
                qb.build_query_as::<EntryRow>()
                    .fetch_all(self.pool.as_ref())
                    .await?,
            );
        }
        into_entries(rows)
    }

    async fn create_folder(&self, parent_id: Option<i64>, name: &str, owner: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let parent_path = Self::folder_path(&mut tx, parent_id).await?;
        let path = join(&parent_path, name);
        let now = Utc::now();
        let row = EntryRow {
            id: 0,
            parent_id,
            path: path.clone(),
            name: name.to_string(),
            entry_type: "folder".to_string(),
            extension: None,
            size_bytes: 0,
            owner: owner.to_string(),
            storage_zone_id: None,
            backstore_file_id: None,
            storage_path: None,
            backstore_data: None,
            is_complete: true,
            versioned_on: None,
            sidecar_tag: None,
            main_entry_id: None,
            created_on: now,
            updated_on: now,
            deleted_on: None,
        };
        let id = Self::insert_row(&mut tx, &row).await.map_err(on_conflict(&path))?;
        tx.commit().await?;
        Ok(id)
    }

    async fn create_file(&self, file: NewFile) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = Self::insert_file(&mut tx, file).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn replace_file(&self, old: Supersede, file: NewFile) -> Result<(i64, Vec<FsEntry>)> {
        let mut tx = self.pool.begin().await?;
        let removed = match old {
            Supersede::Archive(id) => {
                if !Self::archive_row(&mut tx, id).await? {
                    return Err(StoreError::NotFound(format!("live complete file {id}")));
                }
                Vec::new()
            }
            Supersede::Remove(id) => {
                let sql = format!(
                    "SELECT {} FROM fs_entries WHERE (id = ? OR main_entry_id = ?) AND entry_type = 'file'",
                    columns(None)
                );
                let rows = sqlx::query_as::<_, EntryRow>(&sql)
                    .bind(id)
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?;
                if !rows.iter().any(|r| r.id == id) {
                    return Err(StoreError::NotFound(format!("entry {id}")));
                }
                Self::remove_rows(&mut tx, &rows, true).await?;
                rows
            }
        };
        let id = Self::insert_file(&mut tx, file).await?;
        tx.commit().await?;
        Ok((id, into_entries(removed)?))
    }

    async fn update_file_progress(
        &self,
        parent_id: Option<i64>,
        name: &str,
        complete: bool,
        size: u64,
        backstore_data: &BackstoreData,
    ) -> Result<i64> {
        let sql = format!(
            "UPDATE fs_entries SET is_complete = ?, size_bytes = ?, backstore_data = ?, updated_on = ? \
             WHERE parent_id IS ? AND name = ? AND entry_type = 'file' AND is_complete = 0 AND {LIVE} \
             RETURNING id"
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(complete)
            .bind(to_i64(size))
            .bind(backstore_data.to_json())
            .bind(Utc::now())
            .bind(parent_id)
            .bind(name)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("in-progress upload `{name}`")))
    }

    async fn create_version(&self, file: &FileEntry) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::archive_row(&mut conn, file.meta.id).await
    }

    async fn move_entry(
        &self,
        entry_id: i64,
        new_parent_id: Option<i64>,
        new_name: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = Self::fetch_row(&mut tx, entry_id, true)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("entry {entry_id}")))?;
        let parent_path = Self::folder_path(&mut tx, new_parent_id).await?;
        let new_path = join(&parent_path, new_name);
        let extension = if row.is_folder() { None } else { extension_of(new_name) };
        let now = Utc::now();

        sqlx::query(
            "UPDATE fs_entries SET parent_id = ?, name = ?, path = ?, extension = ?, updated_on = ? WHERE id = ?",
        )
        .bind(new_parent_id)
        .bind(new_name)
        .bind(&new_path)
        .bind(&extension)
        .bind(now)
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .map_err(on_conflict(&new_path))?;

        if row.is_folder() {
            let old_prefix = descendant_prefix(&row.path);
            let new_prefix = descendant_prefix(&new_path);
            let old_len = old_prefix.chars().count() as i64;
            let moved = sqlx::query(
                "UPDATE fs_entries SET path = ? || substr(path, ?) WHERE substr(path, 1, ?) = ?",
            )
            .bind(&new_prefix)
            .bind(old_len + 1)
            .bind(old_len)
            .bind(&old_prefix)
            .execute(&mut *tx)
            .await?;
            tracing::debug!(
                "rewrote {} descendant paths {} -> {}",
                moved.rows_affected(),
                old_prefix,
                new_prefix
            );
        } else {
            // historical versions follow the live file
            sqlx::query(
                "UPDATE fs_entries SET parent_id = ?, name = ?, path = ?, extension = ? \
                 WHERE parent_id IS ? AND name = ? AND entry_type = 'file' \
                 AND versioned_on IS NOT NULL AND sidecar_tag IS NULL AND deleted_on IS NULL",
            )
            .bind(new_parent_id)
            .bind(new_name)
            .bind(&new_path)
            .bind(&extension)
            .bind(row.parent_id)
            .bind(&row.name)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE fs_entries SET parent_id = ?, name = ?, path = ? \
                 WHERE sidecar_tag IS NOT NULL AND deleted_on IS NULL AND main_entry_id IN \
                 (SELECT id FROM fs_entries WHERE parent_id IS ? AND name = ? \
                  AND entry_type = 'file' AND sidecar_tag IS NULL AND deleted_on IS NULL)",
            )
            .bind(new_parent_id)
            .bind(new_name)
            .bind(&new_path)
            .bind(new_parent_id)
            .bind(new_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn copy_entry(
        &self,
        entry_id: i64,
        new_parent_id: Option<i64>,
        new_name: &str,
        new_blob: Option<(&BlobLocation, &BackstoreData)>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let source = Self::fetch_row(&mut tx, entry_id, true)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("entry {entry_id}")))?;
        let parent_path = Self::folder_path(&mut tx, new_parent_id).await?;
        let path = join(&parent_path, new_name);
        let now = Utc::now();

        let mut row = source.clone();
        row.parent_id = new_parent_id;
        row.name = new_name.to_string();
        row.path = path.clone();
        if !row.is_folder() {
            row.extension = extension_of(new_name);
        }
        row.versioned_on = None;
        row.deleted_on = None;
        row.created_on = now;
        row.updated_on = now;
        if let Some((location, data)) = new_blob {
            row.storage_zone_id = Some(location.zone_id);
            row.backstore_file_id = Some(location.file_id.clone());
            row.storage_path = Some(location.storage_path.clone());
            row.backstore_data = data.to_json();
        }

        let id = Self::insert_row(&mut tx, &row).await.map_err(on_conflict(&path))?;
        tx.commit().await?;
        Ok(id)
    }

    async fn delete_entry(&self, entry_id: i64, force: bool) -> Result<Vec<FsEntry>> {
        let mut tx = self.pool.begin().await?;
        let row = Self::fetch_row(&mut tx, entry_id, false)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("entry {entry_id}")))?;
        let affected = Self::select_affected(&mut tx, &row, force).await?;
        Self::remove_rows(&mut tx, &affected, force).await?;
        tx.commit().await?;
        tracing::debug!(
            "{} {} rows under entry {}",
            if force { "removed" } else { "soft-deleted" },
            affected.len(),
            entry_id
        );
        into_entries(affected)
    }

    async fn calculate_folder_sizes(&self, folder_id: Option<i64>) -> Result<FolderProperties> {
        let mut conn = self.pool.acquire().await?;
        let path = Self::folder_path(&mut conn, folder_id).await?;
        let prefix = descendant_prefix(&path);
        let sql = format!(
            "SELECT \
               COALESCE(SUM(CASE WHEN entry_type = 'file' THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN entry_type = 'folder' THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN entry_type = 'file' THEN size_bytes ELSE 0 END), 0) \
             FROM fs_entries WHERE {LIVE} AND (entry_type = 'folder' OR is_complete = 1) \
             AND substr(path, 1, ?) = ?"
        );
        let (files, folders, size) = sqlx::query_as::<_, (i64, i64, i64)>(&sql)
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_one(&mut *conn)
            .await?;
        Ok(FolderProperties {
            file_count: files.max(0) as u64,
            folder_count: folders.max(0) as u64,
            total_size: size.max(0) as u64,
        })
    }

    async fn get_versions(
        &self,
        parent_id: Option<i64>,
        parent_path: &str,
        name: &str,
    ) -> Result<Vec<FsEntry>> {
        let sql = format!(
            "SELECT {} FROM fs_entries \
             WHERE parent_id IS ? AND name = ? AND path = ? AND entry_type = 'file' \
             AND versioned_on IS NOT NULL AND sidecar_tag IS NULL AND deleted_on IS NULL \
             ORDER BY versioned_on DESC, id DESC",
            columns(None)
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(parent_id)
            .bind(name)
            .bind(join(parent_path, name))
            .fetch_all(self.pool.as_ref())
            .await?;
        into_entries(rows)
    }

    async fn resolve_sidecar(&self, path: &str, tag: &str) -> Result<Option<FsEntry>> {
        let sql = format!(
            "SELECT {} FROM fs_entries s JOIN fs_entries m ON s.main_entry_id = m.id \
             WHERE m.path = ? AND m.deleted_on IS NULL AND m.versioned_on IS NULL \
             AND m.sidecar_tag IS NULL AND s.sidecar_tag = ? AND s.deleted_on IS NULL LIMIT 1",
            columns(Some("s"))
        );
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(path)
            .bind(tag)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(FsEntry::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::SidecarLink;

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn new_file(parent_id: Option<i64>, name: &str, complete: bool, size: u64) -> NewFile {
        NewFile {
            parent_id,
            name: name.to_string(),
            owner: "alice".to_string(),
            complete,
            size,
            location: BlobLocation::generate(1),
            backstore_data: BackstoreData::empty(),
            extension: extension_of(name),
            sidecar: None,
        }
    }

    fn names(entries: &[FsEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        let id = store.create_file(new_file(Some(docs), "a.TXT", true, 3)).await.unwrap();

        match store.resolve("/docs/a.TXT").await.unwrap().unwrap() {
            FsEntry::File(f) => {
                assert_eq!(f.meta.id, id);
                assert_eq!(f.meta.parent_id, Some(docs));
                assert_eq!(f.extension.as_deref(), Some("txt"));
                assert_eq!(f.size, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.exists("/docs").await.unwrap());
        assert!(store.exists("/").await.unwrap());
        assert!(!store.exists("/nope").await.unwrap());

        let err = store.create_folder(None, "docs", "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(p) if p == "/docs"));
        let err = store.create_folder(Some(id), "x", "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_progress_and_versions() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        store.create_file(new_file(Some(docs), "a.txt", false, 4)).await.unwrap();
        // hidden while in progress
        assert!(store.list(Some(docs), "/docs", &ListQuery::children_page(None, 10)).await.unwrap().len() == 1);
        let visible = ListQuery { limit_after: 10, ..Default::default() };
        assert!(store.list(Some(docs), "/docs", &visible).await.unwrap().is_empty());

        let data = BackstoreData::from_json(Some(r#"{"size":8}"#)).unwrap();
        store
            .update_file_progress(Some(docs), "a.txt", true, 8, &data)
            .await
            .unwrap();
        let err = store
            .update_file_progress(Some(docs), "a.txt", true, 9, &data)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let live = store.resolve("/docs/a.txt").await.unwrap().unwrap().into_file().unwrap();
        assert_eq!(live.size, 8);
        assert_eq!(live.backstore_data, data);
        assert!(store.create_version(&live).await.unwrap());
        assert!(!store.create_version(&live).await.unwrap());
        assert!(store.resolve("/docs/a.txt").await.unwrap().is_none());

        store.create_file(new_file(Some(docs), "a.txt", true, 1)).await.unwrap();
        let versions = store.get_versions(Some(docs), "/docs", "a.txt").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id(), live.meta.id);
        assert!(store.get(live.meta.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_pagination_and_filters() {
        let store = store().await;
        let root = store.create_folder(None, "r", "alice").await.unwrap();
        for name in ["e.png", "a.txt", "c.PNG", "b.md", "d.txt"] {
            store.create_file(new_file(Some(root), name, true, 1)).await.unwrap();
        }
        store.create_folder(Some(root), "sub", "alice").await.unwrap();

        let page = |cursor: Option<&str>, after: u32, before: u32| ListQuery {
            cursor: cursor.map(str::to_string),
            limit_after: after,
            limit_before: before,
            ..Default::default()
        };
        let first = store.list(Some(root), "/r", &page(None, 2, 0)).await.unwrap();
        assert_eq!(names(&first), vec!["a.txt", "b.md"]);
        let second = store.list(Some(root), "/r", &page(Some("/r/b.md"), 2, 0)).await.unwrap();
        assert_eq!(names(&second), vec!["c.PNG", "d.txt"]);
        let around = store.list(Some(root), "/r", &page(Some("/r/c.PNG"), 1, 2)).await.unwrap();
        assert_eq!(names(&around), vec!["a.txt", "b.md", "d.txt"]);
        let last = store.list(Some(root), "/r", &page(Some("/r/sub"), 5, 0)).await.unwrap();
        assert!(last.is_empty());

        let desc = ListQuery { desc: true, limit_after: 2, ..Default::default() };
        assert_eq!(names(&store.list(Some(root), "/r", &desc).await.unwrap()), vec!["sub", "e.png"]);

        let pngs = ListQuery {
            limit_after: 10,
            ignore_folders: true,
            ext_whitelist: vec!["png".into()],
            ..Default::default()
        };
        assert_eq!(names(&store.list(Some(root), "/r", &pngs).await.unwrap()), vec!["c.PNG", "e.png"]);
        let no_txt = ListQuery {
            limit_after: 10,
            ext_blacklist: vec!["txt".into()],
            ..Default::default()
        };
        assert_eq!(
            names(&store.list(Some(root), "/r", &no_txt).await.unwrap()),
            vec!["b.md", "c.PNG", "e.png", "sub"]
        );

        let err = store.list(Some(root), "/r", &page(Some("/r/zzz"), 1, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_move_folder_rewrites_descendants() {
        let store = store().await;
        let a = store.create_folder(None, "a", "alice").await.unwrap();
        let b = store.create_folder(None, "b", "alice").await.unwrap();
        let sub = store.create_folder(Some(a), "sub", "alice").await.unwrap();
        store.create_file(new_file(Some(sub), "deep.txt", true, 2)).await.unwrap();

        store.move_entry(a, Some(b), "moved").await.unwrap();
        assert!(store.resolve("/a").await.unwrap().is_none());
        assert!(store.exists("/b/moved/sub").await.unwrap());
        let deep = store.resolve("/b/moved/sub/deep.txt").await.unwrap().unwrap();
        assert_eq!(deep.meta().parent_id, Some(sub));

        let recursive = ListQuery { recursive: true, limit_after: 10, ..Default::default() };
        let all = store.list(Some(b), "/b", &recursive).await.unwrap();
        assert_eq!(all.len(), 3);

        let c = store.create_folder(None, "c", "alice").await.unwrap();
        let err = store.move_entry(c, None, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_file_move_carries_versions_and_sidecars() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        let old = store.create_file(new_file(Some(docs), "a.txt", true, 1)).await.unwrap();
        let old_entry = store.get(old).await.unwrap().unwrap().into_file().unwrap();
        store.create_version(&old_entry).await.unwrap();
        let live = store.create_file(new_file(Some(docs), "a.txt", true, 2)).await.unwrap();
        let mut thumb = new_file(Some(docs), "a.txt", true, 1);
        thumb.sidecar = Some(SidecarLink { main_entry_id: live, tag: "THUMB|64x64".into() });
        store.create_file(thumb).await.unwrap();

        store.move_entry(live, Some(docs), "b.txt").await.unwrap();
        assert_eq!(store.get_versions(Some(docs), "/docs", "b.txt").await.unwrap().len(), 1);
        assert!(store.get_versions(Some(docs), "/docs", "a.txt").await.unwrap().is_empty());
        match store.resolve_sidecar("/docs/b.txt", "THUMB|64x64").await.unwrap() {
            Some(FsEntry::Sidecar(s)) => assert_eq!(s.file.meta.path, "/docs/b.txt"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        let sub = store.create_folder(Some(docs), "sub", "alice").await.unwrap();
        let f = store.create_file(new_file(Some(sub), "a.txt", true, 10)).await.unwrap();
        store.create_file(new_file(Some(docs), "b.txt", true, 5)).await.unwrap();

        let loc = BlobLocation::generate(1);
        let data = BackstoreData::from_json(Some(r#"{"size":10}"#)).unwrap();
        let copy = store.copy_entry(f, Some(docs), "c.txt", Some((&loc, &data))).await.unwrap();
        let copied = store.get(copy).await.unwrap().unwrap().into_file().unwrap();
        assert_eq!(copied.meta.path, "/docs/c.txt");
        assert_eq!(copied.backstore_file_id, loc.file_id);
        assert_eq!(copied.size, 10);

        let props = store.calculate_folder_sizes(Some(docs)).await.unwrap();
        assert_eq!(props, FolderProperties { file_count: 3, folder_count: 1, total_size: 25 });

        let removed = store.delete_entry(sub, false).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!store.exists("/docs/sub/a.txt").await.unwrap());
        // the slot is free again after a soft delete
        store.create_folder(Some(docs), "sub", "alice").await.unwrap();

        let removed = store.delete_entry(docs, true).await.unwrap();
        assert_eq!(removed.len(), 6);
        assert!(store.get(f).await.unwrap().is_none());
        assert_eq!(
            store.calculate_folder_sizes(None).await.unwrap(),
            FolderProperties::default()
        );
    }

    #[tokio::test]
    async fn test_replace_file_is_atomic() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        let v1 = store.create_file(new_file(Some(docs), "a.txt", true, 1)).await.unwrap();

        let (v2, removed) = store
            .replace_file(Supersede::Archive(v1), new_file(Some(docs), "a.txt", true, 2))
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.resolve("/docs/a.txt").await.unwrap().unwrap().id(), v2);
        let versions = store.get_versions(Some(docs), "/docs", "a.txt").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id(), v1);

        // archiving a row that is no longer live leaves everything untouched
        let err = store
            .replace_file(Supersede::Archive(v1), new_file(Some(docs), "a.txt", true, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.resolve("/docs/a.txt").await.unwrap().unwrap().id(), v2);

        let partial = store.create_file(new_file(Some(docs), "b.bin", false, 4)).await.unwrap();
        let (fresh, removed) = store
            .replace_file(Supersede::Remove(partial), new_file(Some(docs), "b.bin", true, 5))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get(partial).await.unwrap().is_none());
        assert_eq!(store.resolve("/docs/b.bin").await.unwrap().unwrap().id(), fresh);
    }

    #[tokio::test]
    async fn test_delete_file_takes_its_versions() {
        let store = store().await;
        let docs = store.create_folder(None, "docs", "alice").await.unwrap();
        let v1 = store.create_file(new_file(Some(docs), "a.txt", true, 1)).await.unwrap();
        let mut thumb = new_file(Some(docs), "a.txt", true, 1);
        thumb.sidecar = Some(SidecarLink { main_entry_id: v1, tag: "THUMB".into() });
        let old_thumb = store.create_file(thumb).await.unwrap();
        let (v2, _) = store
            .replace_file(Supersede::Archive(v1), new_file(Some(docs), "a.txt", true, 2))
            .await
            .unwrap();
        store.create_file(new_file(Some(docs), "other.txt", true, 1)).await.unwrap();

        let removed = store.delete_entry(v2, false).await.unwrap();
        let mut ids: Vec<i64> = removed.iter().map(|e| e.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![v1, old_thumb, v2]);
        assert!(store.get(v1).await.unwrap().is_none());

        store.create_file(new_file(Some(docs), "a.txt", true, 3)).await.unwrap();
        assert!(store.get_versions(Some(docs), "/docs", "a.txt").await.unwrap().is_empty());
        assert!(store.exists("/docs/other.txt").await.unwrap());
    }
}
