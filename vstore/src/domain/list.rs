use std::str::FromStr;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    UpdatedOn,
}

impl SortKey {
    pub fn column(self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::UpdatedOn => "updated_on",
        }
    }
}

impl FromStr for SortKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(SortKey::Name),
            "updated_on" => Ok(SortKey::UpdatedOn),
            other => Err(StorageError::service(format!("invalid sort key `{other}`"))),
        }
    }
}

/// Caller-facing listing options. `sort_by` is validated into a [`SortKey`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub cursor: Option<String>,
    pub recursive: bool,
    pub id_filter: Option<Vec<i64>>,
    pub sort_by: String,
    pub desc: bool,
    pub limit_before: Option<u32>,
    pub limit_after: Option<u32>,
    pub ignore_folders: bool,
    pub ext_whitelist: Vec<String>,
    pub ext_blacklist: Vec<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            cursor: None,
            recursive: false,
            id_filter: None,
            sort_by: "name".to_string(),
            desc: false,
            limit_before: None,
            limit_after: None,
            ignore_folders: false,
            ext_whitelist: Vec::new(),
            ext_blacklist: Vec::new(),
        }
    }
}

impl ListOptions {
    pub fn into_query(self, default_page: u32) -> Result<ListQuery, StorageError> {
        let sort = self.sort_by.parse::<SortKey>()?;
        Ok(ListQuery {
            cursor: self.cursor,
            recursive: self.recursive,
            id_filter: self.id_filter,
            sort,
            desc: self.desc,
            limit_before: self.limit_before.unwrap_or(0),
            limit_after: self.limit_after.unwrap_or(default_page),
            ignore_folders: self.ignore_folders,
            ext_whitelist: lowercase(self.ext_whitelist),
            ext_blacklist: lowercase(self.ext_blacklist),
            include_incomplete: false,
        })
    }
}

/// Validated listing query handed to the metadata store.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub recursive: bool,
    pub id_filter: Option<Vec<i64>>,
    pub sort: SortKey,
    pub desc: bool,
    pub limit_before: u32,
    pub limit_after: u32,
    pub ignore_folders: bool,
    pub ext_whitelist: Vec<String>,
    pub ext_blacklist: Vec<String>,
    /// In-progress uploads are normally hidden.
    pub include_incomplete: bool,
}

impl ListQuery {
    /// One page of direct children in name order, used for tree walks.
    pub fn children_page(cursor: Option<String>, page_size: u32) -> Self {
        ListQuery {
            cursor,
            limit_after: page_size,
            include_incomplete: true,
            ..Default::default()
        }
    }
}

fn lowercase(exts: Vec<String>) -> Vec<String> {
    exts.into_iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect()
}
