use std::path::{Path, PathBuf};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_COPY_CONCURRENCY: usize = 4;

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub default_zone: i64,
    pub zones: Vec<ZoneConfig>,
    pub list_page_size: u32,
    pub copy_concurrency: usize,
    pub temp_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ZoneConfig {
    pub id: i64,
    pub driver: ZoneDriver,
}

#[derive(Clone, Debug)]
pub enum ZoneDriver {
    Filesystem {
        root: PathBuf,
        public_base_url: Option<String>,
    },
    S3(S3Settings),
}

#[derive(Clone, Debug)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub presign_ttl_secs: u64,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
}

impl S3Settings {
    pub fn new(bucket: impl Into<String>) -> Self {
        S3Settings {
            bucket: bucket.into(),
            endpoint: None,
            region: "us-east-1".to_string(),
            presign_ttl_secs: 900,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

impl StorageConfig {
    /// Single filesystem zone (id 1) rooted at `root`.
    pub fn local(root: impl AsRef<Path>, database_url: impl Into<String>) -> Self {
        let root = root.as_ref().to_path_buf();
        StorageConfig {
            database_url: database_url.into(),
            max_connections: 12,
            default_zone: 1,
            zones: vec![ZoneConfig {
                id: 1,
                driver: ZoneDriver::Filesystem {
                    root: root.clone(),
                    public_base_url: None,
                },
            }],
            list_page_size: DEFAULT_PAGE_SIZE,
            copy_concurrency: DEFAULT_COPY_CONCURRENCY,
            temp_dir: root.join("tmp"),
        }
    }
}
