use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures raised by the metadata store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("an entry named `{0}` already occupies that slot")]
    Conflict(String),

    #[error("corrupt metadata row {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    #[error("sqlx error: {0}")]
    Sqlx(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unique = err
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        if unique {
            return StoreError::Conflict(err.to_string());
        }
        StoreError::Sqlx(err)
    }
}

/// Failures raised by a blob backstore.
#[derive(Error, Debug)]
pub enum BackstoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid resumption state: {0}")]
    InvalidState(String),

    #[error("no backstore registered for storage zone {0}")]
    UnknownZone(i64),

    #[error("the operation is unsupported: {0}")]
    Unsupported(String),

    #[error("s3 {op} failed")]
    S3 {
        op: &'static str,
        #[source]
        source: BoxError,
    },
}

impl BackstoreError {
    pub fn s3(op: &'static str, source: impl Into<BoxError>) -> Self {
        BackstoreError::S3 {
            op,
            source: source.into(),
        }
    }
}

/// Error taxonomy returned by every public [`crate::service::StorageService`] method.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not a folder")]
    NotAFolder(String),

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("destination {0} already exists")]
    DestinyPathAlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage service error: {message}")]
    Service {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    pub fn service(message: impl Into<String>) -> Self {
        StorageError::Service {
            message: message.into(),
            source: None,
        }
    }

    pub fn service_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        StorageError::Service {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => StorageError::NotFound(what),
            StoreError::Conflict(what) => StorageError::DestinyPathAlreadyExists(what),
            other => StorageError::service_with("metadata store failure", other),
        }
    }
}

impl From<BackstoreError> for StorageError {
    fn from(err: BackstoreError) -> Self {
        StorageError::service_with("backstore failure", err)
    }
}

/// Wraps any error as a [`StorageError::Service`] while keeping it as the source.
pub trait MapToStorageError<T> {
    fn map_to_service(self, message: &str) -> Result<T, StorageError>;
}

impl<T, E> MapToStorageError<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn map_to_service(self, message: &str) -> Result<T, StorageError> {
        self.map_err(|e| StorageError::service_with(message, e))
    }
}
