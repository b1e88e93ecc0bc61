//! Backstore drivers
//!
//! - `filesystem`: bytes on a local disk under a zone root
//! - `s3`: S3-compatible object storage (AWS, MinIO, RustFS)
pub mod filesystem;
pub mod s3;
