//! Data-file supply for worker initialization.
//!
//! The worker does not read the database file itself; the lifecycle
//! fetches the bytes through a [`DataSource`] and ships them in the open
//! action. Swapping the source is how tests and embedders avoid touching
//! the filesystem.

use async_trait::async_trait;

use crate::worker::{WorkerError, WorkerResult};

/// Supplies the raw database file for the worker's open action.
///
/// Invoked once per successful `init()`.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the data file identified by `url`.
    ///
    /// # Errors
    ///
    /// Fetch failures become initialization failures for the caller.
    async fn fetch(&self, url: &str) -> WorkerResult<Vec<u8>>;
}

/// Reads the data file from the local filesystem.
///
/// The url is treated as a path; a `file://` prefix is stripped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDataSource;

#[async_trait]
impl DataSource for FsDataSource {
    async fn fetch(&self, url: &str) -> WorkerResult<Vec<u8>> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::read(path).await.map_err(|e| WorkerError::Fetch {
            url: url.to_string(),
            source: e,
        })
    }
}

/// Serves a fixed in-memory payload regardless of url.
#[derive(Debug, Default, Clone)]
pub struct StaticDataSource {
    bytes: Vec<u8>,
}

impl StaticDataSource {
    /// Create a source that always yields `bytes`.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn fetch(&self, _url: &str) -> WorkerResult<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_fs_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"sqlite payload").unwrap();

        let url = file.path().to_string_lossy().to_string();
        let bytes = FsDataSource.fetch(&url).await.unwrap();
        assert_eq!(bytes, b"sqlite payload");
    }

    #[tokio::test]
    async fn test_fs_source_strips_file_scheme() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();

        let url = format!("file://{}", file.path().to_string_lossy());
        let bytes = FsDataSource.fetch(&url).await.unwrap();
        assert_eq!(bytes, b"x");
    }

    #[tokio::test]
    async fn test_fs_source_missing_file_is_fetch_error() {
        let err = FsDataSource
            .fetch("./definitely/not/here.db")
            .await
            .unwrap_err();
        match err {
            WorkerError::Fetch { url, .. } => assert_eq!(url, "./definitely/not/here.db"),
            other => panic!("expected fetch error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_static_source_ignores_url() {
        let source = StaticDataSource::new(b"fixed".to_vec());
        assert_eq!(source.fetch("anything").await.unwrap(), b"fixed");
    }
}
