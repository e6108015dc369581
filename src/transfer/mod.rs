//! Blob sinks
//!
//! A sink stores opaque blobs under `/`-separated names. The backup engine
//! only ever needs four operations (`put`, `get`, `list_prefix`, `remove`);
//! each adapter translates its transport's failures into
//! [`Error::Transport`] (worth retrying), [`Error::FatalTransport`] (not) or
//! [`Error::NotFound`].

mod file;
#[cfg(feature = "ftp")]
mod ftp;
mod memory;
mod retry;
#[cfg(feature = "sftp")]
mod sftp;

pub use file::FileTransfer;
#[cfg(feature = "ftp")]
pub use ftp::FtpTransfer;
pub use memory::{FailureKind, MemoryTransfer, TransferOp};
pub use retry::{timed, with_retry, ExponentialBackoff, RetryPolicy};
#[cfg(feature = "sftp")]
pub use sftp::SftpTransfer;

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Capability set of a blob sink
///
/// `put` overwrites: putting the same name twice is a rewrite, never an
/// error. `remove` of an absent name succeeds.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &str;

    /// Open the connection, if the sink has one
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Close the connection, if the sink has one
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Names starting with `prefix`, sorted
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn remove(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl<T: TransferApi + ?Sized> TransferApi for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        (**self).put(name, data).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        (**self).get(name).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_prefix(prefix).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        (**self).remove(name).await
    }
}

/// Reject names that could escape the sink root
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("Blob name cannot be empty".to_string()));
    }
    if name.starts_with('/') || name.contains('\\') {
        return Err(Error::Config(format!("Invalid blob name: {}", name)));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(Error::Config(format!("Invalid blob name: {}", name)));
    }
    Ok(())
}

/// The sinks this crate knows how to build from configuration
pub enum TransferBackend {
    Memory(MemoryTransfer),
    File(FileTransfer),
    #[cfg(feature = "ftp")]
    Ftp(FtpTransfer),
    #[cfg(feature = "sftp")]
    Sftp(SftpTransfer),
}

impl TransferBackend {
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        match config {
            SinkConfig::Memory => Ok(TransferBackend::Memory(MemoryTransfer::new())),
            SinkConfig::File { root } => Ok(TransferBackend::File(FileTransfer::new(root))),
            #[cfg(feature = "ftp")]
            SinkConfig::Ftp(ftp) => Ok(TransferBackend::Ftp(FtpTransfer::new(ftp.clone()))),
            #[cfg(not(feature = "ftp"))]
            SinkConfig::Ftp(_) => Err(Error::Config(
                "FTP sink support was not compiled in (enable the `ftp` feature)".to_string(),
            )),
            #[cfg(feature = "sftp")]
            SinkConfig::Sftp(sftp) => {
                Ok(TransferBackend::Sftp(SftpTransfer::new(sftp.clone())))
            }
            #[cfg(not(feature = "sftp"))]
            SinkConfig::Sftp(_) => Err(Error::Config(
                "SFTP sink support was not compiled in (enable the `sftp` feature)".to_string(),
            )),
        }
    }

    fn inner(&self) -> &dyn TransferApi {
        match self {
            TransferBackend::Memory(t) => t,
            TransferBackend::File(t) => t,
            #[cfg(feature = "ftp")]
            TransferBackend::Ftp(t) => t,
            #[cfg(feature = "sftp")]
            TransferBackend::Sftp(t) => t,
        }
    }
}

#[async_trait]
impl TransferApi for TransferBackend {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn connect(&self) -> Result<()> {
        self.inner().connect().await
    }

    async fn close(&self) -> Result<()> {
        self.inner().close().await
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.inner().put(name, data).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.inner().get(name).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner().list_prefix(prefix).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner().remove(name).await
    }
}
