//! cryptmirror - Incremental, chunked, encrypted backups
//!
//! This library mirrors a local directory tree onto a blob sink (local
//! directory, FTP, SFTP, or memory) as encrypted, size-bounded pieces. Only
//! new or changed files are uploaded, and a persisted mapping lets any file
//! be restored from the sink later.

pub mod backup;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod transfer;
pub mod tree;

pub use backup::{BackupOptions, EncryptedBackup, Issue, RetrieveReport, TransferReport};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backup::{BackupOptions, EncryptedBackup, TransferReport};
    pub use crate::config::Config;
    pub use crate::crypto::{Algorithm, BackupKey, ChunkCodec};
    pub use crate::error::{Error, Result};
    pub use crate::transfer::{TransferApi, TransferBackend};
    pub use crate::tree::FileTreeNode;
}
