//! FTP sink
//!
//! Same shape as the SFTP sink: one control connection behind a mutex,
//! driven from the blocking pool and reopened after it breaks.

use super::{validate_name, TransferApi};
use crate::config::FtpConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info};

/// Sink on an FTP server
pub struct FtpTransfer {
    config: FtpConfig,
    conn: Arc<Mutex<Option<FtpStream>>>,
}

impl std::fmt::Debug for FtpTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpTransfer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("root", &self.config.root)
            .finish()
    }
}

/// Map FTP replies onto the sink error categories
///
/// 4xx replies are transient by definition; 5xx are permanent, except that
/// 550 on a read means the blob is not there.
fn classify(e: FtpError, what: &str, missing_is_not_found: bool) -> Error {
    match e {
        FtpError::ConnectionError(io) => Error::connection_lost(format!("{}: {}", what, io)),
        FtpError::UnexpectedResponse(resp) => {
            let code = resp.status.code();
            let body = String::from_utf8_lossy(&resp.body).trim().to_string();
            match code {
                400..=499 => Error::Transport(format!("{}: {} {}", what, code, body)),
                550 if missing_is_not_found => Error::NotFound(what.to_string()),
                _ => Error::fatal(format!("{}: {} {}", what, code, body)),
            }
        }
        other => Error::Transport(format!("{}: {}", what, other)),
    }
}

fn open(config: &FtpConfig) -> Result<FtpStream> {
    let endpoint = format!("{}:{}", config.host, config.port);
    let timeout = Duration::from_secs(config.timeout_secs.max(1));

    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| Error::Transport(format!("Resolving {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| Error::fatal(format!("No address for {}", endpoint)))?;

    let mut stream = FtpStream::connect_timeout(addr, timeout)
        .map_err(|e| Error::Transport(format!("Connecting to {}: {}", endpoint, e)))?;
    stream.get_ref().set_read_timeout(Some(timeout))?;
    stream.get_ref().set_write_timeout(Some(timeout))?;

    stream.login(&config.user, &config.password).map_err(|e| {
        Error::fatal(format!(
            "FTP login failed for {}@{}: {}",
            config.user, endpoint, e
        ))
    })?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| classify(e, "TYPE I", false))?;

    info!("Connected to ftp://{}@{}", config.user, endpoint);
    Ok(stream)
}

fn remote_path(root: &str, name: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", root, name)
    }
}

fn mkdir_all(stream: &mut FtpStream, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/') {
        if part.is_empty() {
            if current.is_empty() {
                current.push('/');
            }
            continue;
        }
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        // Existing directories answer 550; the following STOR reports
        // anything that is really wrong
        let _ = stream.mkdir(&current);
    }
}

/// Entries of `dir` as full remote paths
///
/// Servers disagree on whether NLST returns bare names or paths, so only
/// the last component is trusted.
fn nlst(stream: &mut FtpStream, dir: &str) -> Result<Vec<String>> {
    let listing = match stream.nlst(Some(if dir.is_empty() { "." } else { dir })) {
        Ok(listing) => listing,
        Err(FtpError::UnexpectedResponse(resp)) if resp.status.code() == 550 => Vec::new(),
        Err(FtpError::UnexpectedResponse(resp)) if resp.status.code() == 450 => Vec::new(),
        Err(e) => return Err(classify(e, dir, false)),
    };

    Ok(listing
        .into_iter()
        .filter_map(|entry| {
            let base = entry.trim_end_matches('/').rsplit('/').next()?.to_string();
            if base.is_empty() || base == "." || base == ".." {
                return None;
            }
            Some(if dir.is_empty() {
                base
            } else {
                format!("{}/{}", dir.trim_end_matches('/'), base)
            })
        })
        .collect())
}

fn list_prefix_blocking(stream: &mut FtpStream, root: &str, prefix: &str) -> Result<Vec<String>> {
    let root = root.trim_end_matches('/');
    let strip = |path: &str| -> String {
        if root.is_empty() {
            path.to_string()
        } else {
            path.strip_prefix(root)
                .map(|p| p.trim_start_matches('/').to_string())
                .unwrap_or_else(|| path.to_string())
        }
    };

    let mut names = Vec::new();
    match prefix.rfind('/') {
        Some(slash) => {
            let dir = remote_path(root, &prefix[..slash]);
            for path in nlst(stream, &dir)? {
                let name = strip(&path);
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }
        None => {
            // Blobs live one directory deep; descend into anything that
            // lists as a directory
            for path in nlst(stream, root)? {
                let name = strip(&path);
                let children = nlst(stream, &path)?;
                let is_file = children.is_empty() || children == [path.clone()];
                if is_file {
                    if name.starts_with(prefix) {
                        names.push(name);
                    }
                    continue;
                }
                for child in children {
                    let child_name = strip(&child);
                    if child_name.starts_with(prefix) {
                        names.push(child_name);
                    }
                }
            }
        }
    }

    names.retain(|name| {
        let base = name.rsplit('/').next().unwrap_or(name);
        !(base.starts_with('.') && base.contains(".tmp-"))
    });
    names.sort();
    names.dedup();
    Ok(names)
}

impl FtpTransfer {
    pub fn new(config: FtpConfig) -> Self {
        FtpTransfer {
            config,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_stream<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if guard.is_none() {
                *guard = Some(open(&config)?);
            }
            let stream = guard
                .as_mut()
                .ok_or_else(|| Error::Internal("FTP connection missing".to_string()))?;

            let result = f(stream, &config.root);
            if let Err(e) = &result {
                if e.is_connection_lost() || e.is_retriable() {
                    debug!("Dropping FTP connection after: {}", e);
                    *guard = None;
                }
            }
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("FTP task failed: {}", e)))?
    }
}

#[async_trait]
impl TransferApi for FtpTransfer {
    fn name(&self) -> &str {
        "ftp"
    }

    async fn connect(&self) -> Result<()> {
        self.with_stream(|stream, root| {
            if !root.is_empty() {
                mkdir_all(stream, root);
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(mut stream) = conn.lock().take() {
                let _ = stream.quit();
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("FTP task failed: {}", e)))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        let data = data.to_vec();
        self.with_stream(move |stream, root| {
            let path = remote_path(root, &name);
            let (dir, base) = match path.rfind('/') {
                Some(slash) => (&path[..slash], &path[slash + 1..]),
                None => ("", path.as_str()),
            };
            if !dir.is_empty() {
                mkdir_all(stream, dir);
            }

            let temp_base = format!(".{}.tmp-{}", base, uuid::Uuid::new_v4().simple());
            let temp = if dir.is_empty() {
                temp_base
            } else {
                format!("{}/{}", dir, temp_base)
            };

            stream
                .put_file(&temp, &mut Cursor::new(&data))
                .map_err(|e| classify(e, &name, false))?;
            if stream.rename(&temp, &path).is_err() {
                // Some servers refuse to rename over an existing file
                let _ = stream.rm(&path);
                if let Err(e) = stream.rename(&temp, &path) {
                    let _ = stream.rm(&temp);
                    return Err(classify(e, &name, false));
                }
            }
            debug!("Stored {} ({} bytes)", name, data.len());
            Ok(())
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let name = name.to_string();
        self.with_stream(move |stream, root| {
            stream
                .retr_as_buffer(&remote_path(root, &name))
                .map(Cursor::into_inner)
                .map_err(|e| classify(e, &name, true))
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_stream(move |stream, root| list_prefix_blocking(stream, root, &prefix))
            .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        self.with_stream(move |stream, root| match stream.rm(&remote_path(root, &name)) {
            Ok(()) => Ok(()),
            Err(FtpError::UnexpectedResponse(resp)) if resp.status.code() == 550 => Ok(()),
            Err(e) => Err(classify(e, &name, false)),
        })
        .await
    }
}
