//! SFTP sink
//!
//! libssh2 is blocking, so every operation runs on the blocking pool and
//! holds the connection mutex for its whole duration. A connection that
//! breaks is dropped and reopened lazily by the next call.

use super::{validate_name, TransferApi};
use crate::config::{SftpAuth, SftpConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// libssh2 sftp status codes
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

struct Connection {
    // Sftp borrows the session's channel; keep both alive together
    session: Session,
    sftp: Sftp,
}

/// Sink on a remote host reached over SSH
pub struct SftpTransfer {
    config: SftpConfig,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SftpTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpTransfer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("root", &self.config.root)
            .finish()
    }
}

fn classify(e: ssh2::Error, what: &str) -> Error {
    match e.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Error::NotFound(what.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            Error::fatal(format!("Permission denied for {}: {}", what, e))
        }
        ErrorCode::SFTP(_) => Error::Transport(format!("{}: {}", what, e)),
        ErrorCode::Session(_) => Error::connection_lost(format!("{}: {}", what, e)),
    }
}

fn classify_io(e: std::io::Error, what: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            Error::Transport(format!("{}: {}", what, e))
        }
        _ => Error::connection_lost(format!("{}: {}", what, e)),
    }
}

fn open(config: &SftpConfig) -> Result<Connection> {
    let endpoint = format!("{}:{}", config.host, config.port);
    let timeout = Duration::from_secs(config.timeout_secs.max(1));

    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| Error::Transport(format!("Resolving {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| Error::fatal(format!("No address for {}", endpoint)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| Error::Transport(format!("Connecting to {}: {}", endpoint, e)))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let mut session = Session::new().map_err(|e| classify(e, &endpoint))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| Error::Transport(format!("SSH handshake with {}: {}", endpoint, e)))?;

    let auth = match &config.auth {
        SftpAuth::Agent => session.userauth_agent(&config.user),
        SftpAuth::Password { password } => session.userauth_password(&config.user, password),
        SftpAuth::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(&config.user, None, path, passphrase.as_deref())
        }
    };
    if let Err(e) = auth {
        return Err(Error::fatal(format!(
            "SFTP authentication failed for {}@{}: {}",
            config.user, endpoint, e
        )));
    }
    if !session.authenticated() {
        return Err(Error::fatal(format!(
            "SFTP authentication failed for {}@{}",
            config.user, endpoint
        )));
    }

    let sftp = session.sftp().map_err(|e| classify(e, &endpoint))?;
    info!("Connected to sftp://{}@{}", config.user, endpoint);
    Ok(Connection { session, sftp })
}

fn remote_path(root: &str, name: &str) -> PathBuf {
    if root.is_empty() {
        PathBuf::from(name)
    } else {
        Path::new(root).join(name)
    }
}

fn mkdir_all(sftp: &Sftp, dir: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(&current).is_ok() {
            continue;
        }
        if let Err(e) = sftp.mkdir(&current, 0o755) {
            // Lost a race with another writer, or the directory is there
            // but not stat-able; only fail if it is still missing
            if sftp.stat(&current).is_err() {
                return Err(classify(e, &current.display().to_string()));
            }
        }
    }
    Ok(())
}

fn put_blob(sftp: &Sftp, path: &Path, data: &[u8], name: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        mkdir_all(sftp, parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4().simple()));

    let mut file = sftp
        .open_mode(
            &temp,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            0o644,
            OpenType::File,
        )
        .map_err(|e| classify(e, name))?;
    file.write_all(data).map_err(|e| classify_io(e, name))?;
    drop(file);

    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    if sftp.rename(&temp, path, Some(flags)).is_err() {
        // Servers without posix-rename refuse to overwrite
        let _ = sftp.unlink(path);
        if let Err(e) = sftp.rename(&temp, path, None) {
            let _ = sftp.unlink(&temp);
            return Err(classify(e, name));
        }
    }
    Ok(())
}

fn list_into(sftp: &Sftp, root: &Path, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match sftp.readdir(dir) {
        Ok(entries) => entries,
        Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => return Ok(()),
        Err(e) => return Err(classify(e, &dir.display().to_string())),
    };

    for (path, stat) in entries {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file_name == "." || file_name == ".." {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        if stat.is_dir() {
            let as_dir = format!("{}/", relative);
            if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                list_into(sftp, root, &path, prefix, out)?;
            }
        } else if file_name.starts_with('.') && file_name.contains(".tmp-") {
            continue;
        } else if relative.starts_with(prefix) {
            out.push(relative);
        }
    }
    Ok(())
}

impl SftpTransfer {
    pub fn new(config: SftpConfig) -> Self {
        SftpTransfer {
            config,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `f` against the connection on the blocking pool, opening it
    /// first if needed and dropping it when the transport fails
    async fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if guard.is_none() {
                *guard = Some(open(&config)?);
            }
            let connection = guard
                .as_ref()
                .ok_or_else(|| Error::Internal("SFTP connection missing".to_string()))?;

            let result = f(&connection.sftp, &config.root);
            if let Err(e) = &result {
                if e.is_connection_lost() || e.is_retriable() {
                    debug!("Dropping SFTP connection after: {}", e);
                    *guard = None;
                }
            }
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("SFTP task failed: {}", e)))?
    }
}

#[async_trait]
impl TransferApi for SftpTransfer {
    fn name(&self) -> &str {
        "sftp"
    }

    async fn connect(&self) -> Result<()> {
        let root = self.config.root.clone();
        self.with_sftp(move |sftp, _| {
            if root.is_empty() {
                Ok(())
            } else {
                mkdir_all(sftp, Path::new(&root))
            }
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(connection) = conn.lock().take() {
                let _ = connection.session.disconnect(None, "closing", None);
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("SFTP task failed: {}", e)))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        let data = data.to_vec();
        self.with_sftp(move |sftp, root| {
            put_blob(sftp, &remote_path(root, &name), &data, &name)?;
            debug!("Stored {} ({} bytes)", name, data.len());
            Ok(())
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let name = name.to_string();
        self.with_sftp(move |sftp, root| {
            let mut file = sftp
                .open(&remote_path(root, &name))
                .map_err(|e| classify(e, &name))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| classify_io(e, &name))?;
            Ok(data)
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_sftp(move |sftp, root| {
            let root_path = if root.is_empty() {
                PathBuf::from(".")
            } else {
                PathBuf::from(root)
            };
            let mut names = Vec::new();
            list_into(sftp, &root_path, &root_path, &prefix, &mut names)?;
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        self.with_sftp(move |sftp, root| match sftp.unlink(&remote_path(root, &name)) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => Ok(()),
            Err(e) => Err(classify(e, &name)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("", "fp/a.0000"), PathBuf::from("fp/a.0000"));
        assert_eq!(
            remote_path("/srv/backup", "fp/a.0000"),
            PathBuf::from("/srv/backup/fp/a.0000")
        );
    }

    #[test]
    fn test_debug_hides_auth() {
        let sink = SftpTransfer::new(SftpConfig {
            host: "backup.example".to_string(),
            port: 22,
            user: "me".to_string(),
            auth: SftpAuth::Password {
                password: "hunter2".to_string(),
            },
            root: String::new(),
            timeout_secs: 5,
        });
        let shown = format!("{:?}", sink);
        assert!(shown.contains("backup.example"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let sink = SftpTransfer::new(SftpConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "me".to_string(),
            auth: SftpAuth::Agent,
            root: String::new(),
            timeout_secs: 1,
        });
        let err = sink.get("fp/a.0000").await.unwrap_err();
        assert!(err.is_retriable());
    }
}
