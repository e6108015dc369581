//! Configuration management for cryptmirror

use crate::crypto::Algorithm;
use crate::error::{Error, Result};
use crate::transfer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default piece threshold: 16MB of plaintext per piece
pub const DEFAULT_THRESHOLD_SIZE: u64 = 1 << 24;

/// Default retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cryptmirror")
        .join("config.json")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cryptmirror")
}

/// Which files are backed up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of the tree to mirror
    pub root: PathBuf,

    /// Regex a local path must match (searched, not anchored)
    pub include: String,

    /// Regex excluding local paths that matched `include`
    pub exclude: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            root: PathBuf::from("."),
            include: ".*".to_string(),
            exclude: None,
        }
    }
}

/// Piece configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Maximum plaintext bytes per piece
    pub threshold_size: u64,

    /// Maximum total ciphertext per file
    pub max_file_size: Option<u64>,

    /// Algorithm for new pieces
    pub algorithm: Algorithm,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            threshold_size: DEFAULT_THRESHOLD_SIZE,
            max_file_size: None,
            algorithm: Algorithm::Aes,
        }
    }
}

/// Transfer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retries per piece after the first attempt
    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    pub retry_max_delay_ms: u64,

    /// Timeout for a single sink operation (0 disables)
    pub op_timeout_secs: u64,

    /// Pause between consecutive puts
    pub put_delay_ms: u64,

    /// Stop the run once this many issues have accumulated
    pub max_issues: Option<usize>,

    /// Keep an encrypted copy of the mapping on the sink
    pub upload_mapping: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            op_timeout_secs: 60,
            put_delay_ms: 0,
            max_issues: None,
            upload_mapping: true,
        }
    }
}

impl TransferConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            op_timeout: (self.op_timeout_secs > 0)
                .then(|| Duration::from_secs(self.op_timeout_secs)),
        }
    }

    pub fn put_delay(&self) -> Duration {
        Duration::from_millis(self.put_delay_ms)
    }
}

/// FTP sink parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,

    #[serde(default = "default_ftp_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Remote directory holding the blobs
    #[serde(default)]
    pub root: String,

    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
}

/// How the SFTP sink authenticates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SftpAuth {
    Agent,
    Password {
        password: String,
    },
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// SFTP sink parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,

    #[serde(default = "default_sftp_port")]
    pub port: u16,

    pub user: String,

    #[serde(default = "default_sftp_auth")]
    pub auth: SftpAuth,

    /// Remote directory holding the blobs
    #[serde(default)]
    pub root: String,

    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
}

fn default_ftp_port() -> u16 {
    21
}

fn default_sftp_port() -> u16 {
    22
}

fn default_sftp_auth() -> SftpAuth {
    SftpAuth::Agent
}

fn default_connect_timeout() -> u64 {
    30
}

/// Where the pieces go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Volatile, for tests and dry runs
    Memory,
    /// Local or mounted directory
    File { root: PathBuf },
    Ftp(FtpConfig),
    Sftp(SftpConfig),
}

impl std::fmt::Display for SinkConfig {
    /// Credentials are never shown
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkConfig::Memory => write!(f, "memory"),
            SinkConfig::File { root } => write!(f, "file://{}", root.display()),
            SinkConfig::Ftp(ftp) => write!(
                f,
                "ftp://{}@{}:{}/{}",
                ftp.user,
                ftp.host,
                ftp.port,
                ftp.root.trim_start_matches('/')
            ),
            SinkConfig::Sftp(sftp) => write!(
                f,
                "sftp://{}@{}:{}/{}",
                sftp.user,
                sftp.host,
                sftp.port,
                sftp.root.trim_start_matches('/')
            ),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::File {
            root: default_data_dir().join("sink"),
        }
    }
}

/// Local state files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub status_file: PathBuf,
    pub mapping_file: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        StateConfig {
            status_file: data_dir.join("status.txt"),
            mapping_file: data_dir.join("map.txt"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub chunk: ChunkConfig,
    pub transfer: TransferConfig,
    pub sink: SinkConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path_ref.display(),
                e
            ))
        })?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute `${VAR_NAME}` with the variable's value; unknown
    /// variables are left as written
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
        Ok(re
            .replace_all(content, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .into_owned())
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(threshold) = std::env::var("CRYPTMIRROR_THRESHOLD") {
            if let Ok(size) = threshold.trim().parse::<u64>() {
                self.chunk.threshold_size = size;
            }
        }

        if let Ok(retries) = std::env::var("CRYPTMIRROR_MAX_RETRIES") {
            if let Ok(n) = retries.trim().parse::<u32>() {
                self.transfer.max_retries = n;
            }
        }

        if let Ok(delay) = std::env::var("CRYPTMIRROR_PUT_DELAY_MS") {
            if let Ok(ms) = delay.trim().parse::<u64>() {
                self.transfer.put_delay_ms = ms;
            }
        }

        if let Ok(password) = std::env::var("CRYPTMIRROR_SINK_PASSWORD") {
            self.set_sink_password(password);
        }
    }

    fn set_sink_password(&mut self, password: String) {
        match &mut self.sink {
            SinkConfig::Ftp(ftp) => ftp.password = password,
            SinkConfig::Sftp(sftp) => sftp.auth = SftpAuth::Password { password },
            SinkConfig::Memory | SinkConfig::File { .. } => {}
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk.threshold_size == 0 {
            return Err(Error::Config(
                "Threshold size must be greater than 0".to_string(),
            ));
        }

        if self.chunk.max_file_size == Some(0) {
            return Err(Error::Config(
                "Max file size must be greater than 0 when set".to_string(),
            ));
        }

        if self.source.include.is_empty() {
            return Err(Error::Config("Include regex cannot be empty".to_string()));
        }
        regex::Regex::new(&self.source.include)?;
        if let Some(exclude) = &self.source.exclude {
            regex::Regex::new(exclude)?;
        }

        match &self.sink {
            SinkConfig::Memory => {}
            SinkConfig::File { root } => {
                if root.as_os_str().is_empty() {
                    return Err(Error::Config("File sink requires a root".to_string()));
                }
            }
            SinkConfig::Ftp(ftp) => {
                if ftp.host.is_empty() || ftp.user.is_empty() {
                    return Err(Error::Config(
                        "FTP sink requires host and user".to_string(),
                    ));
                }
            }
            SinkConfig::Sftp(sftp) => {
                if sftp.host.is_empty() || sftp.user.is_empty() {
                    return Err(Error::Config(
                        "SFTP sink requires host and user".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Ensure the directories holding local state exist
    pub fn ensure_directories(&self) -> Result<()> {
        for file in [&self.state.status_file, &self.state.mapping_file] {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        if let SinkConfig::File { root } = &self.sink {
            std::fs::create_dir_all(root)?;
        }
        Ok(())
    }
}
