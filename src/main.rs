//! cryptmirror - Incremental, chunked, encrypted backups
//!
//! Usage:
//!   cryptmirror init --root <dir>             - Write a configuration file
//!   cryptmirror backup                        - Upload new and changed files
//!   cryptmirror restore <target>              - Restore files from the sink
//!   cryptmirror verify                        - Check mapped pieces on the sink
//!   cryptmirror status                        - Show local backup state
//!   cryptmirror encrypt <source> <dest>       - Back up a folder into a folder
//!   cryptmirror decrypt <source> <dest>       - Restore a folder from a folder

use clap::{Parser, Subcommand};
use cryptmirror::{
    backup::{BackupOptions, EncryptedBackup},
    config::{default_config_path, Config, SinkConfig},
    crypto::{Algorithm, BackupKey, ChunkCodec},
    metadata::{MappingStore, Outcome, StatusStore},
    transfer::{FileTransfer, TransferBackend},
    tree::FileTreeNode,
    Error, Result, TransferReport,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cryptmirror")]
#[command(author = "cryptmirror Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental, chunked, encrypted backups")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read the backup key from a file (64 hex chars or 32 raw bytes)
    #[arg(short, long, global = true)]
    key_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Directory to back up
        #[arg(long)]
        root: PathBuf,

        /// Directory sink (defaults to the data directory)
        #[arg(long)]
        sink_dir: Option<PathBuf>,

        /// Also generate a random key and write it to this file
        #[arg(long)]
        generate_key: Option<PathBuf>,
    },

    /// Upload new and changed files
    Backup {
        /// Seconds to wait between two uploads
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Restore files from the sink
    Restore {
        /// Target directory, or target file with --path
        target: PathBuf,

        /// Restore the files whose path matches this regex
        #[arg(long, conflicts_with = "path")]
        regex: Option<String>,

        /// Restore this one file
        #[arg(long)]
        path: Option<String>,

        /// Fetch the mapping copy from the sink first
        #[arg(long)]
        from_sink: bool,
    },

    /// Check that every mapped piece is still on the sink
    Verify,

    /// Show local backup state
    Status,

    /// Back up a folder into a plain directory sink
    Encrypt {
        source: PathBuf,
        dest: PathBuf,

        /// Maximum plaintext bytes per piece
        #[arg(long)]
        threshold: Option<u64>,

        /// AES or fernet
        #[arg(long, default_value = "AES")]
        algorithm: String,

        /// Only back up files matching this regex
        #[arg(long, default_value = ".*")]
        regex: String,
    },

    /// Restore a folder from a plain directory sink
    Decrypt {
        source: PathBuf,
        dest: PathBuf,

        /// Only restore files matching this regex
        #[arg(long, default_value = ".*")]
        regex: String,
    },
}

const STATUS_FILE_NAME: &str = "status.txt";
const MAPPING_FILE_NAME: &str = "map.txt";

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_ref()
        .map(expand_tilde)
        .unwrap_or_else(default_config_path);

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Config::load(&config_path)
            .ok()
            .and_then(|config| Level::from_str(&config.logging.level).ok())
            .unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let key_file = cli.key_file.as_deref().map(expand_tilde);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path, key_file.as_deref()) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path, key_file: Option<&Path>) -> Result<()> {
    match command {
        Commands::Init {
            root,
            sink_dir,
            generate_key,
        } => cmd_init(config_path, root, sink_dir, generate_key),

        Commands::Backup { delay } => cmd_backup(config_path, key_file, delay),

        Commands::Restore {
            target,
            regex,
            path,
            from_sink,
        } => cmd_restore(config_path, key_file, &target, regex, path, from_sink),

        Commands::Verify => cmd_verify(config_path, key_file),

        Commands::Status => cmd_status(config_path),

        Commands::Encrypt {
            source,
            dest,
            threshold,
            algorithm,
            regex,
        } => cmd_encrypt(key_file, &source, &dest, threshold, &algorithm, &regex),

        Commands::Decrypt {
            source,
            dest,
            regex,
        } => cmd_decrypt(key_file, &source, &dest, &regex),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Key from `--key-file`, then `CRYPTMIRROR_KEY`, then an interactive prompt
fn load_key(key_file: Option<&Path>) -> Result<BackupKey> {
    if let Some(path) = key_file {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("Failed to read key file: {}", e)))?;
        return match std::str::from_utf8(&bytes) {
            Ok(text) => BackupKey::parse(text),
            Err(_) => BackupKey::from_bytes(&bytes),
        };
    }

    if let Ok(text) = std::env::var("CRYPTMIRROR_KEY") {
        return BackupKey::parse(&text);
    }

    let text = rpassword::prompt_password("Enter backup key: ")
        .map_err(|e| Error::Internal(e.to_string()))?;
    BackupKey::parse(&text)
}

fn open_backup(config_path: &Path, key_file: Option<&Path>) -> Result<EncryptedBackup<TransferBackend>> {
    let config = Config::load(config_path)?;
    config.ensure_directories()?;
    let key = load_key(key_file)?;
    let transfer = TransferBackend::from_config(&config.sink)?;
    EncryptedBackup::from_config(&config, key, transfer)
}

fn print_report(report: &TransferReport) {
    println!("Uploaded: {}", report.done.len());
    for path in &report.done {
        println!("  + {}", path);
    }
    println!("Skipped: {}", report.skipped);
    println!("Bytes sent: {}", report.bytes_sent);
    if !report.issues.is_empty() {
        println!("Issues: {}", report.issues.len());
        for issue in &report.issues {
            println!("  ! {} [{}] {}", issue.local_path, issue.kind, issue.message);
        }
    }
    if report.stopped_early {
        println!("The run stopped early; remaining files will be picked up next time.");
    }
}

fn cmd_init(
    config_path: &Path,
    root: PathBuf,
    sink_dir: Option<PathBuf>,
    generate_key: Option<PathBuf>,
) -> Result<()> {
    info!("Initializing cryptmirror...");

    let mut config = Config::default();
    config.source.root = root;
    if let Some(dir) = sink_dir {
        config.sink = SinkConfig::File { root: dir };
    }
    config.validate()?;

    config.save(config_path)?;
    config.ensure_directories()?;

    if let Some(path) = generate_key {
        if path.exists() {
            return Err(Error::Config(format!(
                "Refusing to overwrite existing key file {:?}",
                path
            )));
        }
        let key: [u8; 32] = rand::random();
        let text = zeroize::Zeroizing::new(hex::encode(key));
        std::fs::write(&path, text.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        let fingerprint = BackupKey::parse(&text)?.fingerprint().to_string();
        info!("Key written to {:?} (fingerprint {})", path, fingerprint);
        warn!("Keep a copy of the key: without it the backup cannot be restored");
    }

    info!("Configuration saved to {:?}", config_path);
    info!("");
    info!("Next steps:");
    info!("  1. Review the sink section of the configuration");
    info!("  2. Run 'cryptmirror backup --key-file <key>' to upload the tree");

    Ok(())
}

fn cmd_backup(config_path: &Path, key_file: Option<&Path>, delay: Option<f64>) -> Result<()> {
    let delay = match delay {
        Some(secs) if !secs.is_finite() || secs < 0.0 => {
            return Err(Error::Config(format!("Invalid delay: {}", secs)));
        }
        Some(secs) => Some(Duration::from_secs_f64(secs)),
        None => None,
    };

    let mut backup = open_backup(config_path, key_file)?;
    let report = runtime()?.block_on(backup.start_transfering(delay))?;
    print_report(&report);
    Ok(())
}

fn cmd_restore(
    config_path: &Path,
    key_file: Option<&Path>,
    target: &Path,
    regex: Option<String>,
    path: Option<String>,
    from_sink: bool,
) -> Result<()> {
    let mut backup = open_backup(config_path, key_file)?;

    runtime()?.block_on(async {
        if from_sink {
            backup.load_mapping_from_sink().await?;
        }

        if let Some(path) = path {
            backup.retrieve(&path, target).await?;
            println!("Restored {} to {:?}", path, target);
            return Ok(());
        }

        let pattern = regex.unwrap_or_else(|| ".*".to_string());
        let report = backup.retrieve_all(target, &pattern).await?;
        println!("Restored: {}", report.restored.len());
        println!("Already present: {}", report.skipped.len());
        for issue in &report.issues {
            println!("  ! {} [{}] {}", issue.local_path, issue.kind, issue.message);
        }
        if report.issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "{} files could not be restored",
                report.issues.len()
            )))
        }
    })
}

fn cmd_verify(config_path: &Path, key_file: Option<&Path>) -> Result<()> {
    let mut backup = open_backup(config_path, key_file)?;
    let incomplete = runtime()?.block_on(backup.verify_remote())?;

    if incomplete.is_empty() {
        println!("All {} mapped files are complete on the sink", backup.mapping().len());
    } else {
        println!("{} files have missing pieces and will be uploaded again:", incomplete.len());
        for path in &incomplete {
            println!("  - {}", path);
        }
    }
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let status = StatusStore::load(&config.state.status_file)?;
    let mapping = MappingStore::load(&config.state.mapping_file)?;

    let count = |outcome: Outcome| {
        status
            .records()
            .values()
            .filter(|record| record.outcome == outcome)
            .count()
    };
    let pieces: usize = mapping.items().map(|(_, pieces)| pieces.len()).sum();
    let stored: u64 = mapping
        .items()
        .flat_map(|(_, pieces)| pieces.iter())
        .map(|piece| piece.cipher_size)
        .sum();

    println!("cryptmirror Status");
    println!("==================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Source: {:?}", config.source.root);
    println!("Sink: {}", config.sink);
    println!("Threshold: {} bytes", config.chunk.threshold_size);
    println!("Algorithm: {}", config.chunk.algorithm);
    println!();
    println!("Status records: {}", status.len());
    println!("  OK: {}", count(Outcome::Ok));
    println!("  FAILED: {}", count(Outcome::Failed));
    println!("  SKIPPED: {}", count(Outcome::Skipped));
    println!("Mapped files: {}", mapping.len());
    println!("Pieces: {} ({} bytes on the sink)", pieces, stored);

    Ok(())
}

fn folder_backup(
    tree_root: &Path,
    include: &str,
    sink_root: &Path,
    key: BackupKey,
    algorithm: Algorithm,
    threshold: Option<u64>,
) -> Result<EncryptedBackup<FileTransfer>> {
    let defaults = Config::default();
    let mut options = BackupOptions::from_config(&defaults);
    if let Some(threshold) = threshold {
        options.threshold = threshold;
    }

    EncryptedBackup::new(
        FileTreeNode::new(tree_root, include, None)?,
        ChunkCodec::new(key, algorithm),
        FileTransfer::new(sink_root),
        sink_root.join(STATUS_FILE_NAME),
        sink_root.join(MAPPING_FILE_NAME),
        options,
    )
}

fn cmd_encrypt(
    key_file: Option<&Path>,
    source: &Path,
    dest: &Path,
    threshold: Option<u64>,
    algorithm: &str,
    regex: &str,
) -> Result<()> {
    let algorithm = Algorithm::from_str(algorithm)?;
    let key = load_key(key_file)?;
    std::fs::create_dir_all(dest)?;

    let mut backup = folder_backup(source, regex, dest, key, algorithm, threshold)?;
    let report = runtime()?.block_on(backup.start_transfering(None))?;
    print_report(&report);
    Ok(())
}

fn cmd_decrypt(key_file: Option<&Path>, source: &Path, dest: &Path, regex: &str) -> Result<()> {
    if !source.join(MAPPING_FILE_NAME).exists() {
        return Err(Error::Config(format!(
            "{:?} does not look like a cryptmirror folder (no {})",
            source, MAPPING_FILE_NAME
        )));
    }
    let key = load_key(key_file)?;
    std::fs::create_dir_all(dest)?;

    let mut backup = folder_backup(dest, ".*", source, key, Algorithm::default(), None)?;
    let report = runtime()?.block_on(backup.retrieve_all(dest, regex))?;

    println!("Restored: {}", report.restored.len());
    println!("Already present: {}", report.skipped.len());
    for issue in &report.issues {
        println!("  ! {} [{}] {}", issue.local_path, issue.kind, issue.message);
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
