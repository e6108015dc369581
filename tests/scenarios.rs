//! End-to-end backup and restore runs against the in-memory and directory sinks

use async_trait::async_trait;
use cryptmirror::backup::{BackupOptions, EncryptedBackup};
use cryptmirror::chunk::{mapping_blob_name, PieceName};
use cryptmirror::clock::ManualClock;
use cryptmirror::crypto::{fernet, Algorithm, BackupKey, ChunkCodec};
use cryptmirror::metadata::{MappingStore, Outcome, StatusStore};
use cryptmirror::transfer::{
    FailureKind, FileTransfer, MemoryTransfer, RetryPolicy, TransferApi, TransferOp,
};
use cryptmirror::tree::FileTreeNode;
use cryptmirror::{Error, ErrorKind, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

const THRESHOLD: u64 = 2000;

fn unit_key() -> BackupKey {
    BackupKey::from_bytes(&b"unit".repeat(8)).unwrap()
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8)
        .collect()
}

fn set_mtime(path: &Path, secs: u64) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn options(max_retries: u32) -> BackupOptions {
    BackupOptions {
        threshold: THRESHOLD,
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            op_timeout: Some(Duration::from_secs(10)),
        },
        ..Default::default()
    }
}

struct Fixture {
    dir: TempDir,
    sink: Arc<MemoryTransfer>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        Fixture {
            dir,
            sink: Arc::new(MemoryTransfer::new()),
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn write(&self, local_path: &str, data: &[u8]) -> PathBuf {
        let path = self.root().join(local_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    fn status_file(&self) -> PathBuf {
        self.dir.path().join("state/status.txt")
    }

    fn mapping_file(&self) -> PathBuf {
        self.dir.path().join("state/map.txt")
    }

    fn open_with(&self, include: &str, options: BackupOptions) -> EncryptedBackup<Arc<MemoryTransfer>> {
        EncryptedBackup::new(
            FileTreeNode::new(self.root(), include, None).unwrap(),
            ChunkCodec::new(unit_key(), Algorithm::Aes),
            Arc::clone(&self.sink),
            self.status_file(),
            self.mapping_file(),
            options,
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::at_epoch(1_700_000_000)))
    }

    fn open(&self) -> EncryptedBackup<Arc<MemoryTransfer>> {
        self.open_with(r".*\.py$", options(3))
    }

    fn piece(&self, local_path: &str, index: u32) -> PieceName {
        PieceName::new(unit_key().fingerprint(), local_path, index)
    }
}

/// a.py (120 B) and b.py (5 000 B), backed up once
async fn baseline() -> (Fixture, EncryptedBackup<Arc<MemoryTransfer>>) {
    let fx = Fixture::new();
    fx.write("a.py", &content(120, 1));
    fx.write("b.py", &content(5000, 2));

    let mut backup = fx.open();
    let report = backup.start_transfering(None).await.unwrap();
    assert_eq!(report.done, vec!["a.py", "b.py"]);
    assert!(report.issues.is_empty());
    (fx, backup)
}

#[tokio::test]
async fn baseline_backup_splits_large_file() {
    let (_fx, backup) = baseline().await;
    let mapping = backup.mapping();

    assert_eq!(mapping.len(), 2);
    assert_eq!(mapping.get("a.py").unwrap().len(), 1);

    let b = mapping.get("b.py").unwrap();
    assert_eq!(b.len(), 3);
    // 2000 + 2000 + 1000 plaintext bytes, each padded and prefixed by an IV
    let cipher_sizes: Vec<u64> = b.iter().map(|p| p.cipher_size).collect();
    assert_eq!(cipher_sizes, vec![16 + 2016, 16 + 2016, 16 + 1008]);
    assert!(b.iter().all(|p| p.piece_count == 3 && p.plain_size == 5000));
    assert_eq!(
        b.iter().map(|p| p.piece_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    for name in ["a.py", "b.py"] {
        assert_eq!(backup.status().get(name).unwrap().outcome, Outcome::Ok);
    }
}

#[tokio::test]
async fn unchanged_rerun_puts_nothing() {
    let (fx, mut backup) = baseline().await;
    fx.sink.clear_log();

    let report = backup.start_transfering(None).await.unwrap();
    assert!(report.done.is_empty());
    assert!(report.issues.is_empty());
    assert_eq!(report.skipped, 2);
    assert!(fx.sink.put_attempts().is_empty());
}

#[tokio::test]
async fn unchanged_rerun_after_restart_puts_nothing() {
    let (fx, backup) = baseline().await;
    drop(backup);
    fx.sink.clear_log();

    let mut reopened = fx.open();
    let report = reopened.start_transfering(None).await.unwrap();
    assert!(report.done.is_empty());
    assert!(fx.sink.put_attempts().is_empty());
}

#[tokio::test]
async fn modified_file_is_uploaded_again() {
    let (fx, mut backup) = baseline().await;
    let stale = fx.piece("b.py", 2);
    fx.write("b.py", &content(2500, 9));
    fx.sink.clear_log();

    let report = backup.start_transfering(None).await.unwrap();
    assert_eq!(report.done, vec!["b.py"]);
    assert!(report.issues.is_empty());

    let b = backup.mapping().get("b.py").unwrap();
    assert_eq!(b.len(), 2);
    // superseded pieces stay on the sink but are no longer referenced
    assert!(fx.sink.contains(stale.as_str()));
    assert!(b.iter().all(|p| p.piece_name != stale));
    assert!(fx
        .sink
        .put_attempts()
        .iter()
        .all(|name| !name.contains(&cryptmirror::crypto::sha1_hex(b"a.py"))));

    assert_eq!(backup.retrieve_bytes("b.py").await.unwrap(), content(2500, 9));
}

#[tokio::test]
async fn retrieve_by_path() {
    let (fx, mut backup) = baseline().await;
    let out = fx.dir.path().join("out");

    backup.retrieve("b.py", &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content(5000, 2));
}

#[tokio::test]
async fn retrieve_by_regex() {
    let (fx, mut backup) = baseline().await;
    let restore = fx.dir.path().join("restore");

    let report = backup.retrieve_all(&restore, r".*\.py").await.unwrap();
    assert_eq!(report.restored, vec!["a.py", "b.py"]);
    assert!(report.issues.is_empty());
    assert_eq!(std::fs::read(restore.join("a.py")).unwrap(), content(120, 1));
    assert_eq!(std::fs::read(restore.join("b.py")).unwrap(), content(5000, 2));
}

#[tokio::test]
async fn transient_put_failures_are_retried() {
    let fx = Fixture::new();
    fx.write("a.py", &content(120, 1));
    fx.write("b.py", &content(5000, 2));

    let first = fx.piece("b.py", 0);
    let second = fx.piece("b.py", 1);
    fx.sink
        .fail_next(TransferOp::Put, Some(second.as_str()), 2, FailureKind::Transient);

    let mut backup = fx.open();
    let report = backup.start_transfering(None).await.unwrap();

    assert!(report.done.iter().any(|p| p == "b.py"));
    assert!(report.issues.is_empty());
    assert_eq!(fx.sink.put_attempts_for(first.as_str()), 1);
    assert_eq!(fx.sink.put_attempts_for(second.as_str()), 3);
    assert_eq!(
        fx.sink.put_attempts_for(first.as_str()) + fx.sink.put_attempts_for(second.as_str()),
        4
    );
}

#[tokio::test]
async fn piece_boundaries() {
    let fx = Fixture::new();
    fx.write("empty.py", b"");
    fx.write("exact.py", &content(THRESHOLD as usize, 3));
    fx.write("over.py", &content(THRESHOLD as usize + 1, 4));

    let mut backup = fx.open();
    let report = backup.start_transfering(None).await.unwrap();
    assert_eq!(report.done.len(), 3);

    let empty = backup.mapping().get("empty.py").unwrap();
    assert_eq!(empty.len(), 1);
    assert_eq!(empty[0].plain_size, 0);
    assert!(empty[0].cipher_size > 0);
    assert!(!fx.sink.blob(empty[0].piece_name.as_str()).unwrap().is_empty());

    assert_eq!(backup.mapping().get("exact.py").unwrap().len(), 1);
    assert_eq!(backup.mapping().get("over.py").unwrap().len(), 2);

    assert!(backup.retrieve_bytes("empty.py").await.unwrap().is_empty());
    assert_eq!(
        backup.retrieve_bytes("over.py").await.unwrap(),
        content(THRESHOLD as usize + 1, 4)
    );
}

#[tokio::test]
async fn fernet_round_trip_through_directory_sink() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("src");
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("docs/readme.md"), content(4500, 5)).unwrap();
    std::fs::write(root.join(".hidden"), b"dotfile at the root").unwrap();

    let sink_root = dir.path().join("sink");
    let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
    let codec = ChunkCodec::with_clock(unit_key(), Algorithm::Fernet, clock.clone());
    let mut backup = EncryptedBackup::new(
        FileTreeNode::new(&root, ".*", None).unwrap(),
        codec,
        FileTransfer::new(&sink_root),
        dir.path().join("status.txt"),
        dir.path().join("map.txt"),
        options(1),
    )
    .unwrap()
    .with_clock(clock);

    let report = backup.start_transfering(None).await.unwrap();
    assert_eq!(report.done.len(), 2);

    let pieces = backup.mapping().get("docs/readme.md").unwrap().to_vec();
    assert_eq!(pieces.len(), 3);
    assert!(pieces.iter().all(|p| p.algorithm == Algorithm::Fernet));
    let blob = std::fs::read(sink_root.join(pieces[0].piece_name.as_str())).unwrap();
    assert!(fernet::looks_like_token(&blob));
    assert_eq!(fernet::timestamp_of(&blob), Some(1_700_000_000));

    // a codec configured for AES still reads fernet pieces
    drop(backup);
    let mut reader = EncryptedBackup::new(
        FileTreeNode::new(&root, ".*", None).unwrap(),
        ChunkCodec::new(unit_key(), Algorithm::Aes),
        FileTransfer::new(&sink_root),
        dir.path().join("status.txt"),
        dir.path().join("map.txt"),
        options(1),
    )
    .unwrap();
    let restore = dir.path().join("restore");
    let restored = reader.retrieve_all(&restore, "").await.unwrap();
    assert_eq!(restored.restored.len(), 2);
    assert_eq!(
        std::fs::read(restore.join("docs/readme.md")).unwrap(),
        content(4500, 5)
    );
}

#[tokio::test]
async fn second_run_on_same_state_is_locked_out() {
    let (fx, _backup) = baseline().await;

    let second = EncryptedBackup::new(
        FileTreeNode::new(fx.root(), ".*", None).unwrap(),
        ChunkCodec::new(unit_key(), Algorithm::Aes),
        Arc::clone(&fx.sink),
        fx.status_file(),
        fx.mapping_file(),
        options(3),
    );
    match second {
        Err(e @ Error::Locked(_)) => assert_eq!(e.kind(), ErrorKind::Config),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("second run was not locked out"),
    }
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_state() {
    let files = [("a.py", 700usize, 1u8), ("b.py", 4100, 2), ("c.py", 10, 3)];

    let uninterrupted = Fixture::new();
    for (name, len, seed) in files {
        set_mtime(&uninterrupted.write(name, &content(len, seed)), 1_600_000_000);
    }
    let mut clean = uninterrupted.open();
    clean.start_transfering(None).await.unwrap();
    let expected = clean.mapping().serialize();

    let interrupted = Fixture::new();
    for (name, len, seed) in files {
        set_mtime(&interrupted.write(name, &content(len, seed)), 1_600_000_000);
    }

    // Stop the first run between the second and third piece of b.py
    let mut first = interrupted.open_with(
        r".*\.py$",
        BackupOptions {
            max_issues: Some(1),
            ..options(0)
        },
    );
    interrupted.sink.fail_next(
        TransferOp::Put,
        Some(interrupted.piece("b.py", 2).as_str()),
        1,
        FailureKind::Fatal,
    );
    let partial = first.start_transfering(None).await.unwrap();
    assert_eq!(partial.done, vec!["a.py"]);
    assert!(partial.stopped_early);
    assert!(!first.mapping().contains("b.py"));
    drop(first);

    let mut resumed = interrupted.open();
    interrupted.sink.clear_log();
    let report = resumed.start_transfering(None).await.unwrap();
    assert_eq!(report.done, vec!["b.py", "c.py"]);
    assert!(interrupted
        .sink
        .put_attempts()
        .iter()
        .all(|name| !name.contains(&cryptmirror::crypto::sha1_hex(b"a.py"))));

    assert_eq!(resumed.mapping().serialize(), expected);
    for (name, len, seed) in files {
        assert_eq!(resumed.retrieve_bytes(name).await.unwrap(), content(len, seed));
    }
}

#[tokio::test]
async fn state_files_survive_reload() {
    let (fx, backup) = baseline().await;
    let serialized = backup.mapping().serialize();
    drop(backup);

    let mapping = MappingStore::load(fx.mapping_file()).unwrap();
    assert_eq!(mapping.serialize(), serialized);

    let status = StatusStore::load(fx.status_file()).unwrap();
    assert_eq!(status.len(), 2);
    let record = status.get("b.py").unwrap();
    assert_eq!(record.plain_size, 5000);
    assert_eq!(record.last_transfer, 1_700_000_000);
}

#[tokio::test]
async fn windows_style_paths_resolve() {
    let fx = Fixture::new();
    fx.write("pkg/mod.py", b"x = 1\n");

    let mut backup = fx.open();
    backup.start_transfering(None).await.unwrap();
    assert!(backup.mapping().contains("pkg/mod.py"));
    assert_eq!(backup.retrieve_bytes(r"pkg\mod.py").await.unwrap(), b"x = 1\n");
}

/// Memory sink that removes a source file on the first put, the way a
/// concurrent cleanup would between listing and reading
struct DeleteOnFirstPut {
    inner: Arc<MemoryTransfer>,
    victim: PathBuf,
}

#[async_trait]
impl TransferApi for DeleteOnFirstPut {
    fn name(&self) -> &str {
        "delete-on-put"
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        if self.victim.exists() {
            std::fs::remove_file(&self.victim).unwrap();
        }
        self.inner.put(name, data).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.get(name).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_prefix(prefix).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(name).await
    }
}

#[tokio::test]
async fn file_removed_mid_run_is_skipped() {
    let fx = Fixture::new();
    fx.write("a.py", &content(120, 1));
    let victim = fx.write("b.py", &content(300, 2));
    fx.write("c.py", &content(50, 3));

    let sink = DeleteOnFirstPut {
        inner: Arc::clone(&fx.sink),
        victim: victim.clone(),
    };
    let mut backup = EncryptedBackup::new(
        FileTreeNode::new(fx.root(), r".*\.py$", None).unwrap(),
        ChunkCodec::new(unit_key(), Algorithm::Aes),
        sink,
        fx.status_file(),
        fx.mapping_file(),
        options(3),
    )
    .unwrap()
    .with_clock(Arc::new(ManualClock::at_epoch(1_700_000_000)));

    let report = backup.start_transfering(None).await.unwrap();
    assert!(!victim.exists());
    assert_eq!(report.done, vec!["a.py", "c.py"]);
    assert!(report.issues.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(!backup.mapping().contains("b.py"));
    assert!(!fx.sink.contains(fx.piece("b.py", 0).as_str()));
    drop(backup);

    let status = StatusStore::load(fx.status_file()).unwrap();
    let record = status.get("b.py").unwrap();
    assert_eq!(record.outcome, Outcome::Skipped);
    assert_eq!(record.last_transfer, 1_700_000_000);
    assert_eq!(status.get("c.py").unwrap().outcome, Outcome::Ok);
}

#[tokio::test]
async fn two_keys_share_one_sink() {
    let fx = Fixture::new();
    fx.write("a.py", &content(120, 1));
    fx.write("b.py", &content(5000, 2));
    let other_key = || BackupKey::from_bytes(&[9u8; 32]).unwrap();
    assert_ne!(unit_key().fingerprint(), other_key().fingerprint());

    let mut first = fx.open();
    first.start_transfering(None).await.unwrap();
    let first_blobs: BTreeMap<String, Vec<u8>> = fx
        .sink
        .list_prefix("")
        .await
        .unwrap()
        .into_iter()
        .map(|name| {
            let blob = fx.sink.blob(&name).unwrap();
            (name, blob)
        })
        .collect();
    assert!(first_blobs.contains_key(&mapping_blob_name(unit_key().fingerprint())));

    let mut second = EncryptedBackup::new(
        FileTreeNode::new(fx.root(), r".*\.py$", None).unwrap(),
        ChunkCodec::new(other_key(), Algorithm::Aes),
        Arc::clone(&fx.sink),
        fx.dir.path().join("other/status.txt"),
        fx.dir.path().join("other/map.txt"),
        options(3),
    )
    .unwrap();
    let report = second.start_transfering(None).await.unwrap();
    assert_eq!(report.done, vec!["a.py", "b.py"]);

    // nothing the first key wrote was touched
    for (name, blob) in &first_blobs {
        assert_eq!(fx.sink.blob(name).as_ref(), Some(blob), "{} overwritten", name);
    }
    let second_prefix = format!("{}/", other_key().fingerprint());
    let second_names = fx.sink.list_prefix(&second_prefix).await.unwrap();
    assert_eq!(second_names.len(), 1 + 3 + 1);
    assert!(second_names.contains(&mapping_blob_name(other_key().fingerprint())));
    assert_eq!(fx.sink.len(), first_blobs.len() + second_names.len());

    for local_path in ["a.py", "b.py"] {
        let original = std::fs::read(fx.root().join(local_path)).unwrap();
        assert_eq!(first.retrieve_bytes(local_path).await.unwrap(), original);
        assert_eq!(second.retrieve_bytes(local_path).await.unwrap(), original);
    }
    assert_ne!(
        first.mapping().get("b.py").unwrap()[0].piece_name,
        second.mapping().get("b.py").unwrap()[0].piece_name
    );
}
