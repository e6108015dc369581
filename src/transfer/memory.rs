//! In-memory sink
//!
//! Blobs live in a map behind a lock, so every method works on `&self`.
//! Besides being a real (if volatile) sink, it records every operation and
//! can be told to fail specific calls, which is what the backup tests drive.

use super::{validate_name, TransferApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

/// Operations recorded by [`MemoryTransfer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOp {
    Connect,
    Close,
    Put,
    Get,
    List,
    Remove,
}

/// What an injected failure looks like to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retriable transport error
    Transient,
    /// Fatal error, connection still usable
    Fatal,
    /// Fatal error that drops the connection
    ConnectionLost,
}

#[derive(Debug)]
struct FailureRule {
    op: TransferOp,
    name: Option<String>,
    remaining: usize,
    kind: FailureKind,
}

/// Volatile sink with an operation log and failure injection
#[derive(Debug, Default)]
pub struct MemoryTransfer {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    log: Mutex<Vec<(TransferOp, String)>>,
    rules: Mutex<Vec<FailureRule>>,
    open: Mutex<usize>,
}

impl MemoryTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail, optionally only for `name`
    pub fn fail_next(&self, op: TransferOp, name: Option<&str>, times: usize, kind: FailureKind) {
        self.rules.lock().push(FailureRule {
            op,
            name: name.map(str::to_string),
            remaining: times,
            kind,
        });
    }

    /// Every `put` attempted so far, failed ones included, in call order
    pub fn put_attempts(&self) -> Vec<String> {
        self.attempts(TransferOp::Put)
    }

    /// Number of `put` attempts for one name
    pub fn put_attempts_for(&self, name: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(op, n)| *op == TransferOp::Put && n == name)
            .count()
    }

    pub fn attempts(&self, op: TransferOp) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Successful connects not yet matched by a close
    pub fn open_connections(&self) -> usize {
        *self.open.lock()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Stored blob, bypassing the log and failure rules
    pub fn blob(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(name).cloned()
    }

    /// Overwrite a blob directly
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.blobs.write().insert(name.to_string(), data);
    }

    /// Delete a blob directly
    pub fn discard(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.write().remove(name)
    }

    /// Record the call and apply the first matching failure rule
    fn enter(&self, op: TransferOp, name: &str) -> Result<()> {
        self.log.lock().push((op, name.to_string()));

        let mut rules = self.rules.lock();
        let Some(idx) = rules.iter().position(|rule| {
            rule.op == op && rule.remaining > 0 && rule.name.as_deref().map_or(true, |n| n == name)
        }) else {
            return Ok(());
        };

        let rule = &mut rules[idx];
        rule.remaining -= 1;
        let kind = rule.kind;
        if rule.remaining == 0 {
            rules.remove(idx);
        }

        let message = format!("injected {:?} failure for {:?} {}", kind, op, name);
        Err(match kind {
            FailureKind::Transient => Error::Transport(message),
            FailureKind::Fatal => Error::fatal(message),
            FailureKind::ConnectionLost => Error::connection_lost(message),
        })
    }
}

#[async_trait]
impl TransferApi for MemoryTransfer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        self.enter(TransferOp::Connect, "")?;
        *self.open.lock() += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push((TransferOp::Close, String::new()));
        let mut open = self.open.lock();
        *open = open.saturating_sub(1);
        Ok(())
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        self.enter(TransferOp::Put, name)?;
        self.blobs.write().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.enter(TransferOp::Get, name)?;
        self.blobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.enter(TransferOp::List, prefix)?;
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.enter(TransferOp::Remove, name)?;
        self.blobs.write().remove(name);
        Ok(())
    }
}
