//! Persistent experiment store with compare-and-set on status.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::atomic::write_atomic;
use super::init::ChaosPaths;
use super::journal::{JournalEntry, append_entry};
use crate::core::invariants::{check_producer_fields_unchanged, validate_id};
use crate::core::status::ExperimentStatus;
use crate::core::types::ExperimentRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid experiment id: {0}")]
    InvalidId(String),
    #[error("experiment '{id}': producer-owned fields changed: {}", .errors.join("; "))]
    Immutable { id: String, errors: Vec<String> },
    #[error("store lock {0} is busy")]
    LockTimeout(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// Persisted status differed from the expected one; nothing was written.
    Conflict { actual: ExperimentStatus },
    Missing,
}

/// Durable experiment storage.
///
/// All writes after `insert` go through `compare_and_set`, which succeeds only
/// when the persisted status still equals `expected`.
pub trait ExperimentStore: Send + Sync {
    fn insert(&self, record: &ExperimentRecord) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError>;
    /// All records ordered by id.
    fn list(&self) -> Result<Vec<ExperimentRecord>, StoreError>;
    fn compare_and_set(
        &self,
        expected: ExperimentStatus,
        next: &ExperimentRecord,
    ) -> Result<CasOutcome, StoreError>;
}

fn check_update(current: &ExperimentRecord, next: &ExperimentRecord) -> Result<(), StoreError> {
    let errors = check_producer_fields_unchanged(current, next);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Immutable {
            id: current.id.clone(),
            errors,
        })
    }
}

/// Records under `.chaos/experiments/<id>.json`.
///
/// A lock file serializes the read-compare-write section across processes.
/// Every applied transition is also appended to `.chaos/journal/<id>.jsonl`.
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: ChaosPaths,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release store lock");
        }
    }
}

impl FileStore {
    pub fn new(paths: ChaosPaths) -> Self {
        Self {
            paths,
            lock_timeout: Duration::from_secs(10),
            stale_lock_after: Duration::from_secs(60),
        }
    }

    pub fn paths(&self) -> &ChaosPaths {
        &self.paths
    }

    fn lock(&self) -> Result<LockGuard, StoreError> {
        let path = self.paths.lock_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let started = SystemTime::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        warn!(path = %path.display(), "removing stale store lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    let waited = started.elapsed().unwrap_or_default();
                    if waited >= self.lock_timeout {
                        return Err(StoreError::LockTimeout(path.display().to_string()));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("create lock {}", path.display()))
                        .into());
                }
            }
        }
    }

    fn lock_is_stale(&self, path: &std::path::Path) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.stale_lock_after)
    }

    fn read(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError> {
        validate_id(id).map_err(StoreError::InvalidId)?;
        let path = self.paths.experiment_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("read experiment {}", path.display()))
                    .into());
            }
        };
        let record = serde_json::from_str(&contents)
            .with_context(|| format!("parse experiment {}", path.display()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &ExperimentRecord) -> Result<(), StoreError> {
        let mut buf = serde_json::to_string_pretty(record).context("serialize experiment")?;
        buf.push('\n');
        write_atomic(&self.paths.experiment_path(&record.id), buf.as_bytes())?;
        Ok(())
    }
}

impl ExperimentStore for FileStore {
    #[instrument(skip_all, fields(id = %record.id))]
    fn insert(&self, record: &ExperimentRecord) -> Result<(), StoreError> {
        validate_id(&record.id).map_err(StoreError::InvalidId)?;
        let _guard = self.lock()?;
        if self.paths.experiment_path(&record.id).exists() {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        self.write(record)?;
        debug!("experiment inserted");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError> {
        self.read(id)
    }

    fn list(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        let dir = &self.paths.experiments_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
            let path = entry.with_context(|| format!("list {}", dir.display()))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.read(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    #[instrument(skip_all, fields(id = %next.id, expected = %expected, next = %next.status))]
    fn compare_and_set(
        &self,
        expected: ExperimentStatus,
        next: &ExperimentRecord,
    ) -> Result<CasOutcome, StoreError> {
        let _guard = self.lock()?;
        let Some(current) = self.read(&next.id)? else {
            return Ok(CasOutcome::Missing);
        };
        if current.status != expected {
            debug!(actual = %current.status, "compare-and-set conflict");
            return Ok(CasOutcome::Conflict {
                actual: current.status,
            });
        }
        check_update(&current, next)?;
        self.write(next)?;
        let journal = self.paths.journal_path(&next.id);
        let already = current.transitions.len().min(next.transitions.len());
        for transition in &next.transitions[already..] {
            append_entry(&journal, &JournalEntry::from_transition(&next.id, transition))?;
        }
        Ok(CasOutcome::Applied)
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ExperimentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ExperimentRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("memory store mutex poisoned")))
    }
}

impl ExperimentStore for MemoryStore {
    fn insert(&self, record: &ExperimentRecord) -> Result<(), StoreError> {
        validate_id(&record.id).map_err(StoreError::InvalidId)?;
        let mut records = self.records()?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError> {
        Ok(self.records()?.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        Ok(self.records()?.values().cloned().collect())
    }

    fn compare_and_set(
        &self,
        expected: ExperimentStatus,
        next: &ExperimentRecord,
    ) -> Result<CasOutcome, StoreError> {
        let mut records = self.records()?;
        let Some(current) = records.get(&next.id) else {
            return Ok(CasOutcome::Missing);
        };
        if current.status != expected {
            return Ok(CasOutcome::Conflict {
                actual: current.status,
            });
        }
        check_update(current, next)?;
        records.insert(next.id.clone(), next.clone());
        Ok(CasOutcome::Applied)
    }
}
