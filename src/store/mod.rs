//! Persistent, cross-process session registry.
//!
//! All sessions live in one JSON document, `{"sessions": {"<name>": {...}}}`,
//! at a configurable path under the per-user config directory. Every
//! operation takes the host-wide store lock, reads the full document,
//! mutates, and writes it back atomically (temp file + rename), so a
//! concurrent reader always observes a complete document and operations are
//! totally ordered across processes.
//!
//! A missing or unparseable document is reinitialized to an empty map with a
//! warning rather than failing: the registry self-heals against external
//! corruption.

pub mod lock;
pub mod record;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::process::ProcessInspector;
use lock::StoreLock;
pub use record::{SessionRecord, SessionStatus, SessionUpdate, DEFAULT_TASK_FILE};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionDocument {
    sessions: BTreeMap<String, SessionRecord>,
}

/// What to do with Running records whose owner pid is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Set status to Stale, keep the record.
    Mark,
    /// Delete the record.
    Remove,
}

/// Lock-guarded, file-backed map from session name to record.
pub struct StateStore {
    config: StoreConfig,
    lock: StoreLock,
    inspector: Arc<dyn ProcessInspector>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state_file", &self.config.state_file)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Creates a store over the configured paths. Directories are created
    /// on demand; nothing is touched until the first operation.
    #[must_use]
    pub fn new(config: StoreConfig, inspector: Arc<dyn ProcessInspector>) -> Self {
        let lock = StoreLock::new(config.lock_file.clone(), config.lock_timeout);
        Self {
            config,
            lock,
            inspector,
        }
    }

    /// The resolved configuration this store was built with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Looks up one record by name.
    pub fn get(&self, name: &str) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.acquire(self.inspector.as_ref())?;
        let doc = self.load_document();
        Ok(doc.sessions.get(name).cloned())
    }

    /// Read-modify-write merge: loads the existing record (or creates an
    /// empty one named `name`), applies the patch, persists. Unsupplied
    /// fields are preserved.
    pub fn upsert(&self, name: &str, update: SessionUpdate) -> Result<SessionRecord> {
        let _guard = self.lock.acquire(self.inspector.as_ref())?;
        let mut doc = self.load_document();
        let record = doc
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| SessionRecord::new(name, ""));
        update.apply(record);
        let result = record.clone();
        self.save_document(&doc)?;
        Ok(result)
    }

    /// All records, sorted by name.
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let _guard = self.lock.acquire(self.inspector.as_ref())?;
        let doc = self.load_document();
        Ok(doc.sessions.into_values().collect())
    }

    /// Removes a record. Returns false if the name was absent.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.acquire(self.inspector.as_ref())?;
        let mut doc = self.load_document();
        let removed = doc.sessions.remove(name).is_some();
        if removed {
            self.save_document(&doc)?;
        }
        Ok(removed)
    }

    /// Reconciles Running records against process reality: any whose
    /// recorded pid is dead is marked Stale or removed, per `mode`. Returns
    /// the affected names.
    ///
    /// Running records with no recorded pid are left untouched; a session
    /// may simply not have been assigned its pid yet.
    pub fn cleanup_stale(&self, mode: CleanupMode) -> Result<Vec<String>> {
        let _guard = self.lock.acquire(self.inspector.as_ref())?;
        let mut doc = self.load_document();

        let dead: Vec<String> = doc
            .sessions
            .iter()
            .filter(|(_, r)| r.status == SessionStatus::Running)
            .filter(|(_, r)| matches!(r.pid, Some(pid) if !self.inspector.is_alive(pid)))
            .map(|(name, _)| name.clone())
            .collect();

        if dead.is_empty() {
            return Ok(dead);
        }

        for name in &dead {
            match mode {
                CleanupMode::Mark => {
                    if let Some(record) = doc.sessions.get_mut(name) {
                        record.status = SessionStatus::Stale;
                    }
                }
                CleanupMode::Remove => {
                    doc.sessions.remove(name);
                }
            }
        }
        self.save_document(&doc)?;
        Ok(dead)
    }

    /// Loads the document, reinitializing to empty on any corruption.
    fn load_document(&self) -> SessionDocument {
        let path = &self.config.state_file;
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return SessionDocument::default();
            }
            Err(e) => {
                warn!("Failed to read state file {}: {e}", path.display());
                return SessionDocument::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "Corrupted state file at {}: {e}. Reinitializing to an empty registry.",
                    path.display()
                );
                SessionDocument::default()
            }
        }
    }

    /// Writes the document to a temp file in the target directory, then
    /// renames it into place. Rename is the only step a concurrent reader
    /// can observe.
    fn save_document(&self, doc: &SessionDocument) -> Result<()> {
        let path = &self.config.state_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = tmp_path_for(path);
        let json = serde_json::to_string_pretty(doc)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    std::path::PathBuf::from(name)
}
