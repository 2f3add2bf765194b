//! In-memory persistence, shared by every hub created from the same instance.
//!
//! Useful for tests and for servers that only need state to outlive
//! idle shutdowns, not process restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{replay, snapshot, Persistence, PersistenceError};
use crate::actor::DocumentActor;

/// Update log per document name. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    log: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
    /// Set when `bind` failed; the log is then append-only for this instance.
    load_failed: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored updates for a document, oldest first.
    pub fn updates(&self, doc_name: &str) -> Vec<Vec<u8>> {
        self.lock()
            .map(|log| log.get(doc_name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn document_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|log| log.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>>, PersistenceError> {
        self.log
            .lock()
            .map_err(|_| PersistenceError::Backend("update log lock poisoned".into()))
    }
}

impl Persistence for MemoryPersistence {
    fn bind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        self.load_failed = true;
        let updates = self.lock()?.get(doc_name).cloned().unwrap_or_default();
        log::debug!("replaying {} stored updates into {doc_name}", updates.len());
        let skipped = replay(doc, doc_name, updates)?;
        if skipped > 0 {
            log::warn!("{doc_name}: {skipped} stored updates could not be applied");
        }
        self.load_failed = false;
        Ok(())
    }

    fn persist_update(
        &mut self,
        doc_name: &str,
        _doc: &DocumentActor,
        update: &[u8],
    ) -> Result<(), PersistenceError> {
        self.lock()?
            .entry(doc_name.to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    /// Compact the log into a single snapshot update.
    fn unbind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        if self.load_failed {
            return Err(PersistenceError::Backend(format!(
                "{doc_name} was never loaded, keeping its log uncompacted"
            )));
        }
        let state = snapshot(doc)?;
        self.lock()?.insert(doc_name.to_string(), vec![state]);
        Ok(())
    }
}
