//! Persistence hooks for collaboration hubs.
//!
//! ```text
//!  hub start ──► bind(name, doc)            load stored state into the doc
//!  commit    ──► persist_update(name, doc, update)
//!  hub stop  ──► unbind(name, doc)          snapshot + compaction
//! ```
//!
//! `bind` runs before the hub subscribes to document updates, so state loaded
//! there is neither persisted again nor broadcast. Hooks run on the hub task
//! and reach the document through the blocking [`DocumentActor`] calls.
//!
//! Errors are logged by the hub and never reach observers. An adapter whose
//! `bind` failed must not overwrite or compact what it could not load.

pub mod memory;
pub mod rocks;

pub use memory::MemoryPersistence;
pub use rocks::{DocumentMetadata, DocumentStore, RocksPersistence, StoreConfig, StoreError};

use crate::actor::{ActorError, ApplyError, DocumentActor};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("document actor error: {0}")]
    Actor(#[from] ActorError),

    #[error("stored update rejected: {0}")]
    Apply(#[from] ApplyError),

    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// Storage adapter owned by one hub. Every hook defaults to a no-op.
pub trait Persistence: Send + 'static {
    /// Load stored state for `doc_name` into `doc`.
    fn bind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        let _ = (doc_name, doc);
        Ok(())
    }

    /// Record one committed update.
    fn persist_update(
        &mut self,
        doc_name: &str,
        doc: &DocumentActor,
        update: &[u8],
    ) -> Result<(), PersistenceError> {
        let _ = (doc_name, doc, update);
        Ok(())
    }

    /// Called once when the hub shuts down, while the document is still alive.
    fn unbind(&mut self, doc_name: &str, doc: &DocumentActor) -> Result<(), PersistenceError> {
        let _ = (doc_name, doc);
        Ok(())
    }
}

/// Apply stored updates to `doc` in a single transaction, oldest first.
///
/// A record that fails to decode or integrate is logged and skipped, so one
/// bad record never hides the ones after it. Returns how many were skipped.
pub(crate) fn replay(
    doc: &DocumentActor,
    doc_name: &str,
    updates: Vec<Vec<u8>>,
) -> Result<usize, PersistenceError> {
    if updates.is_empty() {
        return Ok(0);
    }
    let name = doc_name.to_string();
    let skipped = doc.transaction(None, move |txn| {
        let mut skipped = 0;
        for (index, update) in updates.iter().enumerate() {
            if let Err(e) = txn.apply_update(update) {
                log::warn!("{name}: skipping stored update #{index}: {e}");
                skipped += 1;
            }
        }
        skipped
    })?;
    Ok(skipped)
}

/// Full document state as one update.
pub(crate) fn snapshot(doc: &DocumentActor) -> Result<Vec<u8>, PersistenceError> {
    Ok(doc.run(|ctx| ctx.encode_state_as_update(None))??)
}
