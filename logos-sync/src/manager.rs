//! Hub manager: maps document names to collaboration hubs.
//!
//! Each document gets its own hub, created on first reference, so documents
//! are isolated from each other. Hubs that exited (idle timeout or `stop`)
//! are replaced transparently on the next lookup.
//!
//! Creation is serialized per name through a slot lock, never through the map
//! lock, so a hub that is slow to unbind or load never stalls other documents.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::actor::ActorError;
use crate::hub::{CollaborationHub, HubConfig, HubError};
use crate::persistence::Persistence;

/// Builds the persistence adapter for a newly created hub.
pub type PersistenceFactory = Arc<dyn Fn(&str) -> Option<Box<dyn Persistence>> + Send + Sync>;

pub struct HubManager {
    hubs: Arc<RwLock<HashMap<String, CollaborationHub>>>,
    /// Names with a creation in progress
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: HubConfig,
    persistence: Option<PersistenceFactory>,
}

impl HubManager {
    pub fn new(config: HubConfig, persistence: Option<PersistenceFactory>) -> Self {
        Self {
            hubs: Arc::new(RwLock::new(HashMap::new())),
            slots: Mutex::new(HashMap::new()),
            config,
            persistence,
        }
    }

    /// Get the live hub for `name`, spawning one if needed.
    pub async fn get_or_create(&self, name: &str) -> Result<CollaborationHub, HubError> {
        // Fast path: read lock
        if let Some(hub) = self.get(name).await {
            return Ok(hub);
        }

        let slot = self
            .slots
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone();
        let result = {
            let _creating = slot.lock().await;
            self.create(name).await
        };

        let mut slots = self.slots.lock().await;
        // Only the map and this call still hold the slot.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(name);
        }
        result
    }

    async fn create(&self, name: &str) -> Result<CollaborationHub, HubError> {
        let stale = {
            let mut hubs = self.hubs.write().await;
            // Double-check: another caller may have finished first
            if let Some(hub) = hubs.get(name).filter(|hub| !hub.is_closed()) {
                return Ok(hub.clone());
            }
            hubs.remove(name)
        };
        if let Some(stale) = stale {
            // Let the old hub finish unbinding before its successor binds.
            stale.closed().await;
        }

        let persistence = self.persistence.as_ref().and_then(|factory| factory(name));
        let config = self.config.clone();
        let owned = name.to_string();
        // Binding loads stored state through blocking document calls.
        let hub = tokio::task::spawn_blocking(move || {
            CollaborationHub::spawn(owned, config, persistence)
        })
        .await
        .map_err(|e| HubError::Actor(ActorError::Spawn(e.to_string())))??;

        self.hubs.write().await.insert(name.to_string(), hub.clone());
        Ok(hub)
    }

    /// The live hub for `name`, if any.
    pub async fn get(&self, name: &str) -> Option<CollaborationHub> {
        let hubs = self.hubs.read().await;
        hubs.get(name).filter(|hub| !hub.is_closed()).cloned()
    }

    /// Number of live hubs.
    pub async fn hub_count(&self) -> usize {
        self.hubs.read().await.values().filter(|hub| !hub.is_closed()).count()
    }

    /// Names of documents with a live hub, sorted.
    pub async fn active_documents(&self) -> Vec<String> {
        let hubs = self.hubs.read().await;
        let mut names: Vec<String> = hubs
            .iter()
            .filter(|(_, hub)| !hub.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Forget hubs that have exited. Returns how many were removed.
    pub async fn remove_closed(&self) -> usize {
        let mut hubs = self.hubs.write().await;
        let before = hubs.len();
        hubs.retain(|_, hub| !hub.is_closed());
        before - hubs.len()
    }

    /// Stop every hub and wait for each to finish shutting down.
    pub async fn shutdown(&self) {
        let hubs: Vec<CollaborationHub> = self.hubs.write().await.drain().map(|(_, hub)| hub).collect();
        for hub in &hubs {
            hub.stop();
        }
        for hub in &hubs {
            hub.closed().await;
        }
        log::info!("hub manager: {} hubs stopped", hubs.len());
    }
}
