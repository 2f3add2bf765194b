//! Per-document collaboration hub.
//!
//! Architecture:
//! ```text
//! transport A ──┐  process_message / observe / unobserve
//!               ├──────────► hub task ──── run / transaction ────► DocumentActor
//! transport B ──┘               ▲  │                                  │
//!                               │  │ BroadcastGroup (no echo)         │
//!                               │  ▼                                  │
//!                 encoded SyncUpdate / Awareness ◄──── DocEvent ──────┘
//!                                                  │
//!                                                  └──► Persistence::persist_update
//! ```
//!
//! The hub task owns the observer set, the awareness ownership table, the
//! persistence adapter and the idle deadline. Handles talk to it over a command
//! channel; document events arrive on a second channel and are handled first,
//! so broadcasts go out in commit order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::actor::{ActorError, ApplyError, DocEvent, DocOptions, DocumentActor, Origin};
use crate::awareness::ClientId;
use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::persistence::Persistence;
use crate::protocol::{DecodeError, EncodeError, Message};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Handle awareness messages and broadcast presence changes
    pub awareness: bool,
    /// Shut down after `idle_timeout` without observers
    pub auto_exit: bool,
    /// Grace period before an unobserved hub exits
    pub idle_timeout: Duration,
    /// Expire remote awareness entries not refreshed within this window
    pub awareness_timeout: Option<Duration>,
    /// How often closed observers and stale awareness are swept.
    /// Values below one millisecond are raised to one millisecond.
    pub sweep_interval: Duration,
    /// Options for the document engine
    pub doc: DocOptions,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            awareness: true,
            auto_exit: true,
            idle_timeout: Duration::from_secs(10),
            awareness_timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
            doc: DocOptions::default(),
        }
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub observers: usize,
    pub messages_processed: u64,
    pub updates_broadcast: u64,
    pub awareness_broadcast: u64,
    pub persisted_updates: u64,
    pub persistence_errors: u64,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("cannot encode reply: {0}")]
    Encode(#[from] EncodeError),

    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("malformed awareness update: {0}")]
    Awareness(#[source] DecodeError),

    #[error("unsupported message: {0}")]
    UnknownMessage(&'static str),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("hub has stopped")]
    Stopped,
}

type Outbound = mpsc::UnboundedReceiver<Arc<Vec<u8>>>;

enum Command {
    Process {
        bytes: Vec<u8>,
        origin: Origin,
        reply: oneshot::Sender<Result<Vec<Vec<u8>>, HubError>>,
    },
    Observe {
        origin: Origin,
        reply: oneshot::Sender<Outbound>,
    },
    Unobserve {
        origin: Origin,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Stop,
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct CollaborationHub {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    doc: DocumentActor,
}

impl std::fmt::Debug for CollaborationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationHub")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CollaborationHub {
    /// Start a hub for `name`. Must be called inside a tokio runtime.
    ///
    /// Stored state is loaded through `persistence.bind` before the hub starts
    /// listening for document updates.
    pub fn spawn(
        name: impl Into<String>,
        config: HubConfig,
        persistence: Option<Box<dyn Persistence>>,
    ) -> Result<Self, HubError> {
        let name = name.into();
        let doc = DocumentActor::spawn(name.clone(), config.doc.clone())?;

        let mut persistence = persistence;
        let mut stats = HubStats::default();
        if let Some(p) = persistence.as_mut() {
            match p.bind(&name, &doc) {
                Ok(()) => log::info!("hub {name}: bound to persistence"),
                Err(e) => {
                    stats.persistence_errors += 1;
                    log::error!("hub {name}: failed to load stored state: {e}");
                }
            }
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let subscribed = doc
            .monitor_update(event_tx.clone(), None)
            .and_then(|_| doc.monitor_awareness(event_tx, None));
        if let Err(e) = subscribed {
            doc.stop();
            return Err(e.into());
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let idle_deadline = config.auto_exit.then(|| Instant::now() + config.idle_timeout);
        let task = HubTask {
            name: name.clone(),
            config,
            doc: doc.clone(),
            group: BroadcastGroup::new(),
            origin_ownership: HashMap::new(),
            persistence,
            idle_deadline,
            stats,
        };
        tokio::spawn(task.run(command_rx, events));
        log::info!("hub {name}: created");

        Ok(Self { name: name.into(), commands, doc })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The document behind this hub, for server-side reads and edits.
    /// Edits made here are broadcast to every observer.
    pub fn doc(&self) -> &DocumentActor {
        &self.doc
    }

    /// Handle one inbound message from `origin` and return the direct replies.
    pub async fn process_message(
        &self,
        bytes: &[u8],
        origin: Origin,
    ) -> Result<Vec<Vec<u8>>, HubError> {
        let bytes = bytes.to_vec();
        self.request(|reply| Command::Process { bytes, origin, reply }).await?
    }

    /// Subscribe `origin` to broadcasts. Dropping the receiver counts as
    /// leaving.
    pub async fn observe(&self, origin: Origin) -> Result<Outbound, HubError> {
        self.request(|reply| Command::Observe { origin, reply }).await
    }

    /// Remove `origin` and every awareness entry it introduced. Returns
    /// whether it was observing.
    pub async fn unobserve(&self, origin: Origin) -> Result<bool, HubError> {
        self.request(|reply| Command::Unobserve { origin, reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Ask the hub to shut down after the commands already queued.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the hub has shut down and unbound its persistence.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)
    }
}

// ───────────────────────────────────────────────────────────────────
// Task
// ───────────────────────────────────────────────────────────────────

struct HubTask {
    name: String,
    config: HubConfig,
    doc: DocumentActor,
    group: BroadcastGroup,
    /// Awareness client ids introduced by each origin
    origin_ownership: HashMap<Origin, BTreeSet<ClientId>>,
    persistence: Option<Box<dyn Persistence>>,
    idle_deadline: Option<Instant>,
    stats: HubStats,
}

impl HubTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<DocEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval.max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }

                command = commands.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                _ = sleep_until(self.idle_deadline) => {
                    if self.group.is_empty() {
                        log::info!("hub {}: idle for {:?}, shutting down", self.name, self.config.idle_timeout);
                        break;
                    }
                    self.idle_deadline = None;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.shutdown();
        // Dropping the receiver last marks the handle closed only after unbind.
        drop(commands);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Process { bytes, origin, reply } => {
                self.stats.messages_processed += 1;
                let result = self.process(&bytes, origin).await;
                let _ = reply.send(result);
            }
            Command::Observe { origin, reply } => {
                let rx = self.group.add_observer(origin);
                self.idle_deadline = None;
                log::debug!("hub {}: {origin} observing ({} total)", self.name, self.group.observer_count());
                let _ = reply.send(rx);
            }
            Command::Unobserve { origin, reply } => {
                let was_observing = self.group.remove_observer(&origin);
                self.disconnect(origin).await;
                let _ = reply.send(was_observing);
            }
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.observers = self.group.observer_count();
                stats.broadcast = self.group.stats();
                let _ = reply.send(stats);
            }
            Command::Stop => {}
        }
    }

    async fn process(&mut self, bytes: &[u8], origin: Origin) -> Result<Vec<Vec<u8>>, HubError> {
        let message = Message::decode(bytes)?;
        log::debug!("hub {}: {} from {origin}", self.name, message.kind());

        match message {
            Message::SyncStep1(remote_sv) => {
                let with_awareness = self.config.awareness;
                let (diff, own_sv, snapshot) = self
                    .doc
                    .run_async(move |ctx| -> Result<_, ActorError> {
                        let diff = ctx.encode_state_as_update(Some(remote_sv.as_slice()))?;
                        let own_sv = ctx.state_vector()?;
                        let snapshot = (with_awareness && !ctx.awareness().is_empty())
                            .then(|| ctx.encode_awareness_update(None));
                        Ok((diff, own_sv, snapshot))
                    })
                    .await?
                    .map_err(|e| match e {
                        ActorError::Apply(ApplyError::InvalidStateVector(reason)) => {
                            HubError::InvalidStateVector(reason)
                        }
                        other => HubError::Actor(other),
                    })?;

                let mut replies = vec![
                    Message::SyncStep2(diff).encode()?,
                    Message::SyncStep1(own_sv).encode()?,
                ];
                if let Some(snapshot) = snapshot {
                    replies.push(Message::Awareness(snapshot).encode()?);
                }
                Ok(replies)
            }

            Message::SyncStep2(update) | Message::SyncUpdate(update) => {
                let applied = self
                    .doc
                    .transaction_async(Some(origin), move |txn| txn.apply_update(&update))
                    .await?;
                if let Err(e) = applied {
                    log::warn!("hub {}: ignoring update from {origin}: {e}", self.name);
                }
                Ok(Vec::new())
            }

            Message::Awareness(update) => {
                if !self.config.awareness {
                    return Ok(Vec::new());
                }
                let diff = self
                    .doc
                    .run_async(move |ctx| ctx.apply_awareness_update(&update, Some(origin)))
                    .await?
                    .map_err(HubError::Awareness)?;
                if !diff.added.is_empty() {
                    self.origin_ownership
                        .entry(origin)
                        .or_default()
                        .extend(diff.added.iter().copied());
                }
                Ok(Vec::new())
            }

            Message::QueryAwareness => {
                let snapshot = self
                    .doc
                    .run_async(|ctx| ctx.encode_awareness_update(None))
                    .await?;
                Ok(vec![Message::Awareness(snapshot).encode()?])
            }

            other => Err(HubError::UnknownMessage(other.kind())),
        }
    }

    async fn handle_event(&mut self, event: DocEvent) {
        match event {
            DocEvent::Update { update, origin, .. } => {
                if let Some(persistence) = self.persistence.as_mut() {
                    match persistence.persist_update(&self.name, &self.doc, &update) {
                        Ok(()) => self.stats.persisted_updates += 1,
                        Err(e) => {
                            self.stats.persistence_errors += 1;
                            log::error!("hub {}: failed to persist update: {e}", self.name);
                        }
                    }
                }
                self.stats.updates_broadcast += 1;
                self.broadcast(Message::SyncUpdate(update.to_vec()), origin).await;
            }
            DocEvent::Awareness { update, origin, .. } => {
                if self.config.awareness {
                    self.stats.awareness_broadcast += 1;
                    self.broadcast(Message::Awareness(update.to_vec()), origin).await;
                }
            }
        }
    }

    async fn broadcast(&mut self, message: Message, origin: Option<Origin>) {
        let encoded = match message.encode() {
            Ok(encoded) => Arc::new(encoded),
            Err(e) => {
                log::error!("hub {}: cannot encode {}: {e}", self.name, message.kind());
                return;
            }
        };
        let delivery = self.group.broadcast(encoded, origin.as_ref());
        log::trace!(
            "hub {}: {} delivered to {} observers",
            self.name,
            message.kind(),
            delivery.delivered
        );
        for dead in delivery.dead {
            log::warn!("hub {}: observer {dead} went away", self.name);
            self.disconnect(dead).await;
        }
    }

    /// Forget an origin: drop its awareness entries and maybe schedule exit.
    async fn disconnect(&mut self, origin: Origin) {
        if let Some(owned) = self.origin_ownership.remove(&origin) {
            let client_ids: Vec<ClientId> = owned.into_iter().collect();
            let removed = self
                .doc
                .run_async(move |ctx| ctx.remove_awareness_states(&client_ids, Some(origin)))
                .await;
            if let Err(e) = removed {
                log::warn!("hub {}: cannot clear awareness of {origin}: {e}", self.name);
            }
        }
        log::debug!("hub {}: {origin} left ({} remaining)", self.name, self.group.observer_count());

        if self.config.auto_exit && self.group.is_empty() && self.idle_deadline.is_none() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }
    }

    async fn sweep(&mut self) {
        for origin in self.group.sweep_closed() {
            log::warn!("hub {}: observer {origin} closed its channel", self.name);
            self.disconnect(origin).await;
        }

        if let (true, Some(timeout)) = (self.config.awareness, self.config.awareness_timeout) {
            if let Err(e) = self
                .doc
                .run_async(move |ctx| ctx.remove_outdated_awareness(timeout))
                .await
            {
                log::warn!("hub {}: awareness sweep failed: {e}", self.name);
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(e) = persistence.unbind(&self.name, &self.doc) {
                log::error!("hub {}: failed to store document on shutdown: {e}", self.name);
            }
        }
        self.doc.stop();
        log::info!("hub {}: stopped", self.name);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Write;
    use serde_json::json;
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

    fn quiet() -> HubConfig {
        HubConfig {
            auto_exit: false,
            ..HubConfig::default()
        }
    }

    fn client_edit(doc: &Doc, s: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.push(&mut txn, s);
        txn.encode_update_v1()
    }

    #[tokio::test]
    async fn test_handshake_reply_shape() {
        let hub = CollaborationHub::spawn("handshake", quiet(), None).unwrap();
        let step1 = Message::sync_step1(vec![0]).encode().unwrap();
        let replies = hub.process_message(&step1, Origin::new()).await.unwrap();

        // No awareness known yet: only the two sync messages.
        assert_eq!(replies.len(), 2);
        assert!(matches!(Message::decode(&replies[0]).unwrap(), Message::SyncStep2(_)));
        assert!(matches!(Message::decode(&replies[1]).unwrap(), Message::SyncStep1(_)));
    }

    #[tokio::test]
    async fn test_handshake_converges() {
        let hub = CollaborationHub::spawn("converge", quiet(), None).unwrap();
        let seed = Doc::new();
        let update = client_edit(&seed, "hello");
        hub.process_message(&Message::sync_update(update).encode().unwrap(), Origin::new())
            .await
            .unwrap();

        let client = Doc::new();
        let sv = client.transact().state_vector().encode_v1();
        let replies = hub
            .process_message(&Message::sync_step1(sv).encode().unwrap(), Origin::new())
            .await
            .unwrap();
        let Message::SyncStep2(diff) = Message::decode(&replies[0]).unwrap() else {
            panic!("expected step 2");
        };
        client
            .transact_mut()
            .apply_update(Update::decode_v1(&diff).unwrap())
            .unwrap();

        let text = client.get_or_insert_text("content");
        assert_eq!(text.get_string(&client.transact()), "hello");

        let hub_state = hub
            .doc()
            .run_async(|ctx| ctx.encode_state_as_update(None))
            .await
            .unwrap()
            .unwrap();
        let client_state = client.transact().encode_diff_v1(&StateVector::default());
        assert_eq!(hub_state, client_state);
    }

    #[tokio::test]
    async fn test_invalid_state_vector() {
        let hub = CollaborationHub::spawn("bad-sv", quiet(), None).unwrap();
        let step1 = Message::sync_step1(vec![0xFF]).encode().unwrap();
        let err = hub.process_message(&step1, Origin::new()).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidStateVector(_)));
    }

    #[tokio::test]
    async fn test_invalid_update_is_noop() {
        let hub = CollaborationHub::spawn("bad-update", quiet(), None).unwrap();
        let msg = Message::sync_update(vec![1, 2, 3]).encode().unwrap();
        assert!(hub.process_message(&msg, Origin::new()).await.unwrap().is_empty());
        assert_eq!(hub.stats().await.unwrap().updates_broadcast, 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages() {
        let hub = CollaborationHub::spawn("unknown", quiet(), None).unwrap();
        let auth = Message::Auth(b"token".to_vec()).encode().unwrap();
        assert!(matches!(
            hub.process_message(&auth, Origin::new()).await,
            Err(HubError::UnknownMessage("auth"))
        ));
        assert!(matches!(
            hub.process_message(&[99, 0], Origin::new()).await,
            Err(HubError::Decode(DecodeError::UnknownMessageTag(99)))
        ));
        let bad_awareness = Message::Awareness(vec![1]).encode().unwrap();
        assert!(matches!(
            hub.process_message(&bad_awareness, Origin::new()).await,
            Err(HubError::Awareness(_))
        ));
    }

    #[tokio::test]
    async fn test_query_awareness_snapshot() {
        let hub = CollaborationHub::spawn("query", quiet(), None).unwrap();
        hub.doc()
            .run_async(|ctx| ctx.set_local_state(json!({"server": true})))
            .await
            .unwrap();
        let query = Message::QueryAwareness.encode().unwrap();
        let replies = hub.process_message(&query, Origin::new()).await.unwrap();
        let Message::Awareness(blob) = Message::decode(&replies[0]).unwrap() else {
            panic!("expected awareness");
        };
        let mut mirror = crate::awareness::Awareness::new(1);
        mirror.apply_update(&blob).unwrap();
        assert_eq!(mirror.client_ids(), vec![hub.doc().client_id()]);
    }

    #[tokio::test]
    async fn test_awareness_disabled_ignores_updates() {
        let config = HubConfig { awareness: false, ..quiet() };
        let hub = CollaborationHub::spawn("no-awareness", config, None).unwrap();
        let mut blob: Vec<u8> = Vec::new();
        blob.write_var(1u64);
        blob.write_var(5u64);
        blob.write_var(0u64);
        blob.write_string("{}");
        let msg = Message::Awareness(blob).encode().unwrap();
        assert!(hub.process_message(&msg, Origin::new()).await.unwrap().is_empty());
        let empty = hub.doc().run_async(|ctx| ctx.awareness().is_empty()).await.unwrap();
        assert!(empty);
    }

    #[tokio::test]
    async fn test_stop_closes_handle() {
        let hub = CollaborationHub::spawn("stop", quiet(), None).unwrap();
        hub.stop();
        hub.closed().await;
        assert!(hub.is_closed());
        assert!(matches!(hub.stats().await, Err(HubError::Stopped)));
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_is_clamped() {
        let config = HubConfig {
            sweep_interval: Duration::ZERO,
            ..quiet()
        };
        let hub = CollaborationHub::spawn("zero-sweep", config, None).unwrap();
        let update = client_edit(&Doc::new(), "still running");
        hub.process_message(&Message::sync_update(update).encode().unwrap(), Origin::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_closed());
        assert_eq!(hub.stats().await.unwrap().messages_processed, 1);
        hub.stop();
        hub.closed().await;
    }
}
