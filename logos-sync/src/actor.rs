//! Single-owner document actor.
//!
//! Each document lives on a dedicated owner thread. The `yrs::Doc` and its
//! awareness state never leave that thread; callers ship closures to it and get
//! the result back.
//!
//! ```text
//!  caller (any thread / task)            owner thread "doc-{name}"
//!  ──────────────────────────            ─────────────────────────
//!  run(f) ─────── Envelope::Run ───────► f(&DocContext)
//!         ◄────── reply channel ───────  flush pending events ─► subscribers
//! ```
//!
//! Calls made from the owner thread itself (for example from inside another
//! job) execute inline instead of deadlocking on their own queue.
//!
//! Every committed transaction produces exactly one `DocEvent::Update` per
//! update subscriber. Transactions do not nest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update};

use crate::awareness::{Awareness, AwarenessDiff, ClientId};
use crate::protocol::DecodeError;
use crate::subscription::{SubscriptionId, SubscriptionRegistry};

// ───────────────────────────────────────────────────────────────────
// Origin
// ───────────────────────────────────────────────────────────────────

/// Opaque token naming the cause of a mutation.
///
/// Carried into the engine as transaction origin bytes and handed back with
/// every resulting event, so a hub can skip echoing a change to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Origin(Uuid);

impl Origin {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    fn from_yrs(origin: &yrs::Origin) -> Option<Self> {
        Uuid::from_slice(origin.as_ref()).ok().map(Self)
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ───────────────────────────────────────────────────────────────────
// Options, events, errors
// ───────────────────────────────────────────────────────────────────

/// Engine options for a newly spawned document.
#[derive(Debug, Clone, Default)]
pub struct DocOptions {
    /// Fixed client id (random when `None`)
    pub client_id: Option<u64>,
    /// Fixed document guid (random when `None`)
    pub guid: Option<String>,
    /// Keep deleted content instead of garbage collecting it
    pub skip_gc: bool,
}

impl DocOptions {
    fn to_yrs(&self) -> Options {
        let mut options = match self.client_id {
            Some(id) => Options::with_client_id(id),
            None => Options::default(),
        };
        if let Some(guid) = &self.guid {
            options.guid = guid.clone().into();
        }
        options.skip_gc = self.skip_gc;
        options
    }
}

/// Notification pushed to monitor sinks.
#[derive(Debug, Clone)]
pub enum DocEvent {
    /// One committed transaction.
    Update {
        update: Arc<Vec<u8>>,
        origin: Option<Origin>,
        metadata: Value,
    },
    /// One non-empty awareness change; `update` encodes every client in `diff`.
    Awareness {
        diff: AwarenessDiff,
        update: Arc<Vec<u8>>,
        origin: Option<Origin>,
        metadata: Value,
    },
}

impl DocEvent {
    pub fn origin(&self) -> Option<Origin> {
        match self {
            DocEvent::Update { origin, .. } | DocEvent::Awareness { origin, .. } => *origin,
        }
    }
}

/// An update or state vector the engine refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("malformed update: {0}")]
    InvalidUpdate(String),

    #[error("malformed state vector: {0}")]
    InvalidStateVector(String),

    #[error("update could not be integrated: {0}")]
    Integrate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    #[error("a transaction is already open on this document")]
    ReentrantTransaction,

    #[error("no owner assigned")]
    OwnerUnassigned,

    #[error("document is busy: {0}")]
    TransactionUnavailable(String),

    #[error("job panicked on owner thread: {0}")]
    Panicked(String),

    #[error("failed to start owner thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

// ───────────────────────────────────────────────────────────────────
// Transaction handle
// ───────────────────────────────────────────────────────────────────

/// Open read-write transaction plus the origin it was opened with.
///
/// Committed when dropped; all mutations made through it surface as a single
/// update event.
pub struct TransactionHandle<'doc> {
    txn: TransactionMut<'doc>,
    origin: Option<Origin>,
}

impl<'doc> TransactionHandle<'doc> {
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    /// Decode and integrate a v1 update.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), ApplyError> {
        let update =
            Update::decode_v1(update).map_err(|e| ApplyError::InvalidUpdate(e.to_string()))?;
        self.txn
            .apply_update(update)
            .map_err(|e| ApplyError::Integrate(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.txn.state_vector().encode_v1()
    }

    pub fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, ApplyError> {
        encode_diff(&self.txn, since)
    }

    /// Raw engine transaction, for shared-type reads.
    pub fn txn(&self) -> &TransactionMut<'doc> {
        &self.txn
    }

    /// Raw engine transaction, for shared-type mutators.
    pub fn txn_mut(&mut self) -> &mut TransactionMut<'doc> {
        &mut self.txn
    }
}

fn encode_diff<T: ReadTxn>(txn: &T, since: Option<&[u8]>) -> Result<Vec<u8>, ApplyError> {
    let sv = match since {
        Some(bytes) => StateVector::decode_v1(bytes)
            .map_err(|e| ApplyError::InvalidStateVector(e.to_string()))?,
        None => StateVector::default(),
    };
    Ok(txn.encode_diff_v1(&sv))
}

// ───────────────────────────────────────────────────────────────────
// Document context (owner thread only)
// ───────────────────────────────────────────────────────────────────

/// Raw update captured by the engine observer, waiting to be fanned out.
struct PendingUpdate {
    update: Vec<u8>,
    origin: Option<Origin>,
}

/// Lowered on drop, so a panicking job cannot leave the flag set.
struct TxnGuard<'a>(&'a Cell<bool>);

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Everything the owner thread holds for one document.
pub struct DocContext {
    name: String,
    doc: Doc,
    awareness: RefCell<Awareness>,
    txn_open: Cell<bool>,
    pending: Arc<Mutex<Vec<PendingUpdate>>>,
    update_subscribers: RefCell<SubscriptionRegistry<DocEvent>>,
    awareness_subscribers: RefCell<SubscriptionRegistry<DocEvent>>,
    _update_observer: yrs::Subscription,
}

impl DocContext {
    fn new(name: String, options: &DocOptions) -> Result<Self, ActorError> {
        let doc = Doc::with_options(options.to_yrs());
        let pending: Arc<Mutex<Vec<PendingUpdate>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = pending.clone();
        let observer = doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().and_then(Origin::from_yrs);
                let mut queue = match sink.lock() {
                    Ok(queue) => queue,
                    Err(poisoned) => poisoned.into_inner(),
                };
                queue.push(PendingUpdate { update: event.update.clone(), origin });
            })
            .map_err(|e| ActorError::TransactionUnavailable(e.to_string()))?;

        let awareness = Awareness::new(doc.client_id());
        Ok(Self {
            name,
            doc,
            awareness: RefCell::new(awareness),
            txn_open: Cell::new(false),
            pending,
            update_subscribers: RefCell::new(SubscriptionRegistry::new()),
            awareness_subscribers: RefCell::new(SubscriptionRegistry::new()),
            _update_observer: observer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    pub fn guid(&self) -> String {
        self.doc.guid().to_string()
    }

    /// The engine document, for shared-type lookups.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn state_vector(&self) -> Result<Vec<u8>, ActorError> {
        self.read(|txn| txn.state_vector().encode_v1())
    }

    /// Everything missing from `since` (a v1 state vector), or the whole document.
    pub fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, ActorError> {
        let txn = self.try_read_txn()?;
        Ok(encode_diff(&txn, since)?)
    }

    /// Run `f` against a read-only transaction. Produces no update event.
    pub fn read<R>(&self, f: impl FnOnce(&Transaction<'_>) -> R) -> Result<R, ActorError> {
        let txn = self.try_read_txn()?;
        Ok(f(&txn))
    }

    /// Open a read-write transaction, run `f`, commit, then notify subscribers.
    pub fn transaction<R>(
        &self,
        origin: Option<Origin>,
        f: impl FnOnce(&mut TransactionHandle<'_>) -> R,
    ) -> Result<R, ActorError> {
        if self.txn_open.get() {
            return Err(ActorError::ReentrantTransaction);
        }
        self.txn_open.set(true);
        let guard = TxnGuard(&self.txn_open);

        let txn = match origin {
            Some(origin) => self.doc.try_transact_mut_with(origin.as_uuid().as_bytes().as_slice()),
            None => self.doc.try_transact_mut(),
        }
        .map_err(|e| ActorError::TransactionUnavailable(e.to_string()))?;

        let mut handle = TransactionHandle { txn, origin };
        let out = f(&mut handle);
        drop(handle);
        drop(guard);

        self.flush_updates();
        Ok(out)
    }

    // ─── Awareness ────────────────────────────────────────────────────

    pub fn awareness(&self) -> Ref<'_, Awareness> {
        self.awareness.borrow()
    }

    pub fn set_local_state(&self, state: Value) -> AwarenessDiff {
        let diff = self.awareness.borrow_mut().set_local_state(state);
        self.emit_awareness(&diff, None);
        diff
    }

    pub fn clean_local_state(&self) -> AwarenessDiff {
        let diff = self.awareness.borrow_mut().clean_local_state();
        self.emit_awareness(&diff, None);
        diff
    }

    pub fn remove_awareness_states(
        &self,
        client_ids: &[ClientId],
        origin: Option<Origin>,
    ) -> AwarenessDiff {
        let diff = self.awareness.borrow_mut().remove_states(client_ids);
        self.emit_awareness(&diff, origin);
        diff
    }

    pub fn apply_awareness_update(
        &self,
        update: &[u8],
        origin: Option<Origin>,
    ) -> Result<AwarenessDiff, DecodeError> {
        let diff = self.awareness.borrow_mut().apply_update(update)?;
        self.emit_awareness(&diff, origin);
        Ok(diff)
    }

    /// Awareness blob for the listed clients, or a full snapshot for `None`.
    pub fn encode_awareness_update(&self, client_ids: Option<&[ClientId]>) -> Vec<u8> {
        self.awareness.borrow().encode_update(client_ids)
    }

    /// Expire stale remote entries and renew the local one.
    pub fn remove_outdated_awareness(&self, timeout: std::time::Duration) -> AwarenessDiff {
        let diff = self
            .awareness
            .borrow_mut()
            .remove_outdated(std::time::Instant::now(), timeout);
        self.emit_awareness(&diff, None);
        diff
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Register a sink for committed updates. Metadata defaults to the document name.
    pub fn monitor_update(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> SubscriptionId {
        let metadata = metadata.unwrap_or_else(|| Value::String(self.name.clone()));
        self.update_subscribers.borrow_mut().register(sink, metadata)
    }

    /// Register a sink for awareness changes. Metadata defaults to the document name.
    pub fn monitor_awareness(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> SubscriptionId {
        let metadata = metadata.unwrap_or_else(|| Value::String(self.name.clone()));
        self.awareness_subscribers.borrow_mut().register(sink, metadata)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        match kind {
            EventKind::Update => self.update_subscribers.borrow_mut().unsubscribe(id),
            EventKind::Awareness => self.awareness_subscribers.borrow_mut().unsubscribe(id),
        }
    }

    fn try_read_txn(&self) -> Result<Transaction<'_>, ActorError> {
        self.doc
            .try_transact()
            .map_err(|e| ActorError::TransactionUnavailable(e.to_string()))
    }

    fn flush_updates(&self) {
        let drained = {
            let mut queue = match self.pending.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *queue)
        };
        if drained.is_empty() {
            return;
        }
        let mut subscribers = self.update_subscribers.borrow_mut();
        for PendingUpdate { update, origin } in drained {
            // Empty update: no new blocks and no deletions.
            if update == [0, 0] {
                continue;
            }
            let update = Arc::new(update);
            let delivered = subscribers.deliver(|metadata| DocEvent::Update {
                update: update.clone(),
                origin,
                metadata: metadata.clone(),
            });
            log::trace!("doc {}: update of {} bytes to {delivered} sinks", self.name, update.len());
        }
    }

    fn emit_awareness(&self, diff: &AwarenessDiff, origin: Option<Origin>) {
        if diff.is_empty() {
            return;
        }
        let update = Arc::new(self.encode_awareness_update(Some(&diff.all_clients())));
        self.awareness_subscribers.borrow_mut().deliver(|metadata| DocEvent::Awareness {
            diff: diff.clone(),
            update: update.clone(),
            origin,
            metadata: metadata.clone(),
        });
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor handle
// ───────────────────────────────────────────────────────────────────

thread_local! {
    static OWNED_CONTEXT: RefCell<Option<Rc<DocContext>>> = const { RefCell::new(None) };
}

fn owned_context() -> Option<Rc<DocContext>> {
    OWNED_CONTEXT.with(|slot| slot.borrow().clone())
}

type Job = Box<dyn FnOnce(&DocContext) + Send>;

enum Envelope {
    Run(Job),
    Stop,
}

struct ActorInner {
    name: String,
    owner: ThreadId,
    client_id: ClientId,
    guid: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Cloneable handle to a document's owner thread.
#[derive(Clone)]
pub struct DocumentActor {
    inner: Arc<ActorInner>,
}

impl fmt::Debug for DocumentActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentActor")
            .field("name", &self.inner.name)
            .field("client_id", &self.inner.client_id)
            .finish()
    }
}

impl DocumentActor {
    /// Start the owner thread and create the document on it.
    pub fn spawn(name: impl Into<String>, options: DocOptions) -> Result<Self, ActorError> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let doc_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("doc-{name}"))
            .spawn(move || {
                let ctx = match DocContext::new(doc_name, &options) {
                    Ok(ctx) => Rc::new(ctx),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((ctx.client_id(), ctx.guid())));
                OWNED_CONTEXT.with(|slot| *slot.borrow_mut() = Some(ctx.clone()));

                while let Some(envelope) = rx.blocking_recv() {
                    match envelope {
                        Envelope::Run(job) => job(ctx.as_ref()),
                        Envelope::Stop => break,
                    }
                }

                OWNED_CONTEXT.with(|slot| slot.borrow_mut().take());
                log::debug!("document actor {} stopped", ctx.name());
            })
            .map_err(|e| ActorError::Spawn(e.to_string()))?;

        let owner = handle.thread().id();
        let (client_id, guid) = ready_rx.recv().map_err(|_| ActorError::OwnerUnassigned)??;
        log::debug!("document actor {name} started (client {client_id})");

        Ok(Self {
            inner: Arc::new(ActorInner { name, owner, client_id, guid, tx }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// False once the owner thread has stopped accepting work.
    pub fn is_alive(&self) -> bool {
        !self.inner.tx.is_closed()
    }

    fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Run `f` with exclusive access to the document, blocking until it returns.
    ///
    /// Must not be called from an async task that the owner thread is waiting
    /// on; use [`run_async`](Self::run_async) there.
    pub fn run<F, R>(&self, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&DocContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_owner_thread() {
            let ctx = owned_context().ok_or(ActorError::OwnerUnassigned)?;
            return Ok(f(ctx.as_ref()));
        }

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        self.dispatch(Box::new(move |ctx| {
            let _ = reply_tx.send(run_job(ctx, f));
        }))?;
        reply_rx.recv().map_err(|_| ActorError::OwnerUnassigned)?
    }

    /// Awaiting counterpart of [`run`](Self::run).
    pub async fn run_async<F, R>(&self, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&DocContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_owner_thread() {
            let ctx = owned_context().ok_or(ActorError::OwnerUnassigned)?;
            return Ok(f(ctx.as_ref()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Box::new(move |ctx| {
            let _ = reply_tx.send(run_job(ctx, f));
        }))?;
        reply_rx.await.map_err(|_| ActorError::OwnerUnassigned)?
    }

    pub fn transaction<F, R>(&self, origin: Option<Origin>, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&mut TransactionHandle<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run(move |ctx| ctx.transaction(origin, f))?
    }

    pub async fn transaction_async<F, R>(&self, origin: Option<Origin>, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&mut TransactionHandle<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_async(move |ctx| ctx.transaction(origin, f)).await?
    }

    pub fn monitor_update(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> Result<Subscription, ActorError> {
        let id = self.run(move |ctx| ctx.monitor_update(sink, metadata))?;
        Ok(self.subscription(EventKind::Update, id))
    }

    pub async fn monitor_update_async(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> Result<Subscription, ActorError> {
        let id = self.run_async(move |ctx| ctx.monitor_update(sink, metadata)).await?;
        Ok(self.subscription(EventKind::Update, id))
    }

    pub fn monitor_awareness(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> Result<Subscription, ActorError> {
        let id = self.run(move |ctx| ctx.monitor_awareness(sink, metadata))?;
        Ok(self.subscription(EventKind::Awareness, id))
    }

    pub async fn monitor_awareness_async(
        &self,
        sink: mpsc::UnboundedSender<DocEvent>,
        metadata: Option<Value>,
    ) -> Result<Subscription, ActorError> {
        let id = self.run_async(move |ctx| ctx.monitor_awareness(sink, metadata)).await?;
        Ok(self.subscription(EventKind::Awareness, id))
    }

    /// Stop the owner thread once the jobs queued before this call have run.
    pub fn stop(&self) {
        if self.inner.tx.send(Envelope::Stop).is_err() {
            log::trace!("document actor {} already stopped", self.inner.name);
        }
    }

    fn dispatch(&self, job: Job) -> Result<(), ActorError> {
        self.inner
            .tx
            .send(Envelope::Run(job))
            .map_err(|_| ActorError::OwnerUnassigned)
    }

    fn subscription(&self, kind: EventKind, id: SubscriptionId) -> Subscription {
        Subscription { id, kind, actor: self.clone() }
    }
}

/// Run a job on the owner thread, isolating panics, then fan out its events.
fn run_job<F, R>(ctx: &DocContext, f: F) -> Result<R, ActorError>
where
    F: FnOnce(&DocContext) -> R,
{
    let result = catch_unwind(AssertUnwindSafe(|| f(ctx)));
    ctx.flush_updates();
    result.map_err(|payload| {
        let message = panic_message(payload.as_ref());
        log::warn!("job on document {} panicked: {message}", ctx.name());
        ActorError::Panicked(message)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ───────────────────────────────────────────────────────────────────
// Subscription token
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    Awareness,
}

/// Registration returned by the `monitor_*` calls.
///
/// Dropping the token leaves the registration in place; call
/// [`unsubscribe`](Self::unsubscribe) or drop the receiving channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    actor: DocumentActor,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Cancel the registration. Repeated calls succeed and return `false`.
    pub fn unsubscribe(&self) -> Result<bool, ActorError> {
        let (kind, id) = (self.kind, self.id);
        self.actor.run(move |ctx| ctx.unsubscribe(kind, id))
    }

    pub async fn unsubscribe_async(&self) -> Result<bool, ActorError> {
        let (kind, id) = (self.kind, self.id);
        self.actor.run_async(move |ctx| ctx.unsubscribe(kind, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{GetString, Text, WriteTxn};

    fn spawn(name: &str) -> DocumentActor {
        DocumentActor::spawn(name, DocOptions::default()).unwrap()
    }

    fn insert(actor: &DocumentActor, origin: Option<Origin>, s: &'static str) {
        actor
            .transaction(origin, move |txn| {
                let text = txn.txn_mut().get_or_insert_text("content");
                let len = text.len(txn.txn());
                text.insert(txn.txn_mut(), len, s);
            })
            .unwrap();
    }

    fn content(actor: &DocumentActor) -> String {
        actor
            .run(|ctx| {
                let text = ctx.doc().get_or_insert_text("content");
                ctx.read(|txn| text.get_string(txn)).unwrap()
            })
            .unwrap()
    }

    #[test]
    fn test_options_applied() {
        let actor = DocumentActor::spawn(
            "opts",
            DocOptions { client_id: Some(42), guid: Some("g-1".into()), skip_gc: true },
        )
        .unwrap();
        assert_eq!(actor.client_id(), 42);
        assert_eq!(actor.guid(), "g-1");
        assert!(actor.run(|ctx| ctx.doc().skip_gc()).unwrap());
        assert_eq!(actor.run(|ctx| ctx.awareness().client_id()).unwrap(), 42);
    }

    #[test]
    fn test_one_event_per_transaction() {
        let actor = spawn("batch");
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.monitor_update(tx, None).unwrap();

        actor
            .transaction(None, |txn| {
                let text = txn.txn_mut().get_or_insert_text("content");
                for i in 0..10 {
                    text.insert(txn.txn_mut(), i, "x");
                }
            })
            .unwrap();

        match rx.try_recv().unwrap() {
            DocEvent::Update { metadata, origin, update } => {
                assert_eq!(metadata, json!("batch"));
                assert_eq!(origin, None);
                assert!(!update.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(content(&actor), "xxxxxxxxxx");
    }

    #[test]
    fn test_read_only_transaction_emits_nothing() {
        let actor = spawn("reads");
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.monitor_update(tx, Some(json!({"k": 1}))).unwrap();

        actor.transaction(None, |txn| txn.state_vector()).unwrap();
        actor.run(|ctx| ctx.state_vector()).unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_origin_propagates() {
        let actor = spawn("origin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.monitor_update(tx, None).unwrap();

        let origin = Origin::new();
        insert(&actor, Some(origin), "a");
        assert_eq!(rx.try_recv().unwrap().origin(), Some(origin));
    }

    #[test]
    fn test_nested_run_is_inline() {
        let actor = spawn("nested");
        let inner = actor.clone();
        let value = actor
            .run(move |_| inner.run(|ctx| ctx.name().to_string()).unwrap())
            .unwrap();
        assert_eq!(value, "nested");
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let actor = spawn("reentrant");
        let inner = actor.clone();
        let nested = actor
            .transaction(None, move |_| inner.transaction(None, |_| ()))
            .unwrap();
        assert_eq!(nested, Err(ActorError::ReentrantTransaction));

        // The actor is still usable afterwards.
        insert(&actor, None, "ok");
        assert_eq!(content(&actor), "ok");
    }

    #[test]
    fn test_panic_is_isolated() {
        let actor = spawn("panics");
        let result: Result<(), _> = actor.transaction(None, |_| panic!("boom"));
        assert_eq!(result, Err(ActorError::Panicked("boom".into())));

        insert(&actor, None, "alive");
        assert_eq!(content(&actor), "alive");
    }

    #[test]
    fn test_stopped_actor_reports_no_owner() {
        let actor = spawn("stopped");
        actor.stop();
        let err = loop {
            match actor.run(|_| ()) {
                Ok(()) => std::thread::yield_now(),
                Err(e) => break e,
            }
        };
        assert_eq!(err, ActorError::OwnerUnassigned);
        assert_eq!(err.to_string(), "no owner assigned");
        assert!(!actor.is_alive());
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let actor = spawn("unsub");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = actor.monitor_update(tx, None).unwrap();

        assert!(sub.unsubscribe().unwrap());
        assert!(!sub.unsubscribe().unwrap());
        insert(&actor, None, "quiet");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropping_token_keeps_subscription() {
        let actor = spawn("token");
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(actor.monitor_update(tx, None).unwrap());
        insert(&actor, None, "still");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_invalid_update_rejected() {
        let actor = spawn("invalid");
        let result = actor.transaction(None, |txn| txn.apply_update(&[0xFF, 0xFF, 0xFF])).unwrap();
        assert!(matches!(result, Err(ApplyError::InvalidUpdate(_))));

        let err = actor.run(|ctx| ctx.encode_state_as_update(Some(&[0xFF][..]))).unwrap();
        assert!(matches!(err, Err(ActorError::Apply(ApplyError::InvalidStateVector(_)))));
    }

    #[test]
    fn test_state_exchange_between_actors() {
        let a = spawn("a");
        let b = spawn("b");
        insert(&a, None, "hello");

        let sv = b.run(|ctx| ctx.state_vector()).unwrap().unwrap();
        let diff = a.run(move |ctx| ctx.encode_state_as_update(Some(sv.as_slice()))).unwrap().unwrap();
        b.transaction(None, move |txn| txn.apply_update(&diff)).unwrap().unwrap();

        assert_eq!(content(&b), "hello");
    }

    #[test]
    fn test_awareness_events() {
        let actor = spawn("presence");
        let (tx, mut rx) = mpsc::unbounded_channel();
        actor.monitor_awareness(tx, None).unwrap();

        let client_id = actor.client_id();
        let diff = actor.run(|ctx| ctx.set_local_state(json!({"user": "ada"}))).unwrap();
        assert_eq!(diff.added, vec![client_id]);

        match rx.try_recv().unwrap() {
            DocEvent::Awareness { diff, update, .. } => {
                assert_eq!(diff.added, vec![client_id]);
                let mut other = Awareness::new(1);
                other.apply_update(&update).unwrap();
                assert_eq!(other.states()[&client_id], json!({"user": "ada"}));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Removing an absent client changes nothing and emits nothing.
        actor.run(|ctx| ctx.remove_awareness_states(&[999], None)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_async_calls() {
        let actor = spawn("async");
        let origin = Origin::new();
        actor
            .transaction_async(Some(origin), |txn| {
                let text = txn.txn_mut().get_or_insert_text("content");
                text.insert(txn.txn_mut(), 0, "async");
            })
            .await
            .unwrap();
        let name = actor.run_async(|ctx| ctx.name().to_string()).await.unwrap();
        assert_eq!(name, "async");
        assert_eq!(content(&actor), "async");
    }
}
