//! # logos-sync: CRDT document sync hub for Logos
//!
//! Keeps one authoritative Yrs document per name and synchronizes it with
//! any number of remote peers over the y-protocols binary format. Transports
//! (WebSocket, WebRTC, in-process) are left to the embedding application:
//! they feed raw frames into a hub and forward what comes back.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!  name ─────────► │  HubManager  │  one hub per document name
//!                  └──────┬───────┘
//!                         ▼
//! ┌──────────┐     ┌──────────────────┐      ┌───────────────┐
//! │ peer A   │ ──► │ CollaborationHub │ ───► │ DocumentActor │  Yrs Doc +
//! │ peer B   │ ◄── │  (tokio task)    │ ◄─── │ (owner thread)│  Awareness
//! └──────────┘     └───┬──────────┬───┘      └───────────────┘
//!                      │          │
//!              BroadcastGroup  Persistence (memory / RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`encoding`]: lib0 varint and length-prefixed primitives
//! - [`protocol`]: y-protocols message codec (sync, awareness, auth, custom)
//! - [`awareness`]: ephemeral per-client presence with logical clocks
//! - [`subscription`]: observer registry keyed by subscription id
//! - [`actor`]: single-owner document actor with transactional events
//! - [`broadcast`]: per-origin fan-out without echo
//! - [`hub`]: per-document message processing and lifecycle
//! - [`persistence`]: bind / persist / unbind hooks, in-memory and RocksDB
//! - [`manager`]: name to hub registry

pub mod encoding;
pub mod protocol;
pub mod awareness;
pub mod subscription;
pub mod actor;
pub mod broadcast;
pub mod persistence;
pub mod hub;
pub mod manager;

// Re-exports for convenience
pub use protocol::{DecodeError, EncodeError, Message};
pub use awareness::{Awareness, AwarenessDiff, ClientId};
pub use subscription::{SubscriptionId, SubscriptionRegistry};
pub use actor::{
    ActorError, ApplyError, DocContext, DocEvent, DocOptions, DocumentActor, EventKind, Origin,
    Subscription, TransactionHandle,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery};
pub use persistence::{
    DocumentMetadata, DocumentStore, MemoryPersistence, Persistence, PersistenceError,
    RocksPersistence, StoreConfig, StoreError,
};
pub use hub::{CollaborationHub, HubConfig, HubError, HubStats};
pub use manager::{HubManager, PersistenceFactory};
