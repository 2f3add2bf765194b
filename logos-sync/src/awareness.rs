//! Replicated presence ("awareness") state.
//!
//! Every client owns one JSON value describing its ephemeral presence
//! (cursor, selection, user name). Entries carry a per-client clock; a
//! remote entry only replaces the local copy when its clock is newer.
//! Removing an entry leaves a tombstone so the removal itself replicates.
//!
//! ```text
//! Absent ──set──► Present(value, clock) ──remove──► Tombstone(clock)
//!                      ▲                                │
//!                      └────────── newer clock ─────────┘
//! ```
//!
//! Wire format (y-protocols awareness update):
//! ```text
//! varint(count) { varint(client_id) varint(clock) string(json) }*
//! ```
//! A tombstone is sent as the JSON text `null`.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::encoding::{Reader, Write};
use crate::protocol::DecodeError;

/// Identifier of one replica's awareness entry (the document client id).
pub type ClientId = u64;

/// Clients changed by a single awareness mutation.
///
/// `added` and `removed` never share a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessDiff {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client touched by this diff, in added/updated/removed order.
    pub fn all_clients(&self) -> Vec<ClientId> {
        let mut all = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        all.extend_from_slice(&self.added);
        all.extend_from_slice(&self.updated);
        all.extend_from_slice(&self.removed);
        all
    }

    fn classify(&mut self, client_id: ClientId, was_present: bool, is_present: bool) {
        match (was_present, is_present) {
            (false, true) => self.added.push(client_id),
            (true, true) => self.updated.push(client_id),
            (true, false) => self.removed.push(client_id),
            (false, false) => {}
        }
    }
}

/// Clock and freshness of one client's entry, kept for tombstones too.
#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Presence map of every client known to one document.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    /// Present entries only; tombstoned clients are absent here.
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    /// The local client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    /// Present entries keyed by client id.
    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    /// Ids of clients with a present entry, sorted.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current clock for a client, tombstoned or not.
    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    /// True if no client, present or tombstoned, has ever been seen.
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Replace the local entry. Always reported, even when the value is unchanged,
    /// so that repeated calls act as a heartbeat. `null` clears the entry.
    pub fn set_local_state(&mut self, state: Value) -> AwarenessDiff {
        if state.is_null() {
            return self.clean_local_state();
        }
        let client_id = self.client_id;
        let clock = self.meta.get(&client_id).map_or(0, |m| m.clock + 1);
        let was_present = self.states.insert(client_id, state).is_some();
        self.meta.insert(client_id, ClientMeta { clock, last_updated: Instant::now() });

        let mut diff = AwarenessDiff::default();
        diff.classify(client_id, was_present, true);
        diff
    }

    pub fn clean_local_state(&mut self) -> AwarenessDiff {
        self.remove_states(&[self.client_id])
    }

    /// Tombstone the listed clients. Clients without a present entry are ignored.
    pub fn remove_states(&mut self, client_ids: &[ClientId]) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        let now = Instant::now();
        for &client_id in client_ids {
            if self.states.remove(&client_id).is_none() {
                continue;
            }
            if client_id == self.client_id {
                // The tombstone must outrank the last announced state.
                let meta = self
                    .meta
                    .entry(client_id)
                    .or_insert(ClientMeta { clock: 0, last_updated: now });
                meta.clock += 1;
                meta.last_updated = now;
            }
            diff.removed.push(client_id);
        }
        diff
    }

    /// Merge a remote awareness update.
    ///
    /// The blob is decoded completely before anything is applied, so a malformed
    /// update leaves the state untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessDiff, DecodeError> {
        let entries = decode_update(update)?;
        let now = Instant::now();

        // First-seen presence per touched client, in arrival order.
        let mut touched: Vec<(ClientId, bool)> = Vec::new();
        let mut seen: HashSet<ClientId> = HashSet::new();

        for (client_id, clock, state) in entries {
            if !self.should_accept(client_id, clock, &state) {
                continue;
            }
            if seen.insert(client_id) {
                touched.push((client_id, self.states.contains_key(&client_id)));
            }

            let mut clock = clock;
            if state.is_null() {
                if client_id == self.client_id && self.states.contains_key(&client_id) {
                    // Someone removed us while we are still here: re-announce.
                    clock += 1;
                } else {
                    self.states.remove(&client_id);
                }
            } else {
                self.states.insert(client_id, state);
            }
            self.meta.insert(client_id, ClientMeta { clock, last_updated: now });
        }

        let mut diff = AwarenessDiff::default();
        for (client_id, was_present) in touched {
            diff.classify(client_id, was_present, self.states.contains_key(&client_id));
        }
        Ok(diff)
    }

    /// Encode the listed clients (tombstones as `null`). `None` encodes every
    /// known client. Unknown ids are skipped.
    pub fn encode_update(&self, client_ids: Option<&[ClientId]>) -> Vec<u8> {
        let selected: Vec<(ClientId, &ClientMeta)> = match client_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.meta.get(id).map(|m| (*id, m)))
                .collect(),
            None => {
                let sorted: BTreeMap<ClientId, &ClientMeta> =
                    self.meta.iter().map(|(id, m)| (*id, m)).collect();
                sorted.into_iter().collect()
            }
        };

        let mut buf: Vec<u8> = Vec::new();
        buf.write_var(selected.len());
        for (client_id, meta) in selected {
            buf.write_var(client_id);
            buf.write_var(meta.clock);
            match self.states.get(&client_id) {
                Some(state) => buf.write_string(&state.to_string()),
                None => buf.write_string("null"),
            }
        }
        buf
    }

    /// Expire remote entries not refreshed within `timeout` and renew the local
    /// entry once it is older than half of it.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();

        if let (Some(meta), true) = (
            self.meta.get_mut(&self.client_id),
            self.states.contains_key(&self.client_id),
        ) {
            if now.saturating_duration_since(meta.last_updated) >= timeout / 2 {
                meta.clock += 1;
                meta.last_updated = now;
                diff.updated.push(self.client_id);
            }
        }

        let mut expired: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(id, meta)| {
                **id != self.client_id
                    && self.states.contains_key(*id)
                    && now.saturating_duration_since(meta.last_updated) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for client_id in expired {
            self.states.remove(&client_id);
            diff.removed.push(client_id);
        }
        diff
    }

    fn should_accept(&self, client_id: ClientId, clock: u64, incoming: &Value) -> bool {
        let Some(meta) = self.meta.get(&client_id) else {
            return true;
        };
        if clock != meta.clock {
            return clock > meta.clock;
        }
        // Equal clocks: a tombstone wins, then the greater canonical JSON text.
        match (self.states.get(&client_id), incoming.is_null()) {
            (Some(_), true) => true,
            (None, _) => false,
            (Some(current), false) => incoming.to_string() > current.to_string(),
        }
    }
}

fn decode_update(update: &[u8]) -> Result<Vec<(ClientId, u64, Value)>, DecodeError> {
    let mut reader = Reader::new(update);
    let count = reader.read_var()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client_id = reader.read_var()?;
        let clock = reader.read_var()?;
        let json = reader.read_string()?;
        let state: Value = serde_json::from_str(json)
            .map_err(|e| DecodeError::InvalidState { client_id, reason: e.to_string() })?;
        entries.push((client_id, clock, state));
    }
    reader.finish()?;
    Ok(entries)
}
