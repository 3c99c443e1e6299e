//! Ephemeral per-client presence (awareness) state.
//!
//! Awareness is the best-effort companion to the document state: a
//! last-writer-wins map of `client_id → (clock, JSON state)` with no
//! durability requirement. Unlike document updates, which must converge
//! through the commutative merge engine, awareness entries are simply
//! overwritten by anything carrying a newer clock. A `null` state marks a
//! removed client; removals are kept as tombstones so a stale update
//! arriving late cannot resurrect a client that already left.
//!
//! Wire encoding of an update (inside the awareness envelope):
//! ```text
//! ┌────────────────┬───────────────────────────────────────────────┐
//! │ count: varuint │ count × (client_id: varuint, clock: varuint,  │
//! │                │           state: var-string JSON or "null")   │
//! └────────────────┴───────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use crate::protocol::{Decoder, Encoder, ProtocolError};

/// One client's presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u32,
    pub clock: u32,
    /// `None` means the client was removed.
    pub state: Option<serde_json::Value>,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// A decoded awareness update: one or more entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var_u64()? as usize;
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let client_id = dec.read_var_u32()?;
            let clock = dec.read_var_u32()?;
            let raw = dec.read_var_string()?;
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
            let state = match value {
                serde_json::Value::Null => None,
                other => Some(other),
            };
            entries.push(AwarenessEntry { client_id, clock, state });
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut enc = Encoder::new();
        enc.write_var_u64(self.entries.len() as u64);
        for entry in &self.entries {
            enc.write_var_u64(u64::from(entry.client_id));
            enc.write_var_u64(u64::from(entry.clock));
            match &entry.state {
                Some(value) => {
                    let json = serde_json::to_string(value)
                        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
                    enc.write_var_string(&json);
                }
                None => enc.write_var_string("null"),
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Room-scoped awareness map with last-writer-wins merge.
#[derive(Debug, Default)]
pub struct AwarenessMap {
    entries: HashMap<u32, AwarenessEntry>,
}

impl AwarenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update, returning only the entries that were applied.
    ///
    /// An entry wins if its clock is newer, or on a clock tie when it is a
    /// removal. Rejected entries are dropped silently; the sender's view
    /// was simply older than ours.
    pub fn apply(&mut self, update: AwarenessUpdate) -> AwarenessUpdate {
        let mut applied = Vec::new();
        for entry in update.entries {
            let accept = match self.entries.get(&entry.client_id) {
                None => true,
                Some(current) => {
                    entry.clock > current.clock
                        || (entry.clock == current.clock && entry.is_removal())
                }
            };
            if accept {
                self.entries.insert(entry.client_id, entry.clone());
                applied.push(entry);
            }
        }
        AwarenessUpdate { entries: applied }
    }

    /// Mark the given clients removed, bumping each clock past its last
    /// observed value. Returns the removal entries to broadcast; clients
    /// we never saw are skipped.
    pub fn remove_clients<I: IntoIterator<Item = u32>>(&mut self, clients: I) -> AwarenessUpdate {
        let mut removed = Vec::new();
        for client_id in clients {
            if let Some(entry) = self.entries.get_mut(&client_id) {
                if entry.is_removal() {
                    continue;
                }
                entry.clock += 1;
                entry.state = None;
                removed.push(entry.clone());
            }
        }
        AwarenessUpdate { entries: removed }
    }

    /// Snapshot of all live (non-removed) entries, for newly joined
    /// connections. Returns `None` when there is nothing to send.
    pub fn snapshot(&self) -> Option<AwarenessUpdate> {
        let entries: Vec<AwarenessEntry> = self
            .entries
            .values()
            .filter(|e| !e.is_removal())
            .cloned()
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(AwarenessUpdate { entries })
        }
    }

    /// Whether a client currently has a live state.
    pub fn contains(&self, client_id: u32) -> bool {
        self.entries
            .get(&client_id)
            .map(|e| !e.is_removal())
            .unwrap_or(false)
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_removal()).count()
    }
}
