//! Per-room document synchronization session.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocRoom (room id) ── Yrs Doc (authoritative)
//! Client B ──┘        │
//!                     ├── AwarenessMap (ephemeral presence)
//!                     │
//!              ┌──────┴──────┐
//!              ▼             ▼
//!          Client A      Client B
//! ```
//!
//! Each room owns the authoritative Yrs document, the set of live
//! connections, and the awareness map. All mutation happens synchronously
//! inside one message handler while the caller holds the room lock; the
//! handlers never await. Fan-out is not atomic: a connection whose outbound
//! queue is gone is pruned and cleaned up without aborting delivery to the
//! rest of the room.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::awareness::{AwarenessMap, AwarenessUpdate};
use crate::connection::{ConnId, Outbound};
use crate::protocol::{self, SyncPayload};
use crate::room::RoomId;

/// One live connection registered in a room.
struct DocConnection {
    outbound: Outbound,
    /// Awareness client ids this connection introduced and is
    /// authoritative for.
    owned_clients: HashSet<u32>,
}

/// Authoritative state and connection set for one document room.
pub struct DocRoom {
    id: RoomId,
    doc: yrs::Doc,
    conns: HashMap<ConnId, DocConnection>,
    awareness: AwarenessMap,
    /// Set while the connection set is empty; drives idle eviction.
    empty_since: Option<Instant>,
}

impl DocRoom {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            doc: yrs::Doc::new(),
            conns: HashMap::new(),
            awareness: AwarenessMap::new(),
            empty_since: Some(Instant::now()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// How long the room has been empty, if it is.
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        self.empty_since.map(|t| t.elapsed())
    }

    /// Register a connection and run the catch-up handshake: a state
    /// request carrying our state vector, then a snapshot of any live
    /// awareness entries, both unicast to the new connection only.
    pub fn connect(&mut self, conn_id: ConnId, outbound: Outbound) {
        self.empty_since = None;
        self.conns.insert(
            conn_id,
            DocConnection { outbound, owned_clients: HashSet::new() },
        );

        let sv = {
            let txn = self.doc.transact();
            txn.state_vector().encode_v1()
        };
        if !self.send_to(conn_id, protocol::state_request(sv)) {
            self.reap(vec![conn_id]);
            return;
        }

        if let Some(snapshot) = self.awareness.snapshot() {
            match snapshot.encode() {
                Ok(bytes) => {
                    if !self.send_to(conn_id, protocol::awareness(bytes)) {
                        self.reap(vec![conn_id]);
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("Failed to encode awareness snapshot for {}: {e}", self.id)
                }
            }
        }

        log::info!(
            "Connection {conn_id} joined {} ({} connections)",
            self.id,
            self.conns.len()
        );
    }

    /// Handle one sync envelope from `from`.
    ///
    /// A state request gets a unicast state response; an applied update is
    /// broadcast to every connection in the room, the originator included.
    pub fn handle_sync(&mut self, from: ConnId, payload: SyncPayload) {
        match payload {
            SyncPayload::StateRequest(sv_bytes) => {
                let sv = match StateVector::decode_v1(&sv_bytes) {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Dropping malformed state request in {}: {e}", self.id);
                        return;
                    }
                };
                let diff = {
                    let txn = self.doc.transact();
                    txn.encode_diff_v1(&sv)
                };
                if !self.send_to(from, protocol::state_response(diff)) {
                    self.reap(vec![from]);
                }
            }
            SyncPayload::StateResponse(update) | SyncPayload::Update(update) => {
                match Update::decode_v1(&update) {
                    Ok(decoded) => {
                        let mut txn = self.doc.transact_mut();
                        if let Err(e) = txn.apply_update(decoded) {
                            log::warn!("Dropping unappliable update in {}: {e}", self.id);
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping malformed update in {}: {e}", self.id);
                        return;
                    }
                }
                let failed = self.broadcast_raw(&protocol::update(update));
                self.reap(failed);
            }
        }
    }

    /// Handle one awareness envelope from `from`: track ownership of the
    /// client ids it introduces or nulls, merge last-writer-wins, and
    /// broadcast whatever actually applied to the whole room.
    pub fn handle_awareness(&mut self, from: ConnId, update_bytes: &[u8]) {
        let update = match AwarenessUpdate::decode(update_bytes) {
            Ok(u) => u,
            Err(e) => {
                log::warn!("Dropping malformed awareness update in {}: {e}", self.id);
                return;
            }
        };

        if let Some(conn) = self.conns.get_mut(&from) {
            for entry in &update.entries {
                if entry.is_removal() {
                    conn.owned_clients.remove(&entry.client_id);
                } else {
                    conn.owned_clients.insert(entry.client_id);
                }
            }
        }

        let applied = self.awareness.apply(update);
        if applied.is_empty() {
            return;
        }
        match applied.encode() {
            Ok(bytes) => {
                let failed = self.broadcast_raw(&protocol::awareness(bytes));
                self.reap(failed);
            }
            Err(e) => log::warn!("Failed to re-encode awareness update in {}: {e}", self.id),
        }
    }

    /// Remove a connection, tombstone the awareness entries it owned, and
    /// broadcast those removals to the remaining connections.
    pub fn disconnect(&mut self, conn_id: ConnId) {
        self.reap(vec![conn_id]);
    }

    /// Full document state as a single update; what a replica holding
    /// nothing would need to catch up.
    pub fn state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub(crate) fn awareness(&self) -> &AwarenessMap {
        &self.awareness
    }

    /// Uniform cleanup path. Removes every connection in `dead`; awareness
    /// removal broadcasts may expose further dead connections, which join
    /// the queue until it drains.
    fn reap(&mut self, mut dead: Vec<ConnId>) {
        while let Some(conn_id) = dead.pop() {
            let Some(conn) = self.conns.remove(&conn_id) else {
                continue;
            };
            log::info!(
                "Connection {conn_id} left {} ({} remaining)",
                self.id,
                self.conns.len()
            );
            let removals = self.awareness.remove_clients(conn.owned_clients);
            if !removals.is_empty() {
                match removals.encode() {
                    Ok(bytes) => {
                        dead.extend(self.broadcast_raw(&protocol::awareness(bytes)));
                    }
                    Err(e) => {
                        log::warn!("Failed to encode awareness removals for {}: {e}", self.id)
                    }
                }
            }
        }
        if self.conns.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
    }

    /// Fan a frame out to every connection. Returns the connections whose
    /// outbound queue is gone; delivery to the rest is unaffected.
    fn broadcast_raw(&self, frame: &[u8]) -> Vec<ConnId> {
        let mut failed = Vec::new();
        for (conn_id, conn) in &self.conns {
            if !conn.outbound.send_binary(frame.to_vec()) {
                failed.push(*conn_id);
            }
        }
        failed
    }

    fn send_to(&self, conn_id: ConnId, frame: Vec<u8>) -> bool {
        self.conns
            .get(&conn_id)
            .map(|c| c.outbound.send_binary(frame))
            .unwrap_or(false)
    }
}
