//! # tandem-relay — Real-time collaboration relay
//!
//! Keeps groups of clients synchronized on shared CRDT-backed documents
//! and whiteboards, and relays call-negotiation messages between peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ws /documents/:id    ┌──────────────┐
//! │ Client A │ ◄────────────────────► │ RelayServer  │
//! └──────────┘   binary sync frames   │              │
//! ┌──────────┐                        │ RoomRegistry │── DocRoom (Yrs Doc
//! │ Client B │ ◄────────────────────► │              │    + awareness)
//! └──────────┘                        │              │
//! ┌──────────┐   ws /signaling        │ Signaling    │── participant maps
//! │ Caller   │ ◄────────────────────► │ State        │   + unicast relay
//! └──────────┘   JSON events          └──────────────┘
//! ```
//!
//! Document rooms hold the authoritative [`yrs::Doc`] and fan applied
//! updates out to every connection; signaling rooms hold only a participant
//! registry and forward negotiation payloads point-to-point. Both share one
//! connection lifecycle: a reader loop, a writer task behind an unbounded
//! queue, heartbeat probing, and a uniform cleanup path for every way a
//! connection can die.
//!
//! ## Modules
//!
//! - [`protocol`] — varint wire framing for the document sync channel
//! - [`awareness`] — ephemeral last-writer-wins presence state
//! - [`room`] — room addressing and the lazily-populated registry
//! - [`sync`] — per-room document session (merge, catch-up, fan-out)
//! - [`signaling`] — call rooms and negotiation relay
//! - [`server`] — WebSocket accept loop and connection lifecycle
//! - [`connection`] — connection ids and outbound send handles

pub mod awareness;
pub mod connection;
pub mod protocol;
pub mod room;
pub mod server;
pub mod signaling;
pub mod sync;

// Re-exports for convenience
pub use awareness::{AwarenessEntry, AwarenessMap, AwarenessUpdate};
pub use connection::{ConnId, Outbound};
pub use protocol::{Frame, ProtocolError, SyncPayload};
pub use room::{resolve_room, RoomId, RoomRegistry, Surface};
pub use server::{
    AllowAll, RelayConfig, RelayError, RelayServer, RoomAuthorizer, StatsSnapshot,
};
pub use signaling::{ClientEvent, Participant, ServerEvent, SignalingState};
pub use sync::DocRoom;
