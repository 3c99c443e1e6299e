//! Connection identity and outbound send handles.
//!
//! Both relay types address live connections the same way: an opaque
//! [`ConnId`] and an [`Outbound`] handle feeding that connection's writer
//! task. A failed send means the writer is gone, which the session layers
//! treat as an implicit disconnect of that one connection.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Opaque identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from its string form; used for relay targets arriving on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Sender half of a connection's outbound queue.
///
/// The queue is drained by a per-connection writer task that owns the
/// WebSocket sink; enqueueing never blocks a room's message handler.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Create an outbound handle plus the receiver for its writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Enqueue a message. Returns false if the writer task is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Enqueue a binary frame.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.send(Message::Binary(bytes.into()))
    }

    /// Enqueue a text frame.
    pub fn send_text(&self, text: String) -> bool {
        self.send(Message::Text(text.into()))
    }
}
