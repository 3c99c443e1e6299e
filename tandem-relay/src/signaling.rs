//! Call signaling: room-scoped participant registry and negotiation relay.
//!
//! Signaling rooms carry no shared document. They exist to introduce call
//! participants to each other and to relay peer-negotiation messages
//! (offers, answers, ICE candidates) point-to-point while the actual media
//! flows peer-to-peer elsewhere. Events are closed tagged variants; a
//! payload that does not match one of them is dropped at the boundary.
//!
//! A connection's memberships are an explicit owned set: joining several
//! rooms is supported, and the implicit-disconnect path scans exactly that
//! set. A room is deleted the moment its participant map empties.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::connection::{ConnId, Outbound};

/// A registered call participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnId,
    pub user_id: String,
    pub user_name: String,
    pub room_name: String,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_name: String,
        user_id: String,
        user_name: String,
    },
    Offer {
        offer: serde_json::Value,
        to: String,
    },
    Answer {
        answer: serde_json::Value,
        to: String,
    },
    IceCandidate {
        candidate: serde_json::Value,
        to: String,
    },
    #[serde(rename_all = "camelCase")]
    ToggleVideo { room_name: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    ToggleAudio { room_name: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_name: String },
}

/// Events the relay sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    ExistingUsers {
        users: Vec<Participant>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        connection_id: ConnId,
        user_id: String,
        user_name: String,
    },
    Offer {
        offer: serde_json::Value,
        from: ConnId,
    },
    Answer {
        answer: serde_json::Value,
        from: ConnId,
    },
    IceCandidate {
        candidate: serde_json::Value,
        from: ConnId,
    },
    #[serde(rename_all = "camelCase")]
    UserVideoToggle { connection_id: ConnId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    UserAudioToggle { connection_id: ConnId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    UserLeft { connection_id: ConnId },
}

struct SignalingConn {
    outbound: Outbound,
    /// Rooms this connection currently belongs to.
    rooms: HashSet<String>,
}

/// All signaling state: connections and room participant maps.
#[derive(Default)]
pub struct SignalingState {
    rooms: HashMap<String, HashMap<ConnId, Participant>>,
    conns: HashMap<ConnId, SignalingConn>,
}

impl SignalingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. No room membership yet.
    pub fn register(&mut self, conn_id: ConnId, outbound: Outbound) {
        self.conns.insert(
            conn_id,
            SignalingConn { outbound, rooms: HashSet::new() },
        );
    }

    /// Dispatch one client event.
    pub fn handle_event(&mut self, from: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room_name, user_id, user_name } => {
                self.join(from, room_name, user_id, user_name)
            }
            ClientEvent::Offer { offer, to } => {
                self.relay(&to, ServerEvent::Offer { offer, from })
            }
            ClientEvent::Answer { answer, to } => {
                self.relay(&to, ServerEvent::Answer { answer, from })
            }
            ClientEvent::IceCandidate { candidate, to } => {
                self.relay(&to, ServerEvent::IceCandidate { candidate, from })
            }
            ClientEvent::ToggleVideo { room_name, enabled } => self.toggle(
                from,
                &room_name,
                ServerEvent::UserVideoToggle { connection_id: from, enabled },
            ),
            ClientEvent::ToggleAudio { room_name, enabled } => self.toggle(
                from,
                &room_name,
                ServerEvent::UserAudioToggle { connection_id: from, enabled },
            ),
            ClientEvent::LeaveRoom { room_name } => self.leave(from, &room_name),
        }
    }

    /// Implicit disconnect: vacate every room the connection belonged to.
    pub fn disconnect(&mut self, conn_id: ConnId) {
        self.reap(vec![conn_id]);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self, room_name: &str) -> usize {
        self.rooms.get(room_name).map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, conn_id: ConnId) -> bool {
        self.conns.contains_key(&conn_id)
    }

    fn join(&mut self, from: ConnId, room_name: String, user_id: String, user_name: String) {
        let Some(conn) = self.conns.get_mut(&from) else {
            return;
        };
        conn.rooms.insert(room_name.clone());

        let existing = {
            let room = self.rooms.entry(room_name.clone()).or_insert_with(|| {
                log::info!("Creating signaling room {room_name}");
                HashMap::new()
            });
            let existing: Vec<Participant> = room.values().cloned().collect();
            room.insert(
                from,
                Participant {
                    connection_id: from,
                    user_id: user_id.clone(),
                    user_name: user_name.clone(),
                    room_name: room_name.clone(),
                },
            );
            existing
        };

        log::info!(
            "{user_name} joined signaling room {room_name} ({} participants)",
            self.participant_count(&room_name)
        );

        let mut dead = Vec::new();
        if !self.send_to(from, &ServerEvent::ExistingUsers { users: existing }) {
            dead.push(from);
        }
        dead.extend(self.broadcast(
            &room_name,
            Some(from),
            &ServerEvent::UserJoined { connection_id: from, user_id, user_name },
        ));
        self.reap(dead);
    }

    /// Unicast a negotiation event to the connection named by `to`.
    /// An unknown or unparseable target is a silent no-op.
    fn relay(&mut self, to: &str, event: ServerEvent) {
        let Some(target) = ConnId::parse(to) else {
            log::debug!("Relay target {to:?} is not a connection id, dropping");
            return;
        };
        if !self.conns.contains_key(&target) {
            log::debug!("Relay target {target} not connected, dropping");
            return;
        }
        if !self.send_to(target, &event) {
            self.reap(vec![target]);
        }
    }

    fn toggle(&mut self, from: ConnId, room_name: &str, event: ServerEvent) {
        let is_member = self
            .rooms
            .get(room_name)
            .map(|r| r.contains_key(&from))
            .unwrap_or(false);
        if !is_member {
            log::debug!("Toggle from {from} outside room {room_name}, dropping");
            return;
        }
        let dead = self.broadcast(room_name, Some(from), &event);
        self.reap(dead);
    }

    fn leave(&mut self, from: ConnId, room_name: &str) {
        if let Some(conn) = self.conns.get_mut(&from) {
            conn.rooms.remove(room_name);
        }
        let dead = self.remove_participant(from, room_name);
        self.reap(dead);
    }

    /// Remove a participant from one room, announce the departure, and
    /// delete the room if it emptied. Returns connections that failed a
    /// send during the announcement.
    fn remove_participant(&mut self, conn_id: ConnId, room_name: &str) -> Vec<ConnId> {
        let (removed, now_empty) = match self.rooms.get_mut(room_name) {
            Some(room) => {
                let removed = room.remove(&conn_id);
                (removed, room.is_empty())
            }
            None => (None, false),
        };
        let Some(participant) = removed else {
            return Vec::new();
        };
        log::info!("{} left signaling room {room_name}", participant.user_name);

        if now_empty {
            self.rooms.remove(room_name);
            log::info!("Signaling room {room_name} removed (empty)");
            Vec::new()
        } else {
            self.broadcast(room_name, None, &ServerEvent::UserLeft { connection_id: conn_id })
        }
    }

    /// Uniform cleanup path: deregister each dead connection and vacate
    /// its rooms; departure broadcasts may surface further dead
    /// connections, which join the queue.
    fn reap(&mut self, mut dead: Vec<ConnId>) {
        while let Some(conn_id) = dead.pop() {
            let Some(conn) = self.conns.remove(&conn_id) else {
                continue;
            };
            for room_name in conn.rooms {
                dead.extend(self.remove_participant(conn_id, &room_name));
            }
        }
    }

    fn send_to(&self, conn_id: ConnId, event: &ServerEvent) -> bool {
        let Some(conn) = self.conns.get(&conn_id) else {
            return false;
        };
        match serde_json::to_string(event) {
            Ok(payload) => conn.outbound.send_text(payload),
            Err(e) => {
                log::warn!("Failed to encode signaling event: {e}");
                true
            }
        }
    }

    /// Send to every participant of a room except `except`. Returns the
    /// connections whose outbound queue is gone.
    fn broadcast(
        &self,
        room_name: &str,
        except: Option<ConnId>,
        event: &ServerEvent,
    ) -> Vec<ConnId> {
        let Some(room) = self.rooms.get(room_name) else {
            return Vec::new();
        };
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Failed to encode signaling event: {e}");
                return Vec::new();
            }
        };
        let mut failed = Vec::new();
        for conn_id in room.keys() {
            if Some(*conn_id) == except {
                continue;
            }
            let delivered = self
                .conns
                .get(conn_id)
                .map(|c| c.outbound.send_text(payload.clone()))
                .unwrap_or(false);
            if !delivered {
                failed.push(*conn_id);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }

    fn join(state: &mut SignalingState, conn: ConnId, room: &str, name: &str) {
        state.handle_event(
            conn,
            ClientEvent::JoinRoom {
                room_name: room.to_string(),
                user_id: format!("uid-{name}"),
                user_name: name.to_string(),
            },
        );
    }

    #[tokio::test]
    async fn test_join_ordering() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        let (out_y, mut rx_y) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);

        join(&mut state, x, "standup", "X");
        let x_events = drain(&mut rx_x);
        assert_eq!(x_events.len(), 1);
        assert_eq!(x_events[0], ServerEvent::ExistingUsers { users: vec![] });

        join(&mut state, y, "standup", "Y");

        // Y sees exactly the prior participant, and never its own join
        let y_events = drain(&mut rx_y);
        assert_eq!(y_events.len(), 1);
        match &y_events[0] {
            ServerEvent::ExistingUsers { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].connection_id, x);
                assert_eq!(users[0].user_name, "X");
            }
            other => panic!("expected existing-users, got {other:?}"),
        }

        // X is told about Y
        let x_events = drain(&mut rx_x);
        assert_eq!(x_events.len(), 1);
        match &x_events[0] {
            ServerEvent::UserJoined { connection_id, user_name, .. } => {
                assert_eq!(*connection_id, y);
                assert_eq!(user_name, "Y");
            }
            other => panic!("expected user-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_is_unicast_with_sender_annotation() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let z = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        let (out_y, mut rx_y) = Outbound::channel();
        let (out_z, mut rx_z) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);
        state.register(z, out_z);
        join(&mut state, x, "call", "X");
        join(&mut state, y, "call", "Y");
        join(&mut state, z, "call", "Z");
        drain(&mut rx_x);
        drain(&mut rx_y);
        drain(&mut rx_z);

        let sdp = json!({"sdp": "v=0...", "type": "offer"});
        state.handle_event(
            x,
            ClientEvent::Offer { offer: sdp.clone(), to: y.to_string() },
        );

        let y_events = drain(&mut rx_y);
        assert_eq!(y_events.len(), 1);
        assert_eq!(y_events[0], ServerEvent::Offer { offer: sdp, from: x });

        assert!(drain(&mut rx_x).is_empty());
        assert!(drain(&mut rx_z).is_empty());
    }

    #[tokio::test]
    async fn test_relay_to_unknown_target_is_silent() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        state.register(x, out_x);
        join(&mut state, x, "call", "X");
        drain(&mut rx_x);

        state.handle_event(
            x,
            ClientEvent::Offer { offer: json!({}), to: "nonexistent".to_string() },
        );
        state.handle_event(
            x,
            ClientEvent::Offer { offer: json!({}), to: ConnId::new().to_string() },
        );

        // No error reached the sender and it is still registered
        assert!(drain(&mut rx_x).is_empty());
        assert!(state.is_registered(x));
        assert_eq!(state.participant_count("call"), 1);
    }

    #[tokio::test]
    async fn test_toggle_broadcasts_source_excluded() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        let (out_y, mut rx_y) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);
        join(&mut state, x, "call", "X");
        join(&mut state, y, "call", "Y");
        drain(&mut rx_x);
        drain(&mut rx_y);

        state.handle_event(
            x,
            ClientEvent::ToggleVideo { room_name: "call".to_string(), enabled: false },
        );

        let y_events = drain(&mut rx_y);
        assert_eq!(
            y_events,
            vec![ServerEvent::UserVideoToggle { connection_id: x, enabled: false }]
        );
        assert!(drain(&mut rx_x).is_empty());
    }

    #[tokio::test]
    async fn test_toggle_outside_room_is_dropped() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let (out_x, _rx_x) = Outbound::channel();
        let (out_y, mut rx_y) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);
        join(&mut state, y, "call", "Y");
        drain(&mut rx_y);

        state.handle_event(
            x,
            ClientEvent::ToggleAudio { room_name: "call".to_string(), enabled: true },
        );
        assert!(drain(&mut rx_y).is_empty());
    }

    #[tokio::test]
    async fn test_leave_announces_and_tears_down_empty_room() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        let (out_y, mut rx_y) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);
        join(&mut state, x, "call", "X");
        join(&mut state, y, "call", "Y");
        drain(&mut rx_x);
        drain(&mut rx_y);

        state.handle_event(y, ClientEvent::LeaveRoom { room_name: "call".to_string() });
        assert_eq!(
            drain(&mut rx_x),
            vec![ServerEvent::UserLeft { connection_id: y }]
        );
        assert_eq!(state.participant_count("call"), 1);
        assert_eq!(state.room_count(), 1);

        state.handle_event(x, ClientEvent::LeaveRoom { room_name: "call".to_string() });
        assert_eq!(state.room_count(), 0);

        // A fresh join finds no residual participants
        join(&mut state, x, "call", "X");
        assert_eq!(drain(&mut rx_x), vec![ServerEvent::ExistingUsers { users: vec![] }]);
    }

    #[tokio::test]
    async fn test_disconnect_scans_owned_rooms() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let a = ConnId::new();
        let b = ConnId::new();
        let (out_x, _rx_x) = Outbound::channel();
        let (out_a, mut rx_a) = Outbound::channel();
        let (out_b, mut rx_b) = Outbound::channel();
        state.register(x, out_x);
        state.register(a, out_a);
        state.register(b, out_b);

        join(&mut state, a, "east", "A");
        join(&mut state, b, "west", "B");
        join(&mut state, x, "east", "X");
        join(&mut state, x, "west", "X");
        drain(&mut rx_a);
        drain(&mut rx_b);

        state.disconnect(x);

        assert!(!state.is_registered(x));
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::UserLeft { connection_id: x }]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::UserLeft { connection_id: x }]
        );
        assert_eq!(state.participant_count("east"), 1);
        assert_eq!(state.participant_count("west"), 1);
    }

    #[tokio::test]
    async fn test_send_failure_reaps_target_only() {
        let mut state = SignalingState::new();
        let x = ConnId::new();
        let y = ConnId::new();
        let z = ConnId::new();
        let (out_x, mut rx_x) = Outbound::channel();
        let (out_y, rx_y) = Outbound::channel();
        let (out_z, mut rx_z) = Outbound::channel();
        state.register(x, out_x);
        state.register(y, out_y);
        state.register(z, out_z);
        join(&mut state, x, "call", "X");
        join(&mut state, y, "call", "Y");
        join(&mut state, z, "call", "Z");
        drain(&mut rx_x);
        drain(&mut rx_z);

        // Y's writer dies; the next broadcast prunes it and announces the loss
        drop(rx_y);
        state.handle_event(
            x,
            ClientEvent::ToggleVideo { room_name: "call".to_string(), enabled: true },
        );

        assert!(!state.is_registered(y));
        assert_eq!(state.participant_count("call"), 2);
        let z_events = drain(&mut rx_z);
        assert_eq!(
            z_events,
            vec![
                ServerEvent::UserVideoToggle { connection_id: x, enabled: true },
                ServerEvent::UserLeft { connection_id: y },
            ]
        );
        // X still gets Y's departure even though the toggle excluded it
        assert_eq!(
            drain(&mut rx_x),
            vec![ServerEvent::UserLeft { connection_id: y }]
        );
    }

    #[test]
    fn test_client_event_wire_format() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"join-room","roomName":"standup","userId":"u1","userName":"Ada"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                room_name: "standup".to_string(),
                user_id: "u1".to_string(),
                user_name: "Ada".to_string(),
            }
        );

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"shutdown-server"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"join-room"}"#).is_err());
    }

    #[test]
    fn test_server_event_wire_format() {
        let id = ConnId::new();
        let json = serde_json::to_value(ServerEvent::UserVideoToggle {
            connection_id: id,
            enabled: true,
        })
        .unwrap();
        assert_eq!(json["type"], "user-video-toggle");
        assert_eq!(json["connectionId"], json!(id.to_string()));
        assert_eq!(json["enabled"], json!(true));
    }
}
