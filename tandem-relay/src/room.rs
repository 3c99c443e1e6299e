//! Room addressing and the document room registry.
//!
//! Room ids are namespaced by surface kind so a document and a whiteboard
//! sharing a bare entity id can never collide on one room. The registry
//! creates rooms lazily and idempotently; creation is serialized behind a
//! write lock so two concurrent first-connections to the same id always
//! share a single room. Rooms left empty past a grace period are evicted
//! by a periodic sweep and recreated on the next connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::sync::DocRoom;

/// Which collaborative surface a room belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Document,
    Whiteboard,
}

impl Surface {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "documents" => Some(Surface::Document),
            "whiteboards" => Some(Surface::Whiteboard),
            _ => None,
        }
    }

    fn as_segment(&self) -> &'static str {
        match self {
            Surface::Document => "documents",
            Surface::Whiteboard => "whiteboards",
        }
    }
}

/// Namespaced identifier of a document-sync room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    pub surface: Surface,
    pub entity: String,
}

impl RoomId {
    pub fn new(surface: Surface, entity: impl Into<String>) -> Self {
        Self { surface, entity: entity.into() }
    }

    /// Parse the `<surface>/<entity>` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (surface, entity) = s.split_once('/')?;
        let surface = Surface::from_segment(surface)?;
        if entity.is_empty() {
            return None;
        }
        Some(Self::new(surface, entity))
    }

    /// The fixed fallback room for deployments that allow unaddressed
    /// connections.
    pub fn default_room() -> Self {
        Self::new(Surface::Document, "default")
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.surface.as_segment(), self.entity)
    }
}

/// Look up a single query parameter in a raw query string.
pub(crate) fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Resolve a connection target to a room id.
///
/// Accepts the `?room=<surface>/<entity>` query form and the
/// `/<surface>/<entity>` path form. With neither resolvable, falls back to
/// the default room when `allow_default` is set, otherwise refuses.
pub fn resolve_room(path: &str, query: Option<&str>, allow_default: bool) -> Option<RoomId> {
    if let Some(room) = query.and_then(|q| query_param(q, "room")).and_then(RoomId::parse) {
        return Some(room);
    }

    let mut segments = path.split('/').filter(|s| !s.is_empty());
    if let (Some(first), Some(second)) = (segments.next(), segments.next()) {
        if let Some(surface) = Surface::from_segment(first) {
            return Some(RoomId::new(surface, second));
        }
    }

    allow_default.then(RoomId::default_room)
}

/// Registry of live document rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<DocRoom>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self { rooms: RwLock::new(HashMap::new()) }
    }

    /// Get or create the room for the given id.
    pub async fn get_or_create(&self, id: &RoomId) -> Arc<Mutex<DocRoom>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }

        log::info!("Creating room {id}");
        let room = Arc::new(Mutex::new(DocRoom::new(id.clone())));
        rooms.insert(id.clone(), room.clone());
        room
    }

    /// Evict rooms that have sat empty longer than `grace`.
    ///
    /// A room whose lock is currently held is mid-handler and skipped;
    /// the next sweep sees it again.
    pub async fn evict_idle(&self, grace: Duration) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|id, room| {
            let evict = room
                .try_lock()
                .map(|r| r.idle_for().map(|idle| idle >= grace).unwrap_or(false))
                .unwrap_or(false);
            if evict {
                log::info!("Evicting idle room {id}");
            }
            !evict
        });
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains(&self, id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(id)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
