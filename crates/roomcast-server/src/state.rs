//! Shared room directory.
//!
//! One global lock guards the set of rooms (creation and destruction only);
//! each room carries its own `RwLock`. Ingress takes per-room write locks
//! for upserts and pose caching, the broadcaster takes them per tick, and
//! neither holds a lock across socket I/O: publishing only enqueues into
//! subscriber channels.

use std::{collections::HashMap, sync::Arc, time::Duration};

use roomcast_core::Room;
use tokio::sync::RwLock;

/// Handle to one room's lock.
pub type RoomSlot = Arc<RwLock<Room>>;

/// All live rooms, created lazily on first reference.
#[derive(Debug)]
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, RoomSlot>>,
    broadcast_floor: Duration,
    broadcast_ceiling: Duration,
}

impl RoomDirectory {
    /// Create an empty directory with the pacing bounds new rooms inherit.
    pub fn new(broadcast_floor: Duration, broadcast_ceiling: Duration) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), broadcast_floor, broadcast_ceiling }
    }

    /// Fetch a room, creating it on first reference.
    pub async fn get_or_create(&self, room_id: &str) -> RoomSlot {
        {
            let rooms = self.rooms.read().await;
            if let Some(slot) = rooms.get(room_id) {
                return Arc::clone(slot);
            }
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_owned()).or_insert_with(|| {
            tracing::info!(room = %room_id, "created room");
            Arc::new(RwLock::new(Room::new(self.broadcast_floor, self.broadcast_ceiling)))
        }))
    }

    /// Fetch an existing room.
    pub async fn get(&self, room_id: &str) -> Option<RoomSlot> {
        self.rooms.read().await.get(room_id).map(Arc::clone)
    }

    /// All rooms, for the broadcaster's sweep.
    pub async fn all(&self) -> Vec<(String, RoomSlot)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(room_id, slot)| (room_id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Drop a room if it is still empty.
    ///
    /// Re-checks emptiness under the directory write lock: a client may have
    /// joined between the tick that scheduled the destruction and this call,
    /// and a room the ingress side currently holds is simply skipped until
    /// the next tick.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(slot) = rooms.get(room_id) else {
            return false;
        };
        let still_empty = slot.try_read().map(|room| room.is_empty()).unwrap_or(false);
        if still_empty {
            rooms.remove(room_id);
        }
        still_empty
    }

    /// Number of live rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// `true` when no rooms exist.
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}
