//! Rooms and the room manager.
//!
//! A [`Room`] bundles the state store, the per-connection outbound senders,
//! and the timer service behind one `Arc<Mutex<_>>`. Every message handler
//! and timer callback locks the room for its whole mutation-plus-fan-out,
//! which is what serialises the room and makes personalised broadcasts
//! atomic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snapdash_core::protocol::ServerMessage;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::state::{ConnectionId, RoomState};
use crate::timers::{TimerService, Timings};

/// One item on a connection's outbound channel. `Close` tells the write
/// task to send a close frame and stop — the room never touches sockets
/// directly.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Per-connection outbound senders, keyed by transport session.
pub type Senders = HashMap<ConnectionId, OutboundTx>;

/// A single game room: state + connections + timers.
pub struct Room {
    pub code: String,
    pub state: RoomState,
    pub senders: Senders,
    pub timers: TimerService,
    pub timings: Timings,
}

impl Room {
    pub fn new(code: String, timings: Timings) -> Self {
        Self {
            code,
            state: RoomState::new(),
            senders: HashMap::new(),
            timers: TimerService::new(),
            timings,
        }
    }

    /// A room is dead once nothing references it: no live connection and
    /// no player (connected or waiting out a grace period).
    pub fn is_dead(&self) -> bool {
        self.senders.is_empty() && self.state.players.is_empty()
    }
}

/// Manages all active rooms. Rooms are created on first join and removed
/// once dead; independent rooms never contend (each has its own mutex).
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    next_connection_id: AtomicU64,
    timings: Timings,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::with_timings(Timings::default())
    }

    /// Manager whose rooms run with custom timings (shrunk in tests).
    pub fn with_timings(timings: Timings) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            timings,
        }
    }

    /// Mint a process-unique transport session ID.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetch the room for `code` and register the connection's outbound
    /// sender on it, creating the room if absent.
    ///
    /// Creation and first-sender registration happen in one critical
    /// section: a fresh room is never observable with zero senders, so two
    /// connections racing the same new code always land in the same room.
    /// A room that genuinely emptied out (all grace periods elapsed, all
    /// sockets gone) is replaced by a fresh one.
    pub async fn attach_connection(
        &self,
        code: &str,
        connection: ConnectionId,
        tx: OutboundTx,
    ) -> Arc<Mutex<Room>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room_arc) = rooms.get(code) {
                let mut room = room_arc.lock().await;
                if !room.is_dead() {
                    room.senders.insert(connection, tx);
                    return Arc::clone(room_arc);
                }
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check under the write lock: another connection may have won.
        if let Some(room_arc) = rooms.get(code) {
            let mut room = room_arc.lock().await;
            if !room.is_dead() {
                room.senders.insert(connection, tx);
                return Arc::clone(room_arc);
            }
        }
        let mut room = Room::new(code.to_string(), self.timings.clone());
        room.senders.insert(connection, tx);
        let room_arc = Arc::new(Mutex::new(room));
        rooms.insert(code.to_string(), Arc::clone(&room_arc));
        tracing::info!(room = code, "Created room");
        room_arc
    }

    pub async fn get(&self, code: &str) -> Option<Arc<Mutex<Room>>> {
        let rooms = self.rooms.read().await;
        rooms.get(code).cloned()
    }

    /// Drop the room if nothing references it any more.
    pub async fn remove_if_dead(&self, code: &str) {
        let Some(room_arc) = self.get(code).await else {
            return;
        };
        let dead = {
            let mut room = room_arc.lock().await;
            if room.is_dead() {
                room.timers.clear_all();
                true
            } else {
                false
            }
        };
        if dead {
            let mut rooms = self.rooms.write().await;
            if let Some(room_arc) = rooms.get(code) {
                if room_arc.lock().await.is_dead() {
                    rooms.remove(code);
                    tracing::info!(room = code, "Removed dead room");
                }
            }
        }
    }

    /// Active room codes (for the diagnostics API).
    pub async fn list_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms.keys().cloned().collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn racing_first_attaches_share_one_room() {
        // Two players hitting a brand-new code together must not split
        // across two rooms: the room is born with its first sender.
        let manager = RoomManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let a = manager.attach_connection("abc", 1, tx1).await;
        let b = manager.attach_connection("abc", 2, tx2).await;

        assert!(Arc::ptr_eq(&a, &b));
        let room = a.lock().await;
        assert_eq!(room.senders.len(), 2);
        assert_eq!(manager.list_rooms().await.len(), 1);
    }

    #[tokio::test]
    async fn emptied_room_is_replaced_on_next_attach() {
        let manager = RoomManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let a = manager.attach_connection("abc", 1, tx1).await;

        // Last socket unregisters with no players left: the room is dead.
        a.lock().await.senders.remove(&1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let b = manager.attach_connection("abc", 2, tx2).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.lock().await.senders.len(), 1);
    }

    #[tokio::test]
    async fn remove_if_dead_only_removes_dead_rooms() {
        let manager = RoomManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let room_arc = manager.attach_connection("abc", 1, tx).await;

        manager.remove_if_dead("abc").await;
        assert_eq!(manager.list_rooms().await, vec!["abc".to_string()]);

        room_arc.lock().await.senders.remove(&1);
        manager.remove_if_dead("abc").await;
        assert!(manager.list_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let manager = RoomManager::new();
        let a = manager.next_connection_id();
        let b = manager.next_connection_id();
        assert_ne!(a, b);
    }
}
