//! Room manager: maps room ids to live rooms.
//!
//! Rooms are created on first use and share one storage driver. A room is
//! only dropped once nobody outside the manager holds it, it has no sessions,
//! and `before_unload` lets it go. A connection still joining holds its
//! `Arc<Room>`, so one room id never maps to two live rooms.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::hooks::{DefaultHooks, RoomHooks};
use crate::room::{Room, RoomConfig};
use crate::storage::Driver;

pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    driver: Arc<dyn Driver>,
    config: RoomConfig,
    hooks: Arc<dyn RoomHooks>,
    clock: Arc<dyn Clock>,
}

impl RoomManager {
    pub fn new(driver: Arc<dyn Driver>, config: RoomConfig) -> Self {
        Self::with_parts(driver, config, Arc::new(DefaultHooks), Arc::new(SystemClock))
    }

    pub fn with_parts(
        driver: Arc<dyn Driver>,
        config: RoomConfig,
        hooks: Arc<dyn RoomHooks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            driver,
            config,
            hooks,
            clock,
        }
    }

    /// Get or create the room. Storage is loaded lazily by the room itself.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::with_parts(
            room_id,
            self.driver.clone(),
            self.config.clone(),
            self.hooks.clone(),
            self.clock.clone(),
        ));
        rooms.insert(room_id.to_string(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Unload and forget a room that only the manager still references.
    /// Returns false if the room is in use, unknown, or refused to unload.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id) else {
            return false;
        };
        // New handles are only given out under this lock
        if Arc::strong_count(room) > 1 {
            log::debug!("Room {room_id} still in use, keeping it");
            return false;
        }
        if room.session_count().await > 0 || room.pending() > 0 {
            return false;
        }
        if let Err(e) = room.unload().await {
            log::info!("Keeping room {room_id} loaded: {e}");
            return false;
        }
        rooms.remove(room_id);
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookError;
    use crate::session::{RecordingTransport, TicketOptions};
    use crate::storage::MemoryDriver;

    fn manager() -> RoomManager {
        RoomManager::new(Arc::new(MemoryDriver::new()), RoomConfig::for_testing())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let manager = manager();
        let a = manager.get_or_create("doc").await;
        let b = manager.get_or_create("doc").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = manager();
        manager.get_or_create("b").await;
        manager.get_or_create("a").await;
        assert_eq!(manager.active_rooms().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let manager = manager();
        let room = manager.get_or_create("doc").await;
        room.load().await.unwrap();
        let ticket = room.create_ticket(TicketOptions::default()).unwrap();
        let key = ticket.session_key().to_string();
        room.start_browser_session(ticket, RecordingTransport::new()).await.unwrap();

        assert!(!manager.remove_if_empty("doc").await);
        room.end_browser_session(&key, crate::session::CloseReason::Normal).await;
        let weak = Arc::downgrade(&room);
        drop(room);
        assert!(manager.remove_if_empty("doc").await);
        assert!(weak.upgrade().is_none());
        assert_eq!(manager.room_count().await, 0);
        assert!(!manager.remove_if_empty("doc").await);
    }

    #[tokio::test]
    async fn test_joining_connection_keeps_room_alive() {
        let manager = manager();
        // A connection has the room but no session yet
        let joining = manager.get_or_create("doc").await;
        joining.load().await.unwrap();
        assert!(!manager.remove_if_empty("doc").await);

        let ticket = joining.create_ticket(TicketOptions::default()).unwrap();
        joining.start_browser_session(ticket, RecordingTransport::new()).await.unwrap();
        let again = manager.get_or_create("doc").await;
        assert!(Arc::ptr_eq(&joining, &again));
        assert_eq!(again.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_vetoed_unload_keeps_room() {
        struct Sticky;
        impl RoomHooks for Sticky {
            fn before_unload(&self, _room_id: &str) -> Result<(), HookError> {
                Err(HookError::Vetoed("busy".into()))
            }
        }
        let manager = RoomManager::with_parts(
            Arc::new(MemoryDriver::new()),
            RoomConfig::for_testing(),
            Arc::new(Sticky),
            Arc::new(SystemClock),
        );
        manager.get_or_create("doc").await.load().await.unwrap();
        assert!(!manager.remove_if_empty("doc").await);
        assert!(manager.get("doc").await.unwrap().is_loaded());
        assert_eq!(manager.room_count().await, 1);
    }
}
