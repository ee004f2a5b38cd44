use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::validation::ValidationErrors;

use super::{Engine, EngineError, RoomState};

impl Engine {
    pub async fn create_room_type(
        &self,
        name: String,
        nightly_rate: Amount,
        capacity: u32,
    ) -> Result<RoomType, EngineError> {
        let mut errors = ValidationErrors::default();
        if name.trim().is_empty() {
            errors.push("name", "required", "");
        } else if name.len() > MAX_NAME_LEN {
            errors.push("name", "max_length", name.len());
        }
        if nightly_rate == 0 {
            errors.push("nightly_rate", "positive", nightly_rate);
        }
        if capacity == 0 {
            errors.push("capacity", "positive", capacity);
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let _txn = self.begin().await?;
        let _inventory = self.inventory.lock().await;
        if self.room_types.len() >= MAX_ROOM_TYPES {
            return Err(EngineError::LimitExceeded("too many room types"));
        }
        let room_type = RoomType {
            id: Ulid::new(),
            name,
            nightly_rate,
            capacity,
        };
        let event = Event::RoomTypeCreated {
            room_type: room_type.clone(),
        };
        self.journal.append(&event).await?;
        self.room_types.insert(room_type.id, room_type.clone());
        info!("room type {} '{}' registered", room_type.id, room_type.name);
        Ok(room_type)
    }

    pub async fn create_room(
        &self,
        id: RoomId,
        room_type_id: Ulid,
        label: Option<String>,
    ) -> Result<Room, EngineError> {
        if label.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("room label too long"));
        }
        if !self.room_types.contains_key(&room_type_id) {
            return Err(EngineError::not_found("room type", room_type_id));
        }

        let _txn = self.begin().await?;
        let _inventory = self.inventory.lock().await;
        if self.rooms.contains_key(&id) {
            return Err(EngineError::already_exists("room", id));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let room = Room {
            id,
            room_type_id,
            label,
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.journal.append(&event).await?;
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        self.notify.send(id, &event);
        info!("room {id} registered");
        Ok(room)
    }

    pub fn get_room_type(&self, id: &Ulid) -> Option<RoomType> {
        self.room_types.get(id).map(|e| e.value().clone())
    }

    pub fn list_room_types(&self) -> Vec<RoomType> {
        let mut types: Vec<RoomType> = self.room_types.iter().map(|e| e.value().clone()).collect();
        types.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        types
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::new();
        for (_, rs) in self.rooms_sorted() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms
    }

    /// Current rate of the room's type. Rates are read at booking time, never cached on rooms.
    pub(super) fn nightly_rate(&self, room: &Room) -> Result<Amount, EngineError> {
        self.room_types
            .get(&room.room_type_id)
            .map(|t| t.nightly_rate)
            .ok_or_else(|| EngineError::not_found("room type", room.room_type_id))
    }
}
