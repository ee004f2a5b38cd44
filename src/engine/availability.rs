use ulid::Ulid;

use crate::limits::MAX_CALENDAR_WINDOW_DAYS;
use crate::model::*;
use crate::validation::ValidationErrors;

use super::{Engine, EngineError};

/// Reads take no exclusive lock, so they only check the range's shape; the
/// reservation path re-validates availability under the room lock.
fn check_window(range: &DateRange) -> Result<(), EngineError> {
    let mut errors = ValidationErrors::default();
    if !range.is_well_formed() {
        errors.push("check_out", "after_check_in", range.check_out);
    } else if range.nights() > MAX_CALENDAR_WINDOW_DAYS {
        errors.push("check_out", "max_window", range.nights());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(errors))
    }
}

impl Engine {
    /// True iff every night of `range` is free on `room_id`.
    pub async fn is_room_available(&self, room_id: RoomId, range: &DateRange) -> Result<bool, EngineError> {
        check_window(range)?;
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        Ok(guard.is_available(range, None))
    }

    /// Per-night status of one room over `range`, in date order.
    pub async fn calendar(&self, room_id: RoomId, range: &DateRange) -> Result<Vec<RoomDay>, EngineError> {
        check_window(range)?;
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        Ok(guard.get_status(range))
    }

    /// Rooms free for the whole range, optionally of one type, that sleep at
    /// least `min_capacity` guests. Ordered by room number.
    pub async fn find_available_rooms(
        &self,
        room_type: Option<Ulid>,
        range: &DateRange,
        min_capacity: u32,
    ) -> Result<Vec<Room>, EngineError> {
        check_window(range)?;
        if let Some(t) = room_type
            && !self.room_types.contains_key(&t)
        {
            return Err(EngineError::not_found("room type", t));
        }

        let mut free = Vec::new();
        for (_, rs) in self.rooms_sorted() {
            let guard = rs.read().await;
            let room = &guard.room;
            if room_type.is_some_and(|t| t != room.room_type_id) {
                continue;
            }
            let capacity = self
                .room_types
                .get(&room.room_type_id)
                .map_or(0, |t| t.capacity);
            if capacity >= min_capacity && guard.is_available(range, None) {
                free.push(room.clone());
            }
        }
        Ok(free)
    }

    /// Client-facing availability check; same answer as [`Engine::is_room_available`].
    pub async fn check_room_availability(&self, room_id: RoomId, range: &DateRange) -> Result<bool, EngineError> {
        self.is_room_available(room_id, range).await
    }

    pub async fn search_availability(&self, range: &DateRange, guest_count: u32) -> Result<Vec<Room>, EngineError> {
        self.find_available_rooms(None, range, guest_count).await
    }
}
