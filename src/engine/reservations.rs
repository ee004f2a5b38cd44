use std::time::Duration;

use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, RoomState, conflict, stay_price};

fn duration_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.room_for("booking", id)?;
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// Every booking on the room, cancelled ones included, by check-in date.
    pub async fn bookings_for_room(&self, room_id: RoomId) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        let mut bookings: Vec<Booking> = guard.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| (b.range.check_in, b.id));
        Ok(bookings)
    }

    /// RESERVING: re-check the exact range under the room's write lock and stage
    /// a Pending booking. Nothing is written; the caller commits or drops it.
    pub(super) fn stage_reservation(
        &self,
        rs: &RoomState,
        request: &BookingRequest,
    ) -> Result<Booking, EngineError> {
        if !rs.is_available(&request.range, None) {
            return Err(conflict(request.room_id, request.range));
        }
        let total_price = stay_price(self.nightly_rate(&rs.room)?, &request.range)?;
        Ok(Booking {
            id: Ulid::new(),
            room_id: request.room_id,
            guest_id: request.guest_id,
            range: request.range,
            total_price,
            state: BookingState::Pending,
            hold_expires_at: None,
        })
    }

    /// Claim the range as a Pending booking that lapses after the configured
    /// hold TTL unless [`Engine::confirm_hold`] binds a payment first.
    pub async fn place_hold(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        self.settings.validator.validate_booking(&request, None)?;
        self.transact_reserving("place_hold", request.room_id, request.range, || {
            self.try_place_hold(&request)
        })
        .await
    }

    async fn try_place_hold(&self, request: &BookingRequest) -> Result<Booking, EngineError> {
        let _txn = self.begin().await?;
        let mut guard = self.lock_room(request.room_id).await?;
        let mut booking = self.stage_reservation(&guard, request)?;
        let expires_at = self
            .settings
            .clock
            .now_ms()
            .saturating_add(duration_ms(self.settings.hold_ttl));
        booking.hold_expires_at = Some(expires_at);

        let event = Event::BookingCommitted {
            booking: booking.clone(),
            receipt: None,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("hold {} on room {} for {}", booking.id, booking.room_id, booking.range);
        Ok(booking)
    }

    /// Move a live booking to `range`: the old nights are released and the new
    /// ones claimed in one transaction. On conflict the booking is left as it was.
    pub async fn update_booking(&self, id: Ulid, range: DateRange) -> Result<Booking, EngineError> {
        self.settings.validator.validate_range(&range)?;
        let room_id = self.room_for("booking", id)?;
        self.transact_reserving("update_booking", room_id, range, || {
            self.try_update_booking(room_id, id, range)
        })
        .await
    }

    async fn try_update_booking(
        &self,
        room_id: RoomId,
        id: Ulid,
        range: DateRange,
    ) -> Result<Booking, EngineError> {
        let _txn = self.begin().await?;
        let mut guard = self.lock_room(room_id).await?;
        let booking = guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if !booking.state.holds_days() {
            return Err(EngineError::InvalidState {
                id,
                state: booking.state,
                action: "reschedule",
            });
        }
        // Only a move that overlaps the current stay may reuse its own nights.
        let own_nights = booking.range.overlaps(&range).then_some(id);
        if !guard.is_available(&range, own_nights) {
            return Err(conflict(room_id, range));
        }
        let total_price = stay_price(self.nightly_rate(&guard.room)?, &range)?;

        let event = Event::BookingRescheduled {
            id,
            room_id,
            range,
            total_price,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {id} moved from {} to {range}", booking.range);
        guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }
}
