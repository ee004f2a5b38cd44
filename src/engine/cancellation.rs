use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::payments::booking_in;
use super::{Engine, EngineError, RoomState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refund {
    No,
    /// Refund the active receipt if there is one.
    IfPaid,
    /// The booking must have a receipt; fails before cancelling otherwise.
    Required,
}

impl Engine {
    /// Cancel and free the booking's nights. Cancelling a cancelled booking is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (booking, _) = self.cancel(id, Refund::No).await?;
        Ok(booking)
    }

    /// Cancel and refund the active receipt, if any, as one transaction.
    pub async fn cancel_with_refund(&self, id: Ulid) -> Result<(Booking, Option<Receipt>), EngineError> {
        self.cancel(id, Refund::IfPaid).await
    }

    /// Void the booking's receipt, cancelling the booking in the same transaction
    /// if it is still live. Refunding twice returns the already-refunded receipt.
    pub async fn process_refund(&self, id: Ulid) -> Result<Receipt, EngineError> {
        let (_, receipt) = self.cancel(id, Refund::Required).await?;
        receipt.ok_or_else(|| EngineError::not_found("receipt for booking", id))
    }

    async fn cancel(&self, id: Ulid, refund: Refund) -> Result<(Booking, Option<Receipt>), EngineError> {
        let room_id = self.room_for("booking", id)?;
        self.transact("cancel_booking", || self.try_cancel(room_id, id, refund))
            .await
    }

    async fn try_cancel(
        &self,
        room_id: RoomId,
        id: Ulid,
        refund: Refund,
    ) -> Result<(Booking, Option<Receipt>), EngineError> {
        let _txn = self.begin().await?;
        let mut guard = self.lock_room(room_id).await?;
        let booking = booking_in(&guard, id)?;
        if refund == Refund::Required && !guard.receipts.values().any(|r| r.booking_id == id) {
            return Err(EngineError::not_found("receipt for booking", id));
        }
        let active = match refund {
            Refund::No => None,
            Refund::IfPaid | Refund::Required => guard.active_receipt_for(id).map(|r| r.id),
        };

        let event = match (booking.state, active) {
            (BookingState::Cancelled, None) => None,
            (BookingState::Cancelled, Some(receipt)) => Some(Event::ReceiptRefunded { id: receipt, room_id }),
            (_, refunded_receipt) => Some(Event::BookingCancelled {
                id,
                room_id,
                refunded_receipt,
            }),
        };
        if let Some(event) = event {
            self.persist_and_apply(&mut guard, &event).await?;
            if booking.state.holds_days() {
                metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                debug!("booking {id} cancelled, room {room_id} free for {}", booking.range);
            }
        }

        let refunded = match refund {
            Refund::No => None,
            Refund::IfPaid | Refund::Required => latest_refund(&guard, id),
        };
        Ok((booking_in(&guard, id)?, refunded))
    }

    // ── Hold expiry ──────────────────────────────────────────────

    /// Pending holds whose expiry is at or before `now`. Rooms busy with a
    /// transaction are skipped; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, RoomId)> {
        let mut expired = Vec::new();
        for (room_id, rs) in self.rooms_sorted() {
            let Ok(guard) = rs.try_read() else { continue };
            expired.extend(
                guard
                    .bookings
                    .values()
                    .filter(|b| {
                        b.state == BookingState::Pending
                            && b.hold_expires_at.is_some_and(|at| at <= now)
                    })
                    .map(|b| (b.id, room_id)),
            );
        }
        expired
    }

    /// Cancel a hold if it is still Pending and past expiry. `Ok(false)` when it
    /// was confirmed or cancelled in the meantime.
    pub async fn release_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let room_id = self.room_for("booking", id)?;
        self.transact("release_hold", move || async move {
            let _txn = self.begin().await?;
            let mut guard = self.lock_room(room_id).await?;
            let booking = booking_in(&guard, id)?;
            let now = self.settings.clock.now_ms();
            let lapsed = booking.state == BookingState::Pending
                && booking.hold_expires_at.is_some_and(|at| at <= now);
            if !lapsed {
                return Ok(false);
            }
            let event = Event::BookingCancelled {
                id,
                room_id,
                refunded_receipt: None,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
            info!("hold {id} on room {room_id} expired, {} released", booking.range);
            Ok::<_, EngineError>(true)
        })
        .await
    }
}

fn latest_refund(rs: &RoomState, booking_id: Ulid) -> Option<Receipt> {
    rs.receipts
        .values()
        .filter(|r| r.booking_id == booking_id && r.status == ReceiptStatus::Refunded)
        .max_by_key(|r| r.id)
        .cloned()
}
