use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, RoomState};

impl Engine {
    /// Reserve the range and bind the payment to it as one transaction.
    ///
    /// The winner is whoever commits reservation and receipt together: a
    /// conflict means no payment is recorded, and a receipt failure means the
    /// staged reservation is dropped with every night still free.
    pub async fn create_booking_with_payment(
        &self,
        request: BookingRequest,
        payment: PaymentRequest,
    ) -> Result<(Booking, Receipt), EngineError> {
        self.settings
            .validator
            .validate_booking(&request, Some(&payment))?;
        self.transact_reserving(
            "create_booking_with_payment",
            request.room_id,
            request.range,
            || self.try_book_with_payment(&request, &payment),
        )
        .await
    }

    async fn try_book_with_payment(
        &self,
        request: &BookingRequest,
        payment: &PaymentRequest,
    ) -> Result<(Booking, Receipt), EngineError> {
        let _txn = self.begin().await?;
        let mut guard = self.lock_room(request.room_id).await?;

        let mut booking = self.stage_reservation(&guard, request)?;
        let receipt = self.issue_receipt(&booking, payment)?;
        booking.state = BookingState::Confirmed;

        let event = Event::BookingCommitted {
            booking: booking.clone(),
            receipt: Some(receipt.clone()),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        debug!(
            "booking {} confirmed on room {} for {} (receipt {})",
            booking.id, booking.room_id, booking.range, receipt.id
        );
        Ok((booking, receipt))
    }

    /// Build the receipt for `booking`. The payment must cover the stay exactly.
    fn issue_receipt(&self, booking: &Booking, payment: &PaymentRequest) -> Result<Receipt, EngineError> {
        if payment.amount != booking.total_price {
            return Err(EngineError::PaymentMismatch {
                expected: booking.total_price,
                got: payment.amount,
            });
        }
        Ok(Receipt {
            id: Ulid::new(),
            booking_id: booking.id,
            amount: payment.amount,
            method: payment.method,
            paid_on: payment.paid_on,
            issued_on: self.settings.clock.today(),
            status: ReceiptStatus::Active,
        })
    }

    /// Bind a payment to a Pending hold, making it Confirmed.
    pub async fn confirm_hold(
        &self,
        id: Ulid,
        payment: PaymentRequest,
    ) -> Result<(Booking, Receipt), EngineError> {
        self.settings.validator.validate_payment(&payment)?;
        let room_id = self.room_for("booking", id)?;
        self.transact("confirm_hold", || self.try_confirm_hold(room_id, id, &payment))
            .await
    }

    async fn try_confirm_hold(
        &self,
        room_id: RoomId,
        id: Ulid,
        payment: &PaymentRequest,
    ) -> Result<(Booking, Receipt), EngineError> {
        let _txn = self.begin().await?;
        let mut guard = self.lock_room(room_id).await?;
        let booking = booking_in(&guard, id)?;
        if booking.state != BookingState::Pending {
            return Err(EngineError::InvalidState {
                id,
                state: booking.state,
                action: "confirm",
            });
        }
        if booking
            .hold_expires_at
            .is_some_and(|at| at <= self.settings.clock.now_ms())
        {
            return Err(EngineError::InvalidState {
                id,
                state: booking.state,
                action: "confirm expired hold for",
            });
        }
        let receipt = self.issue_receipt(&booking, payment)?;

        let event = Event::HoldConfirmed {
            id,
            room_id,
            receipt: receipt.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        debug!("hold {id} confirmed with receipt {}", receipt.id);
        Ok((booking_in(&guard, id)?, receipt))
    }

    // ── Receipts ─────────────────────────────────────────────────

    /// Issue a receipt for a Confirmed booking that has none active.
    pub async fn create_receipt(&self, booking_id: Ulid, payment: PaymentRequest) -> Result<Receipt, EngineError> {
        self.settings.validator.validate_payment(&payment)?;
        let room_id = self.room_for("booking", booking_id)?;
        let payment = &payment;
        self.transact("create_receipt", move || async move {
            let _txn = self.begin().await?;
            let mut guard = self.lock_room(room_id).await?;
            let booking = booking_in(&guard, booking_id)?;
            if booking.state != BookingState::Confirmed {
                return Err(EngineError::InvalidState {
                    id: booking_id,
                    state: booking.state,
                    action: "issue a receipt for",
                });
            }
            if let Some(active) = guard.active_receipt_for(booking_id) {
                return Err(EngineError::already_exists("receipt", active.id));
            }
            let receipt = self.issue_receipt(&booking, payment)?;
            let event = Event::ReceiptIssued {
                room_id,
                receipt: receipt.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            Ok(receipt)
        })
        .await
    }

    pub async fn get_receipt(&self, id: Ulid) -> Result<Receipt, EngineError> {
        let room_id = self.room_for("receipt", id)?;
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        guard
            .receipts
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("receipt", id))
    }

    pub async fn update_receipt(&self, id: Ulid, patch: ReceiptPatch) -> Result<Receipt, EngineError> {
        self.settings.validator.validate_patch(&patch)?;
        let room_id = self.room_for("receipt", id)?;
        let patch = &patch;
        self.transact("update_receipt", move || async move {
            let _txn = self.begin().await?;
            let mut guard = self.lock_room(room_id).await?;
            let mut receipt = guard
                .receipts
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("receipt", id))?;
            if receipt.status == ReceiptStatus::Refunded {
                let booking = booking_in(&guard, receipt.booking_id)?;
                return Err(EngineError::InvalidState {
                    id: booking.id,
                    state: booking.state,
                    action: "edit the refunded receipt of",
                });
            }
            if let Some(amount) = patch.amount {
                receipt.amount = amount;
            }
            if let Some(method) = patch.method {
                receipt.method = method;
            }
            if let Some(paid_on) = patch.paid_on {
                receipt.paid_on = paid_on;
            }
            let event = Event::ReceiptUpdated {
                room_id,
                receipt: receipt.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            Ok(receipt)
        })
        .await
    }

    /// Remove a receipt. The booking keeps its nights; releasing them takes a cancellation.
    pub async fn delete_receipt(&self, id: Ulid) -> Result<(), EngineError> {
        let room_id = self.room_for("receipt", id)?;
        self.transact("delete_receipt", move || async move {
            let _txn = self.begin().await?;
            let mut guard = self.lock_room(room_id).await?;
            if !guard.receipts.contains_key(&id) {
                return Err(EngineError::not_found("receipt", id));
            }
            let event = Event::ReceiptDeleted { id, room_id };
            self.persist_and_apply(&mut guard, &event).await
        })
        .await
    }

    pub async fn receipts_for_booking(&self, booking_id: Ulid) -> Result<Vec<Receipt>, EngineError> {
        let room_id = self.room_for("booking", booking_id)?;
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        let mut receipts: Vec<Receipt> = guard
            .receipts
            .values()
            .filter(|r| r.booking_id == booking_id)
            .cloned()
            .collect();
        receipts.sort_by_key(|r| r.id);
        Ok(receipts)
    }
}

pub(super) fn booking_in(rs: &RoomState, id: Ulid) -> Result<Booking, EngineError> {
    rs.bookings
        .get(&id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("booking", id))
}
