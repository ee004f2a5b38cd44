use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DayCell {
    status: DayStatus,
    reservation: Option<Ulid>,
}

/// Calendar, bookings and receipts of one room.
///
/// Holding the room's write guard is the transaction boundary: every multi-day
/// mutation happens through [`RoomState::apply`] while the guard is held, so no
/// reader ever sees a range half-claimed.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Cells are created lazily and only toggled afterwards, never removed.
    days: BTreeMap<NaiveDate, DayCell>,
    pub bookings: HashMap<Ulid, Booking>,
    pub receipts: HashMap<Ulid, Receipt>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            days: BTreeMap::new(),
            bookings: HashMap::new(),
            receipts: HashMap::new(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.room.id
    }

    fn cells(&self, range: &DateRange) -> impl Iterator<Item = (&NaiveDate, &DayCell)> {
        // BTreeMap::range panics on an inverted range; malformed ranges have no days.
        let bounds = if range.is_well_formed() {
            range.check_in..range.check_out
        } else {
            range.check_in..range.check_in
        };
        self.days.range(bounds)
    }

    /// One entry per night in `range`, in date order. Untouched days read as Available.
    pub fn get_status(&self, range: &DateRange) -> Vec<RoomDay> {
        range
            .days()
            .map(|date| {
                let cell = self.days.get(&date).copied().unwrap_or(DayCell {
                    status: DayStatus::Available,
                    reservation: None,
                });
                RoomDay {
                    room_id: self.room.id,
                    date,
                    status: cell.status,
                    reservation_id: cell.reservation,
                }
            })
            .collect()
    }

    /// True iff every night in `range` is Available, or held by `except` (a booking
    /// being rescheduled may overlap its own days).
    pub fn is_available(&self, range: &DateRange, except: Option<Ulid>) -> bool {
        self.cells(range).all(|(_, cell)| match cell.status {
            DayStatus::Available => true,
            DayStatus::Occupied => except.is_some() && cell.reservation == except,
        })
    }

    pub fn set_occupied(&mut self, range: &DateRange, reservation: Ulid) {
        for date in range.days() {
            self.days.insert(
                date,
                DayCell {
                    status: DayStatus::Occupied,
                    reservation: Some(reservation),
                },
            );
        }
    }

    pub fn set_available(&mut self, range: &DateRange) {
        for date in range.days() {
            if let Some(cell) = self.days.get_mut(&date) {
                cell.status = DayStatus::Available;
                cell.reservation = None;
            }
        }
    }

    pub fn occupied_days(&self) -> usize {
        self.days
            .values()
            .filter(|c| c.status == DayStatus::Occupied)
            .count()
    }

    pub fn active_receipt_for(&self, booking_id: Ulid) -> Option<&Receipt> {
        self.receipts
            .values()
            .find(|r| r.booking_id == booking_id && r.status == ReceiptStatus::Active)
    }

    /// Apply a committed event. Caller holds the write lock.
    pub fn apply(&mut self, event: &Event, index: &DashMap<Ulid, RoomId>) {
        let room_id = self.room.id;
        match event {
            Event::BookingCommitted { booking, receipt } => {
                if booking.state.holds_days() {
                    self.set_occupied(&booking.range, booking.id);
                }
                index.insert(booking.id, room_id);
                self.bookings.insert(booking.id, booking.clone());
                if let Some(r) = receipt {
                    index.insert(r.id, room_id);
                    self.receipts.insert(r.id, r.clone());
                }
            }
            Event::HoldConfirmed { id, receipt, .. } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.state = BookingState::Confirmed;
                    b.hold_expires_at = None;
                }
                index.insert(receipt.id, room_id);
                self.receipts.insert(receipt.id, receipt.clone());
            }
            Event::BookingRescheduled {
                id,
                range,
                total_price,
                ..
            } => {
                let Some(old) = self.bookings.get(id).map(|b| b.range) else {
                    return;
                };
                self.set_available(&old);
                self.set_occupied(range, *id);
                if let Some(b) = self.bookings.get_mut(id) {
                    b.range = *range;
                    b.total_price = *total_price;
                }
            }
            Event::BookingCancelled {
                id,
                refunded_receipt,
                ..
            } => {
                let Some(b) = self.bookings.get(id) else {
                    return;
                };
                if b.state.holds_days() {
                    let range = b.range;
                    self.set_available(&range);
                }
                if let Some(b) = self.bookings.get_mut(id) {
                    b.state = BookingState::Cancelled;
                    b.hold_expires_at = None;
                }
                if let Some(rid) = refunded_receipt
                    && let Some(r) = self.receipts.get_mut(rid)
                {
                    r.status = ReceiptStatus::Refunded;
                }
            }
            Event::ReceiptIssued { receipt, .. } => {
                index.insert(receipt.id, room_id);
                self.receipts.insert(receipt.id, receipt.clone());
            }
            Event::ReceiptUpdated { receipt, .. } => {
                self.receipts.insert(receipt.id, receipt.clone());
            }
            Event::ReceiptDeleted { id, .. } => {
                self.receipts.remove(id);
                index.remove(id);
            }
            Event::ReceiptRefunded { id, .. } => {
                if let Some(r) = self.receipts.get_mut(id) {
                    r.status = ReceiptStatus::Refunded;
                }
            }
            // Handled at the map level.
            Event::RoomTypeCreated { .. } | Event::RoomCreated { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::date;

    fn room() -> RoomState {
        RoomState::new(Room {
            id: RoomId(101),
            room_type_id: Ulid::new(),
            label: None,
        })
    }

    fn range(a: u32, b: u32) -> DateRange {
        DateRange::new(date(2025, 3, a), date(2025, 3, b))
    }

    fn confirmed(range: DateRange) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id: RoomId(101),
            guest_id: Ulid::new(),
            range,
            total_price: 100 * range.nights() as u64,
            state: BookingState::Confirmed,
            hold_expires_at: None,
        }
    }

    #[test]
    fn untouched_days_read_available() {
        let rs = room();
        let days = rs.get_status(&range(1, 4));
        assert_eq!(days.len(), 3);
        assert!(days.iter().all(|d| d.status == DayStatus::Available && d.reservation_id.is_none()));
        assert!(rs.is_available(&range(1, 4), None));
    }

    #[test]
    fn set_occupied_claims_every_night_in_order() {
        let mut rs = room();
        let id = Ulid::new();
        rs.set_occupied(&range(1, 4), id);
        let days = rs.get_status(&range(1, 5));
        assert_eq!(days[0].date, date(2025, 3, 1));
        assert_eq!(days[2].date, date(2025, 3, 3));
        assert!(days[..3].iter().all(|d| d.status == DayStatus::Occupied && d.reservation_id == Some(id)));
        assert_eq!(days[3].status, DayStatus::Available); // check-out day stays free
        assert_eq!(rs.occupied_days(), 3);
    }

    #[test]
    fn set_available_toggles_without_forgetting_the_row() {
        let mut rs = room();
        rs.set_occupied(&range(1, 4), Ulid::new());
        rs.set_available(&range(1, 4));
        assert_eq!(rs.occupied_days(), 0);
        assert_eq!(rs.days.len(), 3);
        assert!(rs.is_available(&range(1, 4), None));
    }

    #[test]
    fn availability_ignores_own_days() {
        let mut rs = room();
        let id = Ulid::new();
        rs.set_occupied(&range(1, 4), id);
        assert!(!rs.is_available(&range(3, 6), None));
        assert!(rs.is_available(&range(3, 6), Some(id)));
        assert!(!rs.is_available(&range(3, 6), Some(Ulid::new())));
        assert!(rs.is_available(&range(4, 6), None));
    }

    #[test]
    fn malformed_range_reads_nothing() {
        let mut rs = room();
        rs.set_occupied(&range(1, 4), Ulid::new());
        assert!(rs.get_status(&range(4, 1)).is_empty());
        assert!(rs.is_available(&range(4, 1), None));
    }

    #[test]
    fn apply_commit_and_cancel() {
        let mut rs = room();
        let index = DashMap::new();
        let booking = confirmed(range(1, 4));
        let receipt = Receipt {
            id: Ulid::new(),
            booking_id: booking.id,
            amount: 300,
            method: PaymentMethod::Card,
            paid_on: date(2025, 2, 1),
            issued_on: date(2025, 2, 1),
            status: ReceiptStatus::Active,
        };
        rs.apply(
            &Event::BookingCommitted {
                booking: booking.clone(),
                receipt: Some(receipt.clone()),
            },
            &index,
        );
        assert_eq!(rs.occupied_days(), 3);
        assert_eq!(index.get(&booking.id).map(|e| *e.value()), Some(RoomId(101)));
        assert_eq!(index.get(&receipt.id).map(|e| *e.value()), Some(RoomId(101)));
        assert_eq!(rs.active_receipt_for(booking.id).map(|r| r.id), Some(receipt.id));

        rs.apply(
            &Event::BookingCancelled {
                id: booking.id,
                room_id: RoomId(101),
                refunded_receipt: Some(receipt.id),
            },
            &index,
        );
        assert_eq!(rs.occupied_days(), 0);
        assert_eq!(rs.bookings[&booking.id].state, BookingState::Cancelled);
        assert_eq!(rs.receipts[&receipt.id].status, ReceiptStatus::Refunded);
        assert!(rs.active_receipt_for(booking.id).is_none());
    }

    #[test]
    fn apply_reschedule_moves_days() {
        let mut rs = room();
        let index = DashMap::new();
        let booking = confirmed(range(1, 4));
        rs.apply(&Event::BookingCommitted { booking: booking.clone(), receipt: None }, &index);
        rs.apply(
            &Event::BookingRescheduled {
                id: booking.id,
                room_id: RoomId(101),
                range: range(3, 7),
                total_price: 400,
            },
            &index,
        );
        assert!(rs.is_available(&range(1, 3), None));
        assert_eq!(rs.occupied_days(), 4);
        let b = &rs.bookings[&booking.id];
        assert_eq!(b.range, range(3, 7));
        assert_eq!(b.total_price, 400);
    }

    #[test]
    fn cancelled_booking_on_replay_claims_nothing() {
        let mut rs = room();
        let mut booking = confirmed(range(1, 4));
        booking.state = BookingState::Cancelled;
        rs.apply(&Event::BookingCommitted { booking, receipt: None }, &DashMap::new());
        assert_eq!(rs.occupied_days(), 0);
        assert_eq!(rs.bookings.len(), 1);
    }
}
