use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only hold expiry uses wall-clock time; calendar keys are dates.
pub type Ms = i64;

/// Money in minor currency units.
pub type Amount = u64;

/// Room number, e.g. `101`. Search results are ordered by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u32);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open stay `[check_in, check_out)`: the check-out day is free for the next guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl DateRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        Self { check_in, check_out }
    }

    /// Number of nights; zero or negative for malformed ranges.
    pub fn nights(&self) -> i64 {
        self.check_out.signed_duration_since(self.check_in).num_days()
    }

    pub fn is_well_formed(&self) -> bool {
        self.check_in < self.check_out
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.check_in <= day && day < self.check_out
    }

    /// Every occupied night, check-in inclusive, check-out exclusive.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d < end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

// ── Inventory ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: Ulid,
    pub name: String,
    pub nightly_rate: Amount,
    /// Maximum number of guests.
    pub capacity: u32,
}

/// A bookable room. References its type by id; the rate is looked up at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub room_type_id: Ulid,
    pub label: Option<String>,
}

// ── Calendar ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Available,
    Occupied,
}

/// One room + date cell of the calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDay {
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub status: DayStatus,
    pub reservation_id: Option<Ulid>,
}

// ── Bookings and receipts ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    /// Claims its days but has no receipt yet (tentative hold).
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingState {
    /// Pending and Confirmed bookings own their calendar days.
    pub fn holds_days(self) -> bool {
        matches!(self, BookingState::Pending | BookingState::Confirmed)
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingState::Pending => "pending",
            BookingState::Confirmed => "confirmed",
            BookingState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: RoomId,
    pub guest_id: Ulid,
    pub range: DateRange,
    pub total_price: Amount,
    pub state: BookingState,
    /// Set on tentative holds only.
    pub hold_expires_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Active,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub paid_on: NaiveDate,
    pub issued_on: NaiveDate,
    pub status: ReceiptStatus,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub room_id: RoomId,
    pub guest_id: Ulid,
    pub range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Amount,
    pub method: PaymentMethod,
    pub paid_on: NaiveDate,
}

/// Partial receipt update; `None` fields are left as issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPatch {
    pub amount: Option<Amount>,
    pub method: Option<PaymentMethod>,
    pub paid_on: Option<NaiveDate>,
}

/// Journal record format. One event is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomTypeCreated {
        room_type: RoomType,
    },
    RoomCreated {
        room: Room,
    },
    /// A new reservation claims its days. Carries the receipt when payment is bound
    /// in the same transaction.
    BookingCommitted {
        booking: Booking,
        receipt: Option<Receipt>,
    },
    HoldConfirmed {
        id: Ulid,
        room_id: RoomId,
        receipt: Receipt,
    },
    /// Old range released and new range claimed together.
    BookingRescheduled {
        id: Ulid,
        room_id: RoomId,
        range: DateRange,
        total_price: Amount,
    },
    BookingCancelled {
        id: Ulid,
        room_id: RoomId,
        refunded_receipt: Option<Ulid>,
    },
    ReceiptIssued {
        room_id: RoomId,
        receipt: Receipt,
    },
    ReceiptUpdated {
        room_id: RoomId,
        receipt: Receipt,
    },
    ReceiptDeleted {
        id: Ulid,
        room_id: RoomId,
    },
    ReceiptRefunded {
        id: Ulid,
        room_id: RoomId,
    },
}

impl Event {
    /// Room whose calendar the event touches. `None` for room-type events.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Event::RoomTypeCreated { .. } => None,
            Event::RoomCreated { room } => Some(room.id),
            Event::BookingCommitted { booking, .. } => Some(booking.room_id),
            Event::HoldConfirmed { room_id, .. }
            | Event::BookingRescheduled { room_id, .. }
            | Event::BookingCancelled { room_id, .. }
            | Event::ReceiptIssued { room_id, .. }
            | Event::ReceiptUpdated { room_id, .. }
            | Event::ReceiptDeleted { room_id, .. }
            | Event::ReceiptRefunded { room_id, .. } => Some(*room_id),
        }
    }
}

#[cfg(test)]
pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
