use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_REQUEST_BYTES;
use crate::model::*;
use crate::observability;

fn one() -> u32 {
    1
}

/// One request line. `op` selects the operation; dates are `YYYY-MM-DD` and
/// stays run from `check_in` up to, not including, `check_out`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Search {
        check_in: NaiveDate,
        check_out: NaiveDate,
        #[serde(default = "one")]
        guests: u32,
        #[serde(default)]
        room_type_id: Option<Ulid>,
    },
    Check {
        room_id: RoomId,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    Calendar {
        room_id: RoomId,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    Book {
        room_id: RoomId,
        guest_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        payment: PaymentRequest,
    },
    Hold {
        room_id: RoomId,
        guest_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    ConfirmHold {
        booking_id: Ulid,
        payment: PaymentRequest,
    },
    GetBooking {
        booking_id: Ulid,
    },
    UpdateBooking {
        booking_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    CancelBooking {
        booking_id: Ulid,
        #[serde(default)]
        refund: bool,
    },
    ProcessRefund {
        booking_id: Ulid,
    },
    BookingsForRoom {
        room_id: RoomId,
    },
    CreateReceipt {
        booking_id: Ulid,
        payment: PaymentRequest,
    },
    GetReceipt {
        receipt_id: Ulid,
    },
    UpdateReceipt {
        receipt_id: Ulid,
        #[serde(default)]
        patch: ReceiptPatch,
    },
    DeleteReceipt {
        receipt_id: Ulid,
    },
    ListReceipts {
        booking_id: Ulid,
    },
    CreateRoomType {
        name: String,
        nightly_rate: Amount,
        capacity: u32,
    },
    ListRoomTypes,
    CreateRoom {
        room_id: RoomId,
        room_type_id: Ulid,
        #[serde(default)]
        label: Option<String>,
    },
    ListRooms,
}

/// Connection-scoped requests. They touch the session, not the engine.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SessionRequest {
    Subscribe { room_id: RoomId },
    Unsubscribe { room_id: RoomId },
}

fn error_reply(kind: &str, message: impl ToString) -> Value {
    json!({ "error": { "kind": kind, "message": message.to_string() } })
}

fn engine_error_reply(e: &EngineError) -> Value {
    let mut reply = error_reply(e.kind(), e);
    if let EngineError::Validation(errors) = e {
        reply["error"]["violations"] = json!(errors.violations);
    }
    reply
}

async fn dispatch(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    let reply = match request {
        Request::Search {
            check_in,
            check_out,
            guests,
            room_type_id,
        } => {
            let range = DateRange::new(check_in, check_out);
            json!(engine.find_available_rooms(room_type_id, &range, guests).await?)
        }
        Request::Check {
            room_id,
            check_in,
            check_out,
        } => {
            let range = DateRange::new(check_in, check_out);
            json!({ "available": engine.check_room_availability(room_id, &range).await? })
        }
        Request::Calendar {
            room_id,
            check_in,
            check_out,
        } => json!(engine.calendar(room_id, &DateRange::new(check_in, check_out)).await?),
        Request::Book {
            room_id,
            guest_id,
            check_in,
            check_out,
            payment,
        } => {
            let request = BookingRequest {
                room_id,
                guest_id,
                range: DateRange::new(check_in, check_out),
            };
            let (booking, receipt) = engine.create_booking_with_payment(request, payment).await?;
            json!({ "booking": booking, "receipt": receipt })
        }
        Request::Hold {
            room_id,
            guest_id,
            check_in,
            check_out,
        } => {
            let request = BookingRequest {
                room_id,
                guest_id,
                range: DateRange::new(check_in, check_out),
            };
            json!(engine.place_hold(request).await?)
        }
        Request::ConfirmHold { booking_id, payment } => {
            let (booking, receipt) = engine.confirm_hold(booking_id, payment).await?;
            json!({ "booking": booking, "receipt": receipt })
        }
        Request::GetBooking { booking_id } => json!(engine.get_booking(booking_id).await?),
        Request::UpdateBooking {
            booking_id,
            check_in,
            check_out,
        } => json!(
            engine
                .update_booking(booking_id, DateRange::new(check_in, check_out))
                .await?
        ),
        Request::CancelBooking { booking_id, refund } => {
            let (booking, receipt) = if refund {
                engine.cancel_with_refund(booking_id).await?
            } else {
                (engine.cancel_booking(booking_id).await?, None)
            };
            json!({ "booking": booking, "refunded_receipt": receipt })
        }
        Request::ProcessRefund { booking_id } => json!(engine.process_refund(booking_id).await?),
        Request::BookingsForRoom { room_id } => json!(engine.bookings_for_room(room_id).await?),
        Request::CreateReceipt { booking_id, payment } => {
            json!(engine.create_receipt(booking_id, payment).await?)
        }
        Request::GetReceipt { receipt_id } => json!(engine.get_receipt(receipt_id).await?),
        Request::UpdateReceipt { receipt_id, patch } => {
            json!(engine.update_receipt(receipt_id, patch).await?)
        }
        Request::DeleteReceipt { receipt_id } => {
            engine.delete_receipt(receipt_id).await?;
            json!({ "deleted": receipt_id })
        }
        Request::ListReceipts { booking_id } => json!(engine.receipts_for_booking(booking_id).await?),
        Request::CreateRoomType {
            name,
            nightly_rate,
            capacity,
        } => json!(engine.create_room_type(name, nightly_rate, capacity).await?),
        Request::ListRoomTypes => json!(engine.list_room_types()),
        Request::CreateRoom {
            room_id,
            room_type_id,
            label,
        } => json!(engine.create_room(room_id, room_type_id, label).await?),
        Request::ListRooms => json!(engine.list_rooms().await),
    };
    Ok(reply)
}

/// Run one engine request and render its reply line, recording RED metrics.
pub async fn handle_request(engine: &Engine, request: Request) -> Value {
    let op = observability::op_label(&request);
    let started = Instant::now();
    let result = dispatch(engine, request).await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => {
            debug!("{op} failed: {e}");
            engine_error_reply(&e)
        }
    }
}

/// Queued outbound lines per connection. A subscriber that stops reading loses
/// events rather than growing this queue.
const SESSION_QUEUE_CAPACITY: usize = 256;

/// A line pushed to the client outside request/reply order.
#[derive(Debug, PartialEq)]
enum Outbound {
    Event { room_id: RoomId, event: Event },
    /// Events for `room_id` were dropped because the client fell behind.
    Lagged { room_id: RoomId, dropped: u64 },
}

impl Outbound {
    fn to_json(&self) -> Value {
        match self {
            Outbound::Event { room_id, event } => {
                json!({ "event": { "room_id": room_id, "record": event } })
            }
            Outbound::Lagged { room_id, dropped } => {
                json!({ "lagged": { "room_id": room_id, "dropped": dropped } })
            }
        }
    }
}

/// Move one room's broadcast into a connection queue. Drops are counted and
/// reported with a `Lagged` line before the next event that fits.
async fn forward_room_events(
    room_id: RoomId,
    mut rx: broadcast::Receiver<Event>,
    tx: mpsc::Sender<Outbound>,
) {
    let mut dropped = 0u64;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("subscriber on room {room_id} lagged, {n} events dropped");
                dropped += n;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if dropped > 0 {
            match tx.try_send(Outbound::Lagged { room_id, dropped }) {
                Ok(()) => dropped = 0,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    continue;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        match tx.try_send(Outbound::Event { room_id, event }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if dropped == 0 {
                    warn!("subscriber on room {room_id} is not reading, dropping events");
                }
                dropped += 1;
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Room subscriptions of one connection. Each forwards its room's broadcast
/// into the connection's outbound queue; dropping the session stops them all.
struct Session {
    forwarders: HashMap<RoomId, JoinHandle<()>>,
    outbound: mpsc::Sender<Outbound>,
}

impl Session {
    fn subscribe(&mut self, engine: &Engine, room_id: RoomId) -> Result<(), EngineError> {
        if engine.room_state(&room_id).is_none() {
            return Err(EngineError::not_found("room", room_id));
        }
        if self.forwarders.contains_key(&room_id) {
            return Ok(());
        }
        let rx = engine.notify.subscribe(room_id);
        let handle = tokio::spawn(forward_room_events(room_id, rx, self.outbound.clone()));
        self.forwarders.insert(room_id, handle);
        Ok(())
    }

    fn unsubscribe(&mut self, room_id: RoomId) -> bool {
        match self.forwarders.remove(&room_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.forwarders.values() {
            handle.abort();
        }
    }
}

fn handle_session(session: &mut Session, engine: &Engine, request: SessionRequest) -> Value {
    match request {
        SessionRequest::Subscribe { room_id } => match session.subscribe(engine, room_id) {
            Ok(()) => json!({ "ok": { "subscribed": room_id } }),
            Err(e) => engine_error_reply(&e),
        },
        SessionRequest::Unsubscribe { room_id } => {
            json!({ "ok": { "unsubscribed": session.unsubscribe(room_id) } })
        }
    }
}

fn codec_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve newline-delimited JSON requests until the peer hangs up. Every request
/// line gets exactly one reply line, in order; subscribed room events are
/// interleaved as `{"event": ...}` lines.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));
    let (outbound_tx, mut outbound_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    let mut session = Session {
        forwarders: HashMap::new(),
        outbound: outbound_tx,
    };

    loop {
        let reply = tokio::select! {
            line = framed.next() => match line {
                None => break,
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    if let Ok(request) = serde_json::from_str::<SessionRequest>(&line) {
                        handle_session(&mut session, &engine, request)
                    } else {
                        match serde_json::from_str::<Request>(&line) {
                            Ok(request) => handle_request(&engine, request).await,
                            Err(e) => error_reply("bad_request", e),
                        }
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    error_reply("bad_request", format!("request exceeds {MAX_REQUEST_BYTES} bytes"))
                }
                Some(Err(e)) => return Err(codec_error(e)),
            },
            Some(line) = outbound_rx.recv() => line.to_json(),
        };
        framed.send(reply.to_string()).await.map_err(codec_error)?;
    }
    Ok(())
}
