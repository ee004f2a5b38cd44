mod availability;
mod calendar;
mod cancellation;
mod error;
mod inventory;
mod journal;
mod payments;
mod reservations;

pub use calendar::RoomState;
pub use error::EngineError;
pub use journal::{Journal, WalJournal};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::validation::Validator;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Collaborators and tunables injected into the engine.
#[derive(Clone)]
pub struct EngineSettings {
    pub validator: Validator,
    pub clock: Arc<dyn Clock>,
    /// Longest a transaction waits for a room lock before aborting.
    pub lock_timeout: Duration,
    /// Lifetime of a tentative hold.
    pub hold_ttl: Duration,
}

impl EngineSettings {
    pub fn new(clock: Arc<dyn Clock>, max_stay_nights: u32, horizon_days: u32) -> Self {
        Self {
            validator: Validator::new(max_stay_nights, horizon_days, clock.clone()),
            clock,
            lock_timeout: Duration::from_secs(2),
            hold_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// The room-calendar transaction core.
///
/// Each room's [`RoomState`] sits behind its own `RwLock`, so transactions on
/// different rooms never contend. A mutating transaction:
/// 1. enters the commit gate (shared),
/// 2. takes the room's write lock (bounded wait),
/// 3. re-validates and stages its change as a single [`Event`],
/// 4. appends the event to the journal and only then applies it to memory.
///
/// Any failure before step 4 completes drops the staged event; nothing is undone
/// because nothing was done.
pub struct Engine {
    rooms: DashMap<RoomId, SharedRoomState>,
    room_types: DashMap<Ulid, RoomType>,
    /// Booking and receipt id → owning room.
    entity_to_room: DashMap<Ulid, RoomId>,
    journal: Arc<dyn Journal>,
    /// Shared by every transaction, exclusive while compaction snapshots state.
    commit_gate: RwLock<()>,
    /// One compaction at a time.
    compaction: Mutex<()>,
    /// Serializes room and room-type registration.
    inventory: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    settings: EngineSettings,
}

impl Engine {
    /// Replay the journal at `wal_path` and start its background writer.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        let (history, cut) = Wal::recover(&wal_path)?;
        if cut > 0 {
            warn!("journal had a torn or corrupt tail; cut {cut} bytes after the last intact record");
        }
        let journal = Arc::new(WalJournal::spawn(Wal::open(&wal_path)?));
        Ok(Self::with_journal(journal, &history, notify, settings))
    }

    /// Build an engine over any journal, rebuilding state from `history`.
    pub fn with_journal(
        journal: Arc<dyn Journal>,
        history: &[Event],
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        let engine = Self {
            rooms: DashMap::new(),
            room_types: DashMap::new(),
            entity_to_room: DashMap::new(),
            journal,
            commit_gate: RwLock::new(()),
            compaction: Mutex::new(()),
            inventory: Mutex::new(()),
            notify,
            settings,
        };
        for event in history {
            engine.replay_event(event);
        }
        if !history.is_empty() {
            info!(
                "replayed {} journal records: {} rooms, {} room types",
                history.len(),
                engine.rooms.len(),
                engine.room_types.len()
            );
        }
        engine
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomTypeCreated { room_type } => {
                self.room_types.insert(room_type.id, room_type.clone());
            }
            Event::RoomCreated { room } => {
                let rs = RoomState::new(room.clone());
                self.rooms.insert(room.id, Arc::new(RwLock::new(rs)));
            }
            other => {
                let Some(rs) = other.room_id().and_then(|id| self.room_state(&id)) else {
                    warn!("replay: skipping record for unknown room: {other:?}");
                    return;
                };
                // Sole owner during replay; never block, this may run inside a runtime.
                match rs.try_write() {
                    Ok(mut guard) => guard.apply(other, &self.entity_to_room),
                    Err(_) => warn!("replay: room busy, record skipped"),
                }
            }
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn room_state(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_entity(&self, id: &Ulid) -> Option<RoomId> {
        self.entity_to_room.get(id).map(|e| *e.value())
    }

    pub(super) fn room_for(&self, kind: &'static str, id: Ulid) -> Result<RoomId, EngineError> {
        self.room_for_entity(&id)
            .ok_or_else(|| EngineError::not_found(kind, id))
    }

    /// Room states in room-number order.
    pub(super) fn rooms_sorted(&self) -> Vec<(RoomId, SharedRoomState)> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);
        rooms
    }

    /// Enter a transaction. Held until the transaction commits or aborts; the
    /// wait is bounded like a room lock wait.
    pub(super) async fn begin(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        match tokio::time::timeout(self.settings.lock_timeout, self.commit_gate.read()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(self.lock_timed_out("commit gate".into())),
        }
    }

    fn lock_timed_out(&self, target: String) -> EngineError {
        metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        warn!("lock wait on {target} exceeded {:?}", self.settings.lock_timeout);
        EngineError::LockTimeout(target)
    }

    /// Exclusive access to one room's calendar, or `LockTimeout` after the bounded wait.
    pub(super) async fn lock_room(
        &self,
        room_id: RoomId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        match tokio::time::timeout(self.settings.lock_timeout, rs.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(self.lock_timed_out(format!("room {room_id}"))),
        }
    }

    /// Journal, then apply, then publish. Caller holds the room's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal.append(event).await?;
        rs.apply(event, &self.entity_to_room);
        self.notify.send(rs.id(), event);
        Ok(())
    }

    /// Run `attempt`, and once more if it hit a store-level abort. Each attempt
    /// re-reads and re-validates from scratch.
    pub(super) async fn transact<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match attempt().await {
            Err(e) if e.is_retryable() => {
                metrics::counter!(observability::TRANSACTION_RETRIES_TOTAL, "op" => op).increment(1);
                debug!("{op}: retrying after {e}");
                attempt().await
            }
            other => other,
        }
    }

    /// [`Engine::transact`] for transactions that claim days: a lock wait that
    /// fails twice is reported as a conflict on the requested range.
    pub(super) async fn transact_reserving<T, F, Fut>(
        &self,
        op: &'static str,
        room: RoomId,
        range: DateRange,
        attempt: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match self.transact(op, attempt).await {
            Err(EngineError::LockTimeout(_)) => Err(conflict(room, range)),
            other => other,
        }
    }

    /// Rewrite the journal as the minimal record set that rebuilds current state.
    ///
    /// Transactions are paused only while the snapshot is taken in memory.
    /// Writing it out happens alongside new commits, which the journal carries
    /// over into the compacted log.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let _single = self.compaction.lock().await;
        let events = {
            let _exclusive = self.commit_gate.write().await;
            let events = self.snapshot_events().await;
            self.journal.begin_compaction().await?;
            events
        };

        let count = events.len();
        self.journal.finish_compaction(events).await?;
        info!("journal compacted to {count} snapshot records");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut room_types: Vec<RoomType> = self.room_types.iter().map(|e| e.value().clone()).collect();
        room_types.sort_by_key(|t| t.id);
        let mut events: Vec<Event> = room_types
            .into_iter()
            .map(|room_type| Event::RoomTypeCreated { room_type })
            .collect();

        for (_, rs) in self.rooms_sorted() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            let mut bookings: Vec<&Booking> = guard.bookings.values().collect();
            bookings.sort_by_key(|b| b.id);
            events.extend(bookings.into_iter().map(|b| Event::BookingCommitted {
                booking: b.clone(),
                receipt: None,
            }));
            let mut receipts: Vec<&Receipt> = guard.receipts.values().collect();
            receipts.sort_by_key(|r| r.id);
            events.extend(receipts.into_iter().map(|r| Event::ReceiptIssued {
                room_id: guard.id(),
                receipt: r.clone(),
            }));
        }
        events
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}

pub(super) fn conflict(room: RoomId, range: DateRange) -> EngineError {
    metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
    debug!("room {room} unavailable for {range}");
    EngineError::Conflict { room, range }
}

/// `nights × nightly_rate`.
pub(super) fn stay_price(nightly_rate: Amount, range: &DateRange) -> Result<Amount, EngineError> {
    let nights = u64::try_from(range.nights()).map_err(|_| EngineError::LimitExceeded("negative stay"))?;
    nightly_rate
        .checked_mul(nights)
        .ok_or(EngineError::LimitExceeded("total price overflows"))
}
