use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

use super::EngineError;

/// Durable record of committed transactions.
///
/// `append` resolves only once the record is durable; the engine applies an event
/// to memory strictly after that, so a failed append leaves no trace anywhere.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), EngineError>;

    /// Mark the point the next compaction snapshot is taken at. Every record
    /// appended after this is carried into the compacted log.
    async fn begin_compaction(&self) -> Result<(), EngineError>;

    /// Replace the log with `snapshot` followed by the records appended since
    /// [`Journal::begin_compaction`].
    async fn finish_compaction(&self, snapshot: Vec<Event>) -> Result<(), EngineError>;

    async fn appends_since_compact(&self) -> u64;
}

type Reply = oneshot::Sender<Result<(), String>>;

enum WalCommand {
    Append { event: Event, response: Reply },
    BeginCompaction { response: Reply },
    /// `swap` is false when the compacted file could not be written.
    EndCompaction { swap: bool, response: Reply },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// [`Journal`] over a [`Wal`] file, owned by a background writer task that
/// group-commits concurrent appends under a single fsync.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
}

impl WalJournal {
    /// Spawns the writer; must be called from inside a Tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let path = wal.path().to_path_buf();
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx, path }
    }

    async fn request<T>(&self, cmd: WalCommand, rx: oneshot::Receiver<T>) -> Result<T, EngineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))
    }

    async fn control(&self, cmd: impl FnOnce(Reply) -> WalCommand) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.request(cmd(response), rx).await?.map_err(EngineError::Journal)
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let event = event.clone();
        self.control(|response| WalCommand::Append { event, response })
            .await
    }

    async fn begin_compaction(&self) -> Result<(), EngineError> {
        self.control(|response| WalCommand::BeginCompaction { response })
            .await
    }

    async fn finish_compaction(&self, snapshot: Vec<Event>) -> Result<(), EngineError> {
        // The snapshot write is the slow part; appends keep flowing meanwhile.
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || Wal::write_compact_file(&path, &snapshot))
            .await
            .map_err(|e| EngineError::Journal(e.to_string()))
            .and_then(|result| result.map_err(|e| EngineError::Journal(e.to_string())));

        let swap = written.is_ok();
        self.control(|response| WalCommand::EndCompaction { swap, response })
            .await?;
        written
    }

    async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::AppendsSinceCompact { response }, rx)
            .await
            .unwrap_or(0)
    }
}

/// 1. Block for a command.
/// 2. On an append, drain every append already queued behind it.
/// 3. Write the batch, fsync once, answer every sender with the shared outcome.
/// A control command found while draining runs right after the batch commits.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    // Records committed since the pending compaction's snapshot.
    let mut carry: Option<Vec<Event>> = None;

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    let mut batch = vec![(event, response)];
                    while let Ok(queued) = rx.try_recv() {
                        match queued {
                            WalCommand::Append { event, response } => batch.push((event, response)),
                            other => {
                                next = Some(other);
                                break;
                            }
                        }
                    }
                    commit_batch(&mut wal, batch, carry.as_mut());
                }
                WalCommand::BeginCompaction { response } => {
                    carry = Some(Vec::new());
                    let _ = response.send(Ok(()));
                }
                WalCommand::EndCompaction { swap, response } => {
                    let tail = carry.take().unwrap_or_default();
                    let result = if swap {
                        wal.swap_compact_file(&tail).map_err(|e| e.to_string())
                    } else {
                        Ok(())
                    };
                    if !swap || result.is_err() {
                        Wal::remove_compact_file(wal.path());
                    }
                    let _ = response.send(result);
                }
                WalCommand::AppendsSinceCompact { response } => {
                    let _ = response.send(wal.appends_since_compact());
                }
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Reply)>, carry: Option<&mut Vec<Event>>) {
    metrics::histogram!(observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let outcome = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync())
        .map_err(|e| e.to_string());
    if outcome.is_err() {
        // Callers are told the batch failed, so none of it may reach the log later.
        if let Err(cut) = wal.discard_unsynced() {
            tracing::error!("journal rollback failed, retrying before next append: {cut}");
        }
    }

    metrics::histogram!(observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &outcome {
        tracing::error!("journal commit of {} records failed: {e}", batch.len());
    } else if let Some(carry) = carry {
        carry.extend(batch.iter().map(|(event, _)| event.clone()));
    }
    for (_, response) in batch {
        let _ = response.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs::{self, OpenOptions};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hotelcal_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created(n: u32) -> Event {
        Event::RoomCreated {
            room: Room {
                id: RoomId(n),
                room_type_id: Ulid::new(),
                label: None,
            },
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_batch_is_not_flushed_by_the_next_one() {
        let path = tmp_path("failed_batch.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.redirect_writes(OpenOptions::new().write(true).open("/dev/full").unwrap());
        let journal = WalJournal::spawn(wal);

        assert!(journal.append(&room_created(101)).await.is_err());
        assert_eq!(journal.appends_since_compact().await, 0);

        let kept = room_created(202);
        journal.append(&kept).await.unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        assert_eq!(journal.appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn compaction_keeps_appends_made_after_the_snapshot() {
        let path = tmp_path("compaction_tail.wal");
        let journal = WalJournal::spawn(Wal::open(&path).unwrap());
        let first = room_created(101);
        journal.append(&first).await.unwrap();
        journal.append(&room_created(999)).await.unwrap();

        journal.begin_compaction().await.unwrap();
        let late = room_created(102);
        journal.append(&late).await.unwrap();
        journal.finish_compaction(vec![first.clone()]).await.unwrap();
        assert_eq!(journal.appends_since_compact().await, 1);

        let after = room_created(103);
        journal.append(&after).await.unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, late, after]);
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_log_untouched() {
        let dir = tmp_path("missing_dir");
        let path = dir.join("inner.wal");
        let live = tmp_path("untouched.wal");
        let journal = WalJournal {
            path: path.clone(),
            ..WalJournal::spawn(Wal::open(&live).unwrap())
        };
        let first = room_created(101);
        journal.append(&first).await.unwrap();

        journal.begin_compaction().await.unwrap();
        assert!(journal.finish_compaction(Vec::new()).await.is_err());

        let next = room_created(102);
        journal.append(&next).await.unwrap();
        assert_eq!(Wal::replay(&live).unwrap(), vec![first, next]);
    }
}
