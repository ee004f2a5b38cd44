use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// A length prefix above this is treated as corruption rather than allocated.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next record and its framed size. `None` at end of log, on a torn
/// tail, or at the first record whose checksum or payload is bad.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, 8 + len as u64)))
}

/// Intact records from the start of the log, the length they cover, and the
/// file's full length.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0, 0)),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = decode_record(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len, file_len))
}

/// Append-only booking journal. Every committed transaction is one record;
/// replaying the records in order rebuilds calendars, bookings and receipts.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful fsync.
    durable_len: u64,
    appends_since_compact: u64,
    durable_appends: u64,
    /// Set after a failed write until the file is cut back to `durable_len`.
    needs_truncate: bool,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            appends_since_compact: 0,
            durable_appends: 0,
            needs_truncate: false,
        })
    }

    /// Buffer a record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.needs_truncate {
            self.discard_unsynced()?;
        }
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.needs_truncate {
            return Err(io::Error::other("journal tail awaiting truncation"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.durable_appends = self.appends_since_compact;
        Ok(())
    }

    /// Forget every record since the last successful fsync: bytes still in the
    /// buffer and any part of them that already reached the file. On error the
    /// cut is retried before the next append.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.needs_truncate = true;
        let file = open_append(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.replace_writer(file);
        self.appends_since_compact = self.durable_appends;
        self.needs_truncate = false;
        Ok(())
    }

    /// Swap in a writer over `file`, dropping the old buffer unwritten.
    fn replace_writer(&mut self, file: File) {
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
    }

    /// Point the writer at another file, e.g. a device that rejects writes.
    #[cfg(test)]
    pub(crate) fn redirect_writes(&mut self, file: File) {
        self.writer = BufWriter::new(file);
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log beside the live one and fsync it. Slow; runs
    /// off the writer task.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Append `tail` (records committed since the snapshot was taken) to the
    /// compacted file, rename it over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self, tail: &[Event]) -> io::Result<()> {
        let tmp_path = Self::compact_tmp_path(&self.path);
        let mut writer = BufWriter::new(OpenOptions::new().append(true).open(&tmp_path)?);
        for event in tail {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &self.path)?;
        let file = open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.replace_writer(file);
        self.appends_since_compact = tail.len() as u64;
        self.durable_appends = self.appends_since_compact;
        self.needs_truncate = false;
        Ok(())
    }

    /// Drop a compacted file that will not be swapped in.
    pub fn remove_compact_file(path: &Path) {
        let _ = fs::remove_file(Self::compact_tmp_path(path));
    }

    /// All intact records from the start of the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _, _)| events)
    }

    /// [`Wal::replay`], then cut off any torn or corrupt tail so new appends
    /// land directly after the last intact record. Returns the records and the
    /// number of bytes cut.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let (events, valid_len, file_len) = read_log(path)?;
        if file_len > valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((events, file_len - valid_len))
    }
}
