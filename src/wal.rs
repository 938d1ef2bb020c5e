use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a record may declare. A bigger length prefix can only come
/// from a corrupt tail.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended (cleanly or
/// mid-record); the caller stops replaying either way.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry. `None` on end of log, truncation or corruption.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_chunk(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_chunk(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_chunk(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only write-ahead log of appointment and registry events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is discarded on replay.
///
/// A batch that fails to commit is cut back off the file. If even that fails
/// the log is poisoned: `writer` stays `None` and every later append errors
/// until a compaction rewrites the file.
pub struct Wal {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit(std::slice::from_ref(event))
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("WAL poisoned by an earlier failed rollback"))
    }

    /// Write and fsync a batch as a unit. On any error the file is cut back
    /// to its length before the batch, so no record of a failed batch can
    /// surface on replay.
    pub fn commit(&mut self, events: &[Event]) -> io::Result<()> {
        let committed_len = self.writer()?.get_ref().metadata()?.len();
        let written = events
            .iter()
            .try_for_each(|event| self.append_buffered(event))
            .and_then(|()| self.flush_sync());
        match written {
            Ok(()) => {
                self.appends_since_compact += events.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback(committed_len) {
                    tracing::error!("WAL rollback failed, refusing further appends: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Buffer an event without flushing. Nothing is durable until `flush_sync`.
    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(self.writer()?, event)
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Drop whatever is still buffered and truncate the file to `len`. The
    /// writer is only put back once the truncation is durable.
    fn rollback(&mut self, len: u64) -> io::Result<()> {
        let writer = self.writer.take().ok_or_else(|| io::Error::other("WAL poisoned"))?;
        let (file, _unwritten) = writer.into_parts();
        file.set_len(len)?;
        file.sync_all()?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over
    /// the WAL and reopen for appending.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk, returning all valid events.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_next(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
