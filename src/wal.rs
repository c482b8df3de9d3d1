use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::Event;

/// One WAL entry: events that become visible together or not at all.
pub type Record = Vec<Event>;

/// Length prefix plus crc trailer.
const FRAME_OVERHEAD: u64 = 8;

fn encode_record(writer: &mut impl Write, record: &[Event], max_len: usize) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL record of {} bytes exceeds {max_len}", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first (torn tail).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next intact payload, or `None` at end of log / first damaged entry.
fn next_payload(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Every intact record and the number of bytes they span from the start.
fn scan(path: &Path) -> io::Result<(Vec<Record>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut intact = 0u64;
    while let Some(payload) = next_payload(&mut reader)? {
        match bincode::deserialize::<Record>(&payload) {
            Ok(record) => {
                intact += FRAME_OVERHEAD + payload.len() as u64;
                records.push(record);
            }
            Err(_) => break,
        }
    }
    Ok((records, intact))
}

/// Append-only write-ahead log of commit records.
///
/// Entry format: `[u32: len][bincode: Vec<Event>][u32: crc32]`, little endian.
/// `len` covers the payload only. A torn or corrupt entry ends replay, which
/// drops the whole record and never half of it.
///
/// Appends collect in `pending` until `flush_sync`. A failed batch is undone
/// with `rollback`, which drops the pending bytes and truncates the file back
/// to the last synced length, so nothing from the batch can reach disk later.
pub struct Wal {
    file: File,
    pending: Vec<u8>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    /// Set when a truncate failed; retried before the next write.
    needs_truncate: bool,
    appends_since_compact: u64,
    durable_appends: u64,
    max_record_bytes: usize,
}

impl Wal {
    /// Open for appends. A damaged tail left by a crash is cut off first so
    /// new records do not land behind bytes replay cannot get past.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, intact) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            tracing::warn!(
                "truncating {} damaged WAL bytes at offset {intact} in {}",
                on_disk - intact,
                path.display()
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            pending: Vec::new(),
            path: path.to_path_buf(),
            durable_len: intact,
            needs_truncate: false,
            appends_since_compact: 0,
            durable_appends: 0,
            max_record_bytes: MAX_WAL_RECORD_BYTES,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    /// Append and fsync a single record. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, record: &[Event]) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without writing it. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, record: &[Event]) -> io::Result<()> {
        encode_record(&mut self.pending, record, self.max_record_bytes)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.needs_truncate {
            self.truncate_to_durable()?;
        }
        if !self.pending.is_empty() {
            self.file.write_all(&self.pending)?;
        }
        self.file.sync_all()?;
        self.durable_len += self.pending.len() as u64;
        self.pending.clear();
        self.durable_appends = self.appends_since_compact;
        Ok(())
    }

    /// Forget everything appended since the last successful `flush_sync`,
    /// whether still pending or partly written.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.appends_since_compact = self.durable_appends;
        self.needs_truncate = true;
        self.truncate_to_durable()
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()?;
        self.needs_truncate = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<path>.wal.tmp` and fsync it. Slow; the live log
    /// is untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        // Snapshot entries are independent, one event per record keeps them small.
        for event in snapshot {
            encode_record(&mut writer, std::slice::from_ref(event), MAX_WAL_RECORD_BYTES)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.needs_truncate = false;
        self.appends_since_compact = 0;
        self.durable_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        scan(path).map(|(records, _)| records)
    }
}
