use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Written once at the start of every log file.
const MAGIC: &[u8; 8] = b"MILKWAL1";

/// A length prefix above this is corruption, not a real record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log file front to back.
struct Scan {
    events: Vec<Event>,
    /// Bytes up to the end of the last intact record.
    valid_len: u64,
    file_len: u64,
}

/// Read up to `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Scan {
                events: Vec::new(),
                valid_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();

    let mut magic = [0u8; MAGIC.len()];
    if !read_full(&mut reader, &mut magic)? {
        // Too short to hold even the header: treat as empty and rewrite it.
        return Ok(Scan {
            events,
            valid_len: 0,
            file_len,
        });
    }
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a milkrun log", path.display()),
        ));
    }
    let mut valid_len = MAGIC.len() as u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            break;
        }
        let mut payload = vec![0u8; len];
        if !read_full(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        valid_len += (4 + len + 4) as u64;
    }

    Ok(Scan {
        events,
        valid_len,
        file_len,
    })
}

/// Append-only write-ahead log.
///
/// File layout: an 8-byte magic header, then records of
/// `[u32: len][bincode: Event][u32: crc32]`. A torn or corrupt tail is cut off
/// when the log is opened, so new records never land behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path` and return the events it already holds.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let scan = scan(path)?;
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        if scan.valid_len < scan.file_len {
            warn!(
                "{}: discarding {} bytes of torn or corrupt tail",
                path.display(),
                scan.file_len - scan.valid_len
            );
            file.set_len(scan.valid_len)?;
        }
        if scan.valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
        }
        file.seek(io::SeekFrom::End(0))?;
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: scan.events.len() as u64,
        };
        Ok((wal, scan.events))
    }

    /// Events currently in the log at `path`. A missing file holds none.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.events)
    }

    /// Append and fsync one event. Production goes through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` as a complete log to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Records written since the last compaction, counting those found at open.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Customer, CustomerStatus};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("milkrun_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn customer_event(name: &str) -> Event {
        Event::CustomerUpserted {
            customer: Customer {
                id: Ulid::new(),
                name: Some(name.into()),
                status: CustomerStatus::Active,
                area: None,
                delivery_boy_id: None,
                staff_id: None,
            },
        }
    }

    fn status_event(id: Ulid, status: CustomerStatus) -> Event {
        Event::CustomerStatusChanged { id, status }
    }

    #[test]
    fn append_and_reopen() {
        let path = tmp_path("append_and_reopen.wal");
        let events = vec![customer_event("Asha"), status_event(Ulid::new(), CustomerStatus::Paused)];
        {
            let (mut wal, existing) = Wal::open(&path).unwrap();
            assert!(existing.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let (wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(wal.appends_since_compact(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_cut_and_appends_survive() {
        let path = tmp_path("torn_tail.wal");
        let first = customer_event("Asha");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        let second = customer_event("Bala");
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&customer_event("Asha")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"definitely not a log file").unwrap();
        let err = Wal::open(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let keep = customer_event("Asha");
        let Event::CustomerUpserted { customer } = &keep else { unreachable!() };
        let id = customer.id;
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for _ in 0..20 {
            wal.append(&status_event(id, CustomerStatus::Paused)).unwrap();
            wal.append(&status_event(id, CustomerStatus::Active)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");

        let next = status_event(id, CustomerStatus::Trial);
        wal.append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| customer_event(&format!("c{i}"))).collect();
        let (mut wal, _) = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
