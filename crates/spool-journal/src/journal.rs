//! Append-only journal for a single queue.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::JournalError;
use crate::item::{now_ms, Item};
use crate::record::{read_record, ReadOutcome, Record};
use crate::replay::Replay;

/// The append-only on-disk log of one queue's mutations.
///
/// Exactly one file lives at `<dir>/<name>`. The owning queue serializes all
/// access under its lock, so the journal itself carries no synchronization.
/// In read-behind mode a second, independent read handle trails the write
/// position and streams items back into memory on demand.
pub struct Journal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    write_pos: u64,
    sync: bool,
    closed: bool,
    read_behind: Option<ReadBehind>,
}

struct ReadBehind {
    reader: BufReader<File>,
    position: u64,
}

impl Journal {
    /// Opens (or prepares to create) the journal for queue `name` under
    /// `dir`. The file itself is created on the first append, so erased
    /// journals stay erased until something is written again.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the existing
    /// file cannot be examined.
    pub fn open(dir: &Path, name: &str, sync: bool) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let write_pos = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            writer: None,
            write_pos,
            sync,
            closed: false,
            read_behind: None,
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current journal length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.write_pos
    }

    /// Controls whether every append is forced to disk before returning.
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    /// Appends one record.
    ///
    /// The record is flushed to the file unconditionally (the read-behind
    /// cursor reads the same file through a separate handle) and additionally
    /// synced to disk when sync mode is on.
    ///
    /// # Errors
    ///
    /// Any IO failure here is fatal for the owning queue.
    pub fn append(&mut self, record: &Record) -> Result<(), JournalError> {
        let mut buf = Vec::with_capacity(record.encoded_len() as usize);
        record.encode(&mut buf);
        let sync = self.sync;
        let writer = self.writer()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_data()?;
        }
        self.write_pos += buf.len() as u64;
        Ok(())
    }

    /// Appends an enqueue record for `item`.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn add(&mut self, item: &Item) -> Result<(), JournalError> {
        self.append(&Record::AddX {
            expiry_ms: item.expiry,
            data: item.data.clone(),
        })
    }

    /// Appends a non-transactional dequeue record.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn remove(&mut self) -> Result<(), JournalError> {
        self.append(&Record::Remove)
    }

    /// Appends a tentative dequeue record for transaction `xid`.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn remove_tentative(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append(&Record::RemoveTentativeX(xid))
    }

    /// Appends a rollback record for transaction `xid`.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn unremove(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append(&Record::Unremove(xid))
    }

    /// Appends a commit record for transaction `xid`.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn confirm_remove(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append(&Record::ConfirmRemove(xid))
    }

    /// Appends a transaction-counter snapshot.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn saved_xid(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append(&Record::SavedXid(xid))
    }

    /// Atomically rewrites the journal so it holds only the records needed to
    /// reconstruct the present queue state: the transaction counter, every
    /// open transaction as an enqueue immediately re-marked tentative, and
    /// every live item.
    ///
    /// The caller must not be in read-behind mode; the queue only rolls when
    /// the whole working set is memory-resident.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement file cannot be written, synced, or
    /// renamed over the primary.
    pub fn roll<'a, O, L>(&mut self, xid: u32, open: O, live: L) -> Result<(), JournalError>
    where
        O: IntoIterator<Item = &'a Item>,
        L: IntoIterator<Item = &'a Item>,
    {
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".pack");
        let tmp_path = PathBuf::from(tmp_name);

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut buf = Vec::new();
        let mut size = write_record(&mut writer, &mut buf, &Record::SavedXid(xid))?;
        for item in open {
            size += write_record(
                &mut writer,
                &mut buf,
                &Record::AddX {
                    expiry_ms: item.expiry,
                    data: item.data.clone(),
                },
            )?;
            size += write_record(&mut writer, &mut buf, &Record::RemoveTentativeX(item.xid))?;
        }
        for item in live {
            size += write_record(
                &mut writer,
                &mut buf,
                &Record::AddX {
                    expiry_ms: item.expiry,
                    data: item.data.clone(),
                },
            )?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        drop(writer);

        self.writer = None;
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            old_size = self.write_pos,
            new_size = size,
            "rolled journal"
        );
        self.write_pos = size;
        Ok(())
    }

    /// Deletes the journal file. The journal stays usable: the next append
    /// recreates an empty file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn erase(&mut self) -> Result<(), JournalError> {
        self.writer = None;
        self.read_behind = None;
        self.write_pos = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Closes the journal. Further appends fail with
    /// [`JournalError::Closed`].
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
        self.writer = None;
        self.read_behind = None;
        self.closed = true;
    }

    /// Opens a replay stream over the current journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened.
    pub fn replay(&self) -> Result<Replay, JournalError> {
        Replay::open(&self.path)
    }

    /// Finishes a replay by discarding any torn tail past `valid_end` and
    /// positioning future appends there.
    ///
    /// # Errors
    ///
    /// Returns an error if the tail cannot be truncated.
    pub fn finish_replay(&mut self, valid_end: u64) -> Result<(), JournalError> {
        self.writer = None;
        match OpenOptions::new().write(true).open(&self.path) {
            Ok(file) => {
                if file.metadata()?.len() > valid_end {
                    file.set_len(valid_end)?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.write_pos = valid_end;
        Ok(())
    }

    /// Places the read-behind cursor at `position` (the start of the first
    /// enqueue record whose item is not memory-resident). From here on the
    /// queue appends without populating memory and streams items back in
    /// through [`fill_read_behind`](Self::fill_read_behind).
    ///
    /// # Errors
    ///
    /// Returns an error if the journal file cannot be opened for reading.
    pub fn start_read_behind(&mut self, position: u64) -> Result<(), JournalError> {
        // The cursor needs the file on disk even if nothing has been appended
        // yet; opening the writer creates it.
        self.writer()?;
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position))?;
        debug!(path = %self.path.display(), position, "entering read-behind");
        self.read_behind = Some(ReadBehind { reader, position });
        Ok(())
    }

    /// True while the read-behind cursor is active.
    #[must_use]
    pub fn in_read_behind(&self) -> bool {
        self.read_behind.is_some()
    }

    /// Advances the read-behind cursor to the next enqueue record and
    /// materializes its item. Non-enqueue records are skipped. Returns `None`
    /// once the cursor reaches the write position, which ends read-behind
    /// mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor hits an IO failure or undecodable data;
    /// the data was decodable when appended, so either is fatal for the
    /// owning queue.
    pub fn fill_read_behind(&mut self) -> Result<Option<Item>, JournalError> {
        loop {
            let Some(rb) = self.read_behind.as_mut() else {
                return Ok(None);
            };
            if rb.position >= self.write_pos {
                debug!(path = %self.path.display(), "read-behind caught up, resuming in-memory");
                self.read_behind = None;
                return Ok(None);
            }
            match read_record(&mut rb.reader, rb.position)? {
                ReadOutcome::Record(record) => {
                    rb.position += record.encoded_len();
                    match record {
                        Record::Add { data } => return Ok(Some(Item::new(now_ms(), 0, data))),
                        Record::AddX { expiry_ms, data } => {
                            return Ok(Some(Item::new(now_ms(), expiry_ms, data)))
                        }
                        _ => {}
                    }
                }
                ReadOutcome::Eof | ReadOutcome::Truncated { .. } => {
                    self.read_behind = None;
                    return Ok(None);
                }
            }
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, JournalError> {
        if self.closed {
            return Err(JournalError::Closed);
        }
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer.as_mut().ok_or(JournalError::Closed)
    }
}

fn write_record(
    writer: &mut BufWriter<File>,
    buf: &mut Vec<u8>,
    record: &Record,
) -> Result<u64, JournalError> {
    buf.clear();
    record.encode(buf);
    writer.write_all(buf)?;
    Ok(buf.len() as u64)
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("write_pos", &self.write_pos)
            .field("sync", &self.sync)
            .field("closed", &self.closed)
            .field("in_read_behind", &self.read_behind.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn item(data: &'static [u8]) -> Item {
        Item::new(now_ms(), 0, Bytes::from_static(data))
    }

    fn open_journal(dir: &TempDir) -> Journal {
        Journal::open(dir.path(), "jobs", false).unwrap()
    }

    fn replay_all(journal: &Journal) -> Vec<Record> {
        let mut replay = journal.replay().unwrap();
        let mut records = Vec::new();
        while let Some(record) = replay.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_append_tracks_size() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        assert_eq!(journal.size(), 0);

        journal.add(&item(b"abc")).unwrap();
        journal.remove().unwrap();
        let expected = Record::AddX {
            expiry_ms: 0,
            data: Bytes::from_static(b"abc"),
        }
        .encoded_len()
            + Record::Remove.encoded_len();
        assert_eq!(journal.size(), expected);
        assert_eq!(fs::metadata(journal.path()).unwrap().len(), expected);
    }

    #[test]
    fn test_reopen_resumes_at_end() {
        let dir = TempDir::new().unwrap();
        let size = {
            let mut journal = open_journal(&dir);
            journal.add(&item(b"abc")).unwrap();
            journal.size()
        };
        let mut journal = open_journal(&dir);
        assert_eq!(journal.size(), size);
        journal.remove().unwrap();
        assert_eq!(replay_all(&journal).len(), 2);
    }

    #[test]
    fn test_closed_journal_refuses_appends() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        journal.close();
        assert!(matches!(
            journal.remove().unwrap_err(),
            JournalError::Closed
        ));
    }

    #[test]
    fn test_erase_then_append_recreates() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        journal.add(&item(b"abc")).unwrap();
        journal.erase().unwrap();
        assert!(!journal.path().exists());
        assert_eq!(journal.size(), 0);

        journal.add(&item(b"def")).unwrap();
        assert!(journal.path().exists());
        assert_eq!(replay_all(&journal).len(), 1);
    }

    #[test]
    fn test_finish_replay_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        journal.add(&item(b"kept")).unwrap();
        let valid = journal.size();

        // A crash mid-append leaves a partial record behind.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(journal.path())
                .unwrap();
            file.write_all(&[0x06, 0x01]).unwrap();
        }

        let mut journal = open_journal(&dir);
        let mut replay = journal.replay().unwrap();
        while replay.next_record().unwrap().is_some() {}
        let end = replay.valid_end();
        assert_eq!(end, valid);
        drop(replay);
        journal.finish_replay(end).unwrap();
        assert_eq!(fs::metadata(journal.path()).unwrap().len(), valid);

        journal.remove().unwrap();
        assert_eq!(replay_all(&journal).len(), 2);
    }

    #[test]
    fn test_roll_rewrites_to_current_state() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        for _ in 0..10 {
            journal.add(&item(b"junk")).unwrap();
            journal.remove().unwrap();
        }
        let before = journal.size();

        let mut open_item = item(b"pending");
        open_item.xid = 4;
        let live = [item(b"first"), item(b"second")];
        journal.roll(7, [&open_item], live.iter()).unwrap();
        assert!(journal.size() < before);

        let records = replay_all(&journal);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], Record::SavedXid(7));
        assert_eq!(
            records[1],
            Record::AddX {
                expiry_ms: 0,
                data: Bytes::from_static(b"pending")
            }
        );
        assert_eq!(records[2], Record::RemoveTentativeX(4));
        assert_eq!(
            records[3],
            Record::AddX {
                expiry_ms: 0,
                data: Bytes::from_static(b"first")
            }
        );
        assert_eq!(
            records[4],
            Record::AddX {
                expiry_ms: 0,
                data: Bytes::from_static(b"second")
            }
        );

        // The rolled file is append-ready.
        journal.remove().unwrap();
        assert_eq!(replay_all(&journal).len(), 6);
    }

    #[test]
    fn test_read_behind_streams_adds_only() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        journal.add(&item(b"resident")).unwrap();
        let cursor = journal.size();
        journal.add(&item(b"spilled-1")).unwrap();
        journal.remove().unwrap();
        journal.add(&item(b"spilled-2")).unwrap();

        journal.start_read_behind(cursor).unwrap();
        assert!(journal.in_read_behind());

        let first = journal.fill_read_behind().unwrap().unwrap();
        assert_eq!(&first.data[..], b"spilled-1");
        // The Remove record between the two adds is skipped.
        let second = journal.fill_read_behind().unwrap().unwrap();
        assert_eq!(&second.data[..], b"spilled-2");

        assert!(journal.fill_read_behind().unwrap().is_none());
        assert!(!journal.in_read_behind());
    }

    #[test]
    fn test_read_behind_sees_appends_after_cursor_opens() {
        let dir = TempDir::new().unwrap();
        let mut journal = open_journal(&dir);
        journal.add(&item(b"a")).unwrap();
        journal.start_read_behind(journal.size()).unwrap();

        // Appended after the cursor opened, still streamed.
        journal.add(&item(b"b")).unwrap();
        let streamed = journal.fill_read_behind().unwrap().unwrap();
        assert_eq!(&streamed.data[..], b"b");
        assert!(journal.fill_read_behind().unwrap().is_none());
    }
}
