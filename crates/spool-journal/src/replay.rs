//! Recovery stream over a journal file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::JournalError;
use crate::record::{read_record, ReadOutcome, Record};

/// A forward pass over every complete record in a journal file.
///
/// The stream stops at the first truncated trailing record (a crash
/// mid-append leaves one) and remembers the end of the last complete record
/// so the journal can be reopened for append exactly there.
pub struct Replay {
    reader: Option<BufReader<File>>,
    position: u64,
    record_start: u64,
    valid_end: u64,
}

impl Replay {
    /// Opens a replay stream over the file at `path`.
    ///
    /// A missing file is not an error: the stream is simply empty, which is
    /// the state of a queue that has never journaled anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let reader = match File::open(path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            reader,
            position: 0,
            record_start: 0,
            valid_end: 0,
        })
    }

    /// Decodes the next record, or `None` at the end of the recoverable
    /// prefix (clean end of file or a torn tail).
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure, an unknown tag, or a corrupt record.
    /// [`valid_end`](Self::valid_end) still reports the end of the records
    /// decoded so far, so the caller can keep that prefix as authoritative.
    pub fn next_record(&mut self) -> Result<Option<Record>, JournalError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        self.record_start = self.position;
        match read_record(reader, self.position)? {
            ReadOutcome::Record(record) => {
                self.position += record.encoded_len();
                self.valid_end = self.position;
                Ok(Some(record))
            }
            ReadOutcome::Eof | ReadOutcome::Truncated { .. } => {
                self.reader = None;
                Ok(None)
            }
        }
    }

    /// Byte offset where the most recently returned record starts.
    #[must_use]
    pub fn record_start(&self) -> u64 {
        self.record_start
    }

    /// End of the last complete record decoded so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.valid_end
    }
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("position", &self.position)
            .field("valid_end", &self.valid_end)
            .finish_non_exhaustive()
    }
}
