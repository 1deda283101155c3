//! On-disk journal record kinds and their little-endian codec.
//!
//! The format is fixed: one tag byte followed by the payload of that kind.
//! Length prefixes cover the payload bytes only. Writers emit `AddX` and
//! `RemoveTentativeX`; the legacy `Add` and `RemoveTentative` kinds are still
//! decoded so journals written by older versions replay cleanly.

use std::io::{ErrorKind, Read};

use bytes::Bytes;

use crate::error::JournalError;

const TAG_ADD: u8 = 0x00;
const TAG_REMOVE: u8 = 0x01;
const TAG_REMOVE_TENTATIVE: u8 = 0x02;
const TAG_SAVED_XID: u8 = 0x03;
const TAG_UNREMOVE: u8 = 0x04;
const TAG_CONFIRM_REMOVE: u8 = 0x05;
const TAG_ADD_X: u8 = 0x06;
const TAG_REMOVE_TENTATIVE_X: u8 = 0x07;

/// Upper bound on a decoded payload length. A prefix above this is treated as
/// corruption rather than an allocation request.
const LARGEST_DATA: u32 = 32 << 20;

/// A single journal mutation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Legacy enqueue without expiry (tag `0x00`).
    Add {
        /// Payload bytes.
        data: Bytes,
    },
    /// Non-transactional dequeue of the head item (tag `0x01`).
    Remove,
    /// Legacy tentative dequeue carrying no transaction id (tag `0x02`).
    /// Replay synthesizes an id for it.
    RemoveTentative,
    /// Snapshot of the transaction id counter, written during a roll
    /// (tag `0x03`).
    SavedXid(u32),
    /// Rollback of a tentative dequeue; the item returns to the head
    /// (tag `0x04`).
    Unremove(u32),
    /// Commit of a tentative dequeue; the item is gone for good (tag `0x05`).
    ConfirmRemove(u32),
    /// Enqueue with expiry (tag `0x06`).
    AddX {
        /// Effective expiry in epoch milliseconds, `0` for never.
        expiry_ms: u64,
        /// Payload bytes.
        data: Bytes,
    },
    /// Tentative dequeue with its transaction id (tag `0x07`).
    RemoveTentativeX(u32),
}

/// Outcome of decoding one record at the current read position.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete record.
    Record(Record),
    /// Clean end of data: the position was exactly the end of the last
    /// complete record.
    Eof,
    /// A partial record at the tail, as left by a crash mid-append.
    Truncated {
        /// Byte offset where the partial record starts.
        position: u64,
    },
}

impl Record {
    /// Serializes the record into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Record::Add { data } => {
                buf.push(TAG_ADD);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
            Record::Remove => buf.push(TAG_REMOVE),
            Record::RemoveTentative => buf.push(TAG_REMOVE_TENTATIVE),
            Record::SavedXid(xid) => {
                buf.push(TAG_SAVED_XID);
                buf.extend_from_slice(&xid.to_le_bytes());
            }
            Record::Unremove(xid) => {
                buf.push(TAG_UNREMOVE);
                buf.extend_from_slice(&xid.to_le_bytes());
            }
            Record::ConfirmRemove(xid) => {
                buf.push(TAG_CONFIRM_REMOVE);
                buf.extend_from_slice(&xid.to_le_bytes());
            }
            Record::AddX { expiry_ms, data } => {
                buf.push(TAG_ADD_X);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&expiry_ms.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Record::RemoveTentativeX(xid) => {
                buf.push(TAG_REMOVE_TENTATIVE_X);
                buf.extend_from_slice(&xid.to_le_bytes());
            }
        }
    }

    /// Number of bytes this record occupies on disk.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        match self {
            Record::Add { data } => 1 + 4 + data.len() as u64,
            Record::Remove | Record::RemoveTentative => 1,
            Record::SavedXid(_)
            | Record::Unremove(_)
            | Record::ConfirmRemove(_)
            | Record::RemoveTentativeX(_) => 1 + 4,
            Record::AddX { data, .. } => 1 + 4 + 8 + data.len() as u64,
        }
    }
}

/// Decodes one record from `reader`.
///
/// `position` is the byte offset of the record start within the journal file;
/// it is used only for error and truncation reporting.
///
/// # Errors
///
/// Returns an error on underlying IO failures, on an unknown tag byte, or on
/// an implausible length prefix. A clean or mid-record end of data is not an
/// error; it is reported through [`ReadOutcome`].
pub fn read_record<R: Read>(reader: &mut R, position: u64) -> Result<ReadOutcome, JournalError> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Eof),
        Err(err) => return Err(err.into()),
    }

    let truncated = Ok(ReadOutcome::Truncated { position });
    let record = match tag[0] {
        TAG_ADD => {
            let Some(len) = read_u32(reader)? else {
                return truncated;
            };
            let Some(data) = read_data(reader, len, position)? else {
                return truncated;
            };
            Record::Add { data }
        }
        TAG_REMOVE => Record::Remove,
        TAG_REMOVE_TENTATIVE => Record::RemoveTentative,
        TAG_SAVED_XID => {
            let Some(xid) = read_u32(reader)? else {
                return truncated;
            };
            Record::SavedXid(xid)
        }
        TAG_UNREMOVE => {
            let Some(xid) = read_u32(reader)? else {
                return truncated;
            };
            Record::Unremove(xid)
        }
        TAG_CONFIRM_REMOVE => {
            let Some(xid) = read_u32(reader)? else {
                return truncated;
            };
            Record::ConfirmRemove(xid)
        }
        TAG_ADD_X => {
            let Some(len) = read_u32(reader)? else {
                return truncated;
            };
            let Some(expiry_ms) = read_u64(reader)? else {
                return truncated;
            };
            let Some(data) = read_data(reader, len, position)? else {
                return truncated;
            };
            Record::AddX { expiry_ms, data }
        }
        TAG_REMOVE_TENTATIVE_X => {
            let Some(xid) = read_u32(reader)? else {
                return truncated;
            };
            Record::RemoveTentativeX(xid)
        }
        tag => return Err(JournalError::UnknownTag { tag, position }),
    };

    Ok(ReadOutcome::Record(record))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<Option<u32>, JournalError> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_u64<R: Read>(reader: &mut R) -> Result<Option<u64>, JournalError> {
    let mut buf = [0u8; 8];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u64::from_le_bytes(buf))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_data<R: Read>(
    reader: &mut R,
    len: u32,
    position: u64,
) -> Result<Option<Bytes>, JournalError> {
    if len > LARGEST_DATA {
        return Err(JournalError::Corrupt {
            position,
            reason: "length prefix exceeds the largest representable item",
        });
    }
    let mut data = vec![0u8; len as usize];
    match reader.read_exact(&mut data) {
        Ok(()) => Ok(Some(Bytes::from(data))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}
