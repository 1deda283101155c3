//! # Spool Journal
//!
//! Durability layer for spool queues: an append-only, little-endian record
//! log per queue with crash-tolerant replay, atomic rotation, and a
//! read-behind cursor for queues whose working set exceeds their memory
//! budget.
//!
//! ## Key components
//!
//! - [`Journal`]: the per-queue log - append, roll, erase, read-behind
//! - [`Record`]: the on-disk record kinds and their codec
//! - [`Replay`]: the recovery stream driven by the queue on startup
//! - [`Item`]: the queued-message value type materialized from the log

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)] // record lengths are bounded well below u32::MAX

/// Error types for journal operations.
pub mod error;

/// Queued item value type.
pub mod item;

/// The append-only journal file.
pub mod journal;

/// On-disk record kinds and codec.
pub mod record;

/// Recovery stream over a journal file.
pub mod replay;

pub use error::JournalError;
pub use item::{now_ms, Item};
pub use journal::Journal;
pub use record::{Record, ReadOutcome};
pub use replay::Replay;
