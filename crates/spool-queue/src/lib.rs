//! # Spool Queue
//!
//! A persistent, transactional FIFO queue backed by an append-only journal.
//!
//! Each queue keeps a bounded in-memory working set; once the logical queue
//! outgrows its memory budget, the tail lives only in the journal and is
//! streamed back in on demand (read-behind). Dequeues can be transactional:
//! a tentatively-removed item is parked until the consumer confirms or rolls
//! back, and unconfirmed transactions survive a crash by replay.
//!
//! ## Key components
//!
//! - [`PersistentQueue`]: the queue - admission, blocking gets, recovery
//! - [`QueueSettings`] / [`QueueDefaults`]: per-queue overlays on live
//!   process-wide defaults
//! - [`QueueRegistry`]: lookup used to republish expired items elsewhere
//! - [`Item`]: the queued message, re-exported from the journal layer

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)] // payload lengths are bounded well below u32::MAX

/// The persistent queue proper.
pub mod queue;

/// Lookup of sibling queues for expired-item hand-off.
pub mod registry;

/// Per-queue settings resolved over process-wide defaults.
pub mod settings;

/// FIFO list of blocked consumers.
pub mod waiters;

pub use queue::PersistentQueue;
pub use registry::QueueRegistry;
pub use settings::{OverlaySetting, QueueDefaults, QueueOptions, QueueSettings};
pub use spool_journal::{now_ms, Item, JournalError};
