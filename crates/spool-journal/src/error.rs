//! Error types for journal operations.

/// Errors that can occur while operating a queue journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// IO error during journal operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown record tag encountered while decoding.
    #[error("unknown record tag {tag:#04x} at position {position}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
        /// Byte offset of the record start.
        position: u64,
    },

    /// A record that decoded but cannot be trusted (e.g. absurd length prefix).
    #[error("corrupt record at position {position}: {reason}")]
    Corrupt {
        /// Byte offset of the record start.
        position: u64,
        /// What made the record implausible.
        reason: &'static str,
    },

    /// The journal has been closed or erased and cannot accept writes.
    #[error("journal is closed")]
    Closed,
}
