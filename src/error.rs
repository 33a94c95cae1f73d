//! Error taxonomy for inspection commands
//!
//! Structural errors abort the whole command. `MissingThreadForSlot` is the
//! one per-element condition: traversals record it as a diagnostic and keep
//! walking, so it never comes back as the `Err` of a walk.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while inspecting a paused target
#[derive(Debug, Error)]
pub enum InspectError {
    /// Section table unreadable or missing required fields
    #[error("Malformed object file {}: {reason}", path.display())]
    MalformedObject { path: PathBuf, reason: String },

    /// A ring queue reported `dequeue_pos > enqueue_pos`
    #[error("Queue invariant violated for {queue}: dequeue_pos {dequeue_pos} > enqueue_pos {enqueue_pos}")]
    QueueInvariantViolation {
        queue: String,
        enqueue_pos: u64,
        dequeue_pos: u64,
    },

    /// A symbol is not known to the target
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// A syscall queue slot has no owning lthread
    #[error("No lthread found for slot {slot} of {queue} (position {position})")]
    MissingThreadForSlot {
        queue: String,
        position: u64,
        slot: u64,
    },

    /// The target is not attached or not stopped
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Failed to read {len} bytes at 0x{addr:x}")]
    MemoryRead { addr: u64, len: usize },

    #[error("Failed to write {len} bytes at 0x{addr:x}")]
    MemoryWrite { addr: u64, len: usize },

    #[error("Register access failed for {register}: {reason}")]
    Register { register: String, reason: String },

    /// A traversal exceeded its node budget (cyclic or corrupted structure)
    #[error("Traversal of {what} exceeded {limit} elements")]
    TraversalLimit { what: String, limit: usize },

    #[error("Stack unwind failed: {0}")]
    Unwind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InspectError {
    /// Build a `MalformedObject` error for `path`
    pub fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::MalformedObject {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error aborts a command (everything except per-slot misses)
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::MissingThreadForSlot { .. })
    }
}

pub type Result<T> = std::result::Result<T, InspectError>;
