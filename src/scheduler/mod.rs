//! Walkers over the lthread scheduler's in-memory structures
//!
//! Every walker takes the runtime address of the structure (resolved by the
//! caller through the symbol cache) and reads the target as a snapshot.
//! Nothing here writes to the target.

pub mod active;
pub mod futex;
pub mod list;
pub mod lthread;
pub mod queue;
pub mod slots;

pub use futex::FutexWaiter;
pub use lthread::{LthreadHandle, LthreadInfo, SavedContext};
pub use queue::{QueueKind, QueueWalk, RingQueue};
