//! ltscope - live introspection of lthread schedulers
//!
//! This library loads debug symbols for objects whose load address is only
//! known at runtime and walks the scheduler's ring queues, futex wait list
//! and thread lists in a stopped target, reconstructing the backtraces of
//! lthreads that are not running on any core.

pub mod backtrace;
pub mod cli;
pub mod commands;
pub mod config;
pub mod csv_output;
pub mod dwarf;
pub mod error;
pub mod export;
pub mod hooks;
pub mod host;
pub mod kernel;
pub mod scheduler;
pub mod session;
pub mod stack_unwind;
pub mod symbols;

pub use error::{InspectError, Result};
pub use session::Session;
