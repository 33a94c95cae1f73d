//! Backtraces of lthreads that are not running on any core
//!
//! A parked lthread's call stack is only described by the context it saved
//! when it yielded. To unwind it, the target's rbp/rsp/rip are temporarily
//! replaced with that context, the host unwinds as usual, and the original
//! registers are put back. [`RegisterSubstitution`] owns that sequence: the
//! registers are restored when the guard drops, whatever path leaves the
//! scope.
//!
//! The substitution is not reentrant and needs a stopped target for its
//! whole lifetime. Holding `&mut H` for the guard's lifetime gives both.

use crate::config::LthreadLayout;
use crate::dwarf::SourceLocation;
use crate::error::Result;
use crate::host::{InspectionHost, Register};
use crate::scheduler::lthread::{LthreadHandle, SavedContext};
use crate::stack_unwind::StackFrame;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tracing::{debug, error};

/// One frame of a reconstructed backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub index: usize,
    pub ip: u64,
    pub function: Option<String>,
    #[serde(serialize_with = "serialize_location")]
    pub location: Option<SourceLocation>,
}

fn serialize_location<S: serde::Serializer>(
    location: &Option<SourceLocation>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match location {
        Some(loc) => serializer.serialize_some(&loc.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Frames innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
}

impl Backtrace {
    /// Symbolize raw frames through the host
    pub fn from_stack_frames<H: InspectionHost + ?Sized>(host: &H, frames: Vec<StackFrame>) -> Self {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                let (function, location) = host.symbolize(frame.rip);
                Frame {
                    index,
                    ip: frame.rip,
                    function,
                    location,
                }
            })
            .collect();
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:<2} 0x{:016x} in {} ()",
            self.index,
            self.ip,
            self.function.as_deref().unwrap_or("??")
        )?;
        if let Some(location) = &self.location {
            write!(f, " at {}", location)?;
        }
        Ok(())
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

/// The three registers a saved lthread context replaces
const SUBSTITUTED: [Register; 3] = [
    Register::FramePointer,
    Register::StackPointer,
    Register::InstructionPointer,
];

/// Scoped replacement of rbp/rsp/rip, restored on drop
pub struct RegisterSubstitution<'a, H: InspectionHost + ?Sized> {
    host: &'a mut H,
    saved: [u64; 3],
}

impl<'a, H: InspectionHost + ?Sized> RegisterSubstitution<'a, H> {
    /// Save the current registers and load `context` in their place
    pub fn install(host: &'a mut H, context: &SavedContext) -> Result<Self> {
        let mut saved = [0u64; 3];
        for (slot, register) in saved.iter_mut().zip(SUBSTITUTED) {
            *slot = host.read_register(register)?;
        }

        // From here on, drop restores everything we may have touched
        let mut guard = Self { host, saved };
        let values = [context.frame_pointer, context.stack_pointer, context.instruction_pointer];
        for (register, value) in SUBSTITUTED.into_iter().zip(values) {
            guard.host.write_register(register, value)?;
        }
        Ok(guard)
    }

    /// Register values that will be put back
    pub fn saved(&self) -> [u64; 3] {
        self.saved
    }
}

impl<H: InspectionHost + ?Sized> Deref for RegisterSubstitution<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.host
    }
}

impl<H: InspectionHost + ?Sized> DerefMut for RegisterSubstitution<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.host
    }
}

impl<H: InspectionHost + ?Sized> Drop for RegisterSubstitution<'_, H> {
    fn drop(&mut self) {
        for (register, value) in SUBSTITUTED.into_iter().zip(self.saved) {
            if let Err(e) = self.host.write_register(register, value) {
                error!(%register, value = %format!("0x{:x}", value), error = %e, "failed to restore register");
            }
        }
    }
}

/// Unwind the stack of a parked lthread
pub fn lthread_backtrace<H: InspectionHost + ?Sized>(
    host: &mut H,
    layout: &LthreadLayout,
    lthread: LthreadHandle,
    depth: Option<usize>,
) -> Result<Backtrace> {
    host.ensure_paused()?;
    let context = SavedContext::read(&*host, layout, lthread)?;
    debug!(
        lthread = %lthread,
        rbp = %format!("0x{:x}", context.frame_pointer),
        rsp = %format!("0x{:x}", context.stack_pointer),
        rip = %format!("0x{:x}", context.instruction_pointer),
        "substituting lthread context"
    );

    let substitution = RegisterSubstitution::install(host, &context)?;
    let backtrace = substitution.unwind(depth);
    drop(substitution);
    backtrace
}
