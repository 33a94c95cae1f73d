//! Inspection host interface
//!
//! Everything the inspector knows about the target comes through
//! [`InspectionHost`]: memory and register access, symbol resolution,
//! symbol-file registration and the pause/continue loop. Two hosts ship with
//! the crate: [`ptrace::PtraceHost`] drives a live process, and
//! [`memory::MemoryHost`] serves a synthetic address space.

pub mod memory;
pub mod ptrace;

use crate::backtrace::Backtrace;
use crate::dwarf::SourceLocation;
use crate::error::{InspectError, Result};
use crate::stack_unwind;
use crate::symbols::loader::SymbolFileRegistration;
use std::fmt;

/// Registers the inspector reads or substitutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    FramePointer,
    StackPointer,
    InstructionPointer,
    /// Integer argument register `n` of the SysV x86_64 calling convention
    Argument(u8),
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::FramePointer => write!(f, "rbp"),
            Register::StackPointer => write!(f, "rsp"),
            Register::InstructionPointer => write!(f, "rip"),
            Register::Argument(0) => write!(f, "rdi"),
            Register::Argument(1) => write!(f, "rsi"),
            Register::Argument(2) => write!(f, "rdx"),
            Register::Argument(3) => write!(f, "rcx"),
            Register::Argument(4) => write!(f, "r8"),
            Register::Argument(5) => write!(f, "r9"),
            Register::Argument(n) => write!(f, "arg{}", n),
        }
    }
}

/// Why a resumed target stopped again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on the internal breakpoint planted at this symbol
    Breakpoint(String),
    /// The target exited with this status
    Exited(i32),
}

/// Address of the field at `offset` inside the object at `base`
///
/// Bases come from operator input or raw target memory, so an overflowing
/// sum is reported as an unreadable address instead of wrapping.
pub fn field_addr(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset)
        .ok_or(InspectError::MemoryRead { addr: base, len: 0 })
}

/// Address of `offset` inside element `index` of an array at `base`
pub fn element_addr(base: u64, index: u64, stride: u64, offset: u64) -> Result<u64> {
    index
        .checked_mul(stride)
        .and_then(|at| at.checked_add(offset))
        .and_then(|at| base.checked_add(at))
        .ok_or(InspectError::MemoryRead { addr: base, len: 0 })
}

/// Synchronous pause-and-read access to exactly one target
pub trait InspectionHost {
    /// Fail fast unless the target is attached and stopped
    fn ensure_paused(&self) -> Result<()>;

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;

    fn read_register(&self, register: Register) -> Result<u64>;

    fn write_register(&mut self, register: Register, value: u64) -> Result<()>;

    /// Resolve a global symbol to its runtime address
    fn lookup_symbol(&self, name: &str) -> Result<u64>;

    /// Make a relocated object's symbols available for lookup
    fn add_symbol_file(&mut self, registration: &SymbolFileRegistration) -> Result<()>;

    /// Plant an internal breakpoint at the entry of `symbol`
    fn insert_breakpoint(&mut self, symbol: &str) -> Result<()>;

    /// Let the target run until the next internal breakpoint or exit
    fn resume(&mut self) -> Result<StopReason>;

    /// Function name and source location for an instruction pointer
    fn symbolize(&self, ip: u64) -> (Option<String>, Option<SourceLocation>);

    /// Unwind the stack described by the current register set
    fn unwind(&self, depth: Option<usize>) -> Result<Backtrace> {
        let frames = stack_unwind::unwind_stack(self, depth)?;
        Ok(Backtrace::from_stack_frames(self, frames))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| InspectError::MemoryRead { addr, len: 8 })?;
        Ok(u64::from_le_bytes(raw))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.read_memory(addr, 4)?;
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| InspectError::MemoryRead { addr, len: 4 })?;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_i32(&self, addr: u64) -> Result<i32> {
        self.read_u32(addr).map(|v| v as i32)
    }

    fn write_i32(&mut self, addr: u64, value: i32) -> Result<()> {
        self.write_memory(addr, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    ///
    /// Reads in small chunks so a string near the end of a mapping does not
    /// fail just because `max_len` crosses into unmapped memory.
    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<String> {
        const CHUNK: usize = 64;
        let mut buf = Vec::new();
        while buf.len() < max_len {
            let want = CHUNK.min(max_len - buf.len());
            let chunk = match field_addr(addr, buf.len() as u64)
                .and_then(|at| self.read_memory(at, want))
            {
                Ok(chunk) => chunk,
                Err(e) if buf.is_empty() => return Err(e),
                Err(_) => break,
            };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                buf.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryHost;
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(Register::FramePointer.to_string(), "rbp");
        assert_eq!(Register::StackPointer.to_string(), "rsp");
        assert_eq!(Register::InstructionPointer.to_string(), "rip");
        assert_eq!(Register::Argument(1).to_string(), "rsi");
        assert_eq!(Register::Argument(9).to_string(), "arg9");
    }

    #[test]
    fn test_read_scalars_little_endian() {
        let mut host = MemoryHost::new();
        host.map(0x1000, vec![0; 16]);
        host.write_memory(0x1000, &0x1122_3344_5566_7788u64.to_le_bytes())
            .unwrap();
        host.write_i32(0x1008, -7).unwrap();
        assert_eq!(host.read_u64(0x1000).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(host.read_u32(0x1000).unwrap(), 0x5566_7788);
        assert_eq!(host.read_i32(0x1008).unwrap(), -7);
    }

    #[test]
    fn test_read_c_string_stops_at_nul() {
        let mut host = MemoryHost::new();
        host.map(0x2000, b"lthread_main\0garbage".to_vec());
        assert_eq!(host.read_c_string(0x2000, 64).unwrap(), "lthread_main");
    }

    #[test]
    fn test_read_c_string_truncates_at_max_len() {
        let mut host = MemoryHost::new();
        host.map(0x2000, b"abcdefgh".to_vec());
        assert_eq!(host.read_c_string(0x2000, 4).unwrap(), "abcd");
    }

    #[test]
    fn test_read_c_string_at_mapping_end() {
        let mut host = MemoryHost::new();
        host.map(0x3000, vec![b'x'; 70]);
        assert_eq!(host.read_c_string(0x3000, 256).unwrap(), "x".repeat(64));
    }

    #[test]
    fn test_field_addr_overflow_is_read_error() {
        assert_eq!(field_addr(0x1000, 0x10).unwrap(), 0x1010);
        let err = field_addr(u64::MAX - 4, 0x10).unwrap_err();
        assert!(matches!(err, InspectError::MemoryRead { addr, .. } if addr == u64::MAX - 4));
    }

    #[test]
    fn test_element_addr() {
        assert_eq!(element_addr(0x2000, 3, 0x10, 8).unwrap(), 0x2038);
        assert!(element_addr(0x2000, u64::MAX / 2, 0x10, 0).is_err());
        assert!(element_addr(u64::MAX - 8, 1, 0x10, 0).is_err());
    }

    #[test]
    fn test_read_c_string_at_address_space_end() {
        let mut host = MemoryHost::new();
        host.map(u64::MAX - 64, vec![b'y'; 64]);
        assert_eq!(host.read_c_string(u64::MAX - 64, 256).unwrap(), "y".repeat(64));
    }

    #[test]
    fn test_read_c_string_unmapped() {
        let host = MemoryHost::new();
        assert!(host.read_c_string(0x4000, 16).is_err());
    }
}
