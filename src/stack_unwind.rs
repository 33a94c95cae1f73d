//! Frame-pointer stack unwinding over target memory
//!
//! Walks the saved-rbp chain starting from whatever the host currently
//! reports as rip/rbp. The backtrace reconstructor relies on that: it
//! substitutes a parked lthread's context into those registers first.

use crate::error::Result;
use crate::host::{InspectionHost, Register};

/// Maximum stack depth to unwind (prevent infinite loops)
pub const MAX_STACK_DEPTH: usize = 64;

/// A single stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Instruction pointer (return address for outer frames)
    pub rip: u64,
    /// Frame pointer of this frame
    pub rbp: u64,
}

/// Unwind the stack described by the host's current registers
///
/// Returns frames innermost first. The walk stops when rbp is 0, when the
/// chain points at unreadable memory, when a return address is 0, when the
/// chain stops growing towards higher addresses, or at `depth` frames
/// (never more than [`MAX_STACK_DEPTH`]).
///
/// # Note
///
/// This uses the traditional x86_64 frame pointer convention. It may not
/// work correctly with code compiled with `-fomit-frame-pointer`.
pub fn unwind_stack<H: InspectionHost + ?Sized>(
    host: &H,
    depth: Option<usize>,
) -> Result<Vec<StackFrame>> {
    let limit = depth.unwrap_or(MAX_STACK_DEPTH).min(MAX_STACK_DEPTH);
    let mut frames = Vec::with_capacity(16);
    if limit == 0 {
        return Ok(frames);
    }

    let rip = host.read_register(Register::InstructionPointer)?;
    let mut rbp = host.read_register(Register::FramePointer)?;

    frames.push(StackFrame { rip, rbp });

    while frames.len() < limit {
        if rbp == 0 {
            break; // End of stack
        }

        // Stack layout at RBP:
        //   [rbp+0]: saved RBP (previous frame)
        //   [rbp+8]: return address
        let Ok(saved_rbp) = host.read_u64(rbp) else {
            break;
        };
        let Some(Ok(return_address)) = rbp.checked_add(8).map(|at| host.read_u64(at)) else {
            break;
        };
        if return_address == 0 {
            break;
        }

        frames.push(StackFrame {
            rip: return_address,
            rbp: saved_rbp,
        });

        if saved_rbp != 0 && saved_rbp <= rbp {
            break; // Corrupted chain
        }
        rbp = saved_rbp;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    /// Three frames: 0x3000 -> 0x3100 -> 0x3200 -> end
    fn chained_host() -> MemoryHost {
        let mut host = MemoryHost::new();
        host.map_zeroed(0x3000, 0x300);
        host.write_u64(0x3000, 0x3100).unwrap();
        host.write_u64(0x3008, 0x40_1111).unwrap();
        host.write_u64(0x3100, 0x3200).unwrap();
        host.write_u64(0x3108, 0x40_2222).unwrap();
        host.write_u64(0x3200, 0).unwrap();
        host.write_u64(0x3208, 0x40_3333).unwrap();
        host.set_register(Register::InstructionPointer, 0x40_0000);
        host.set_register(Register::FramePointer, 0x3000);
        host
    }

    #[test]
    fn test_walks_full_chain() {
        let host = chained_host();
        let frames = unwind_stack(&host, None).unwrap();
        let ips: Vec<u64> = frames.iter().map(|f| f.rip).collect();
        assert_eq!(ips, vec![0x40_0000, 0x40_1111, 0x40_2222, 0x40_3333]);
    }

    #[test]
    fn test_depth_limit() {
        let host = chained_host();
        assert_eq!(unwind_stack(&host, Some(2)).unwrap().len(), 2);
        assert!(unwind_stack(&host, Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_zero_frame_pointer_yields_single_frame() {
        let mut host = MemoryHost::new();
        host.set_register(Register::InstructionPointer, 0x1234);
        let frames = unwind_stack(&host, None).unwrap();
        assert_eq!(frames, vec![StackFrame { rip: 0x1234, rbp: 0 }]);
    }

    #[test]
    fn test_unreadable_frame_pointer_stops() {
        let mut host = MemoryHost::new();
        host.set_register(Register::InstructionPointer, 0x1234);
        host.set_register(Register::FramePointer, 0xdead_0000);
        assert_eq!(unwind_stack(&host, None).unwrap().len(), 1);
    }

    #[test]
    fn test_self_referencing_chain_terminates() {
        let mut host = MemoryHost::new();
        host.map_zeroed(0x5000, 0x10);
        host.write_u64(0x5000, 0x5000).unwrap();
        host.write_u64(0x5008, 0x40_0001).unwrap();
        host.set_register(Register::FramePointer, 0x5000);
        host.set_register(Register::InstructionPointer, 0x40_0000);
        assert_eq!(unwind_stack(&host, None).unwrap().len(), 2);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_max_stack_depth_constant() {
        assert_eq!(MAX_STACK_DEPTH, 64);
        assert!(unwind_stack(&chained_host(), Some(1000)).unwrap().len() <= MAX_STACK_DEPTH);
    }
}
