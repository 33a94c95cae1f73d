//! The syscall slot table
//!
//! `slotlthreads[i]` names the lthread that owns syscall slot `i`, and
//! `S[i].syscallno` is the system call it issued. Both arrays hold
//! `maxsyscalls` entries.

use crate::config::SyscallLayout;
use crate::error::Result;
use crate::host::{element_addr, InspectionHost};
use crate::scheduler::lthread::LthreadHandle;
use serde::Serialize;

/// An occupied syscall slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotEntry {
    pub slot: u64,
    pub lthread: LthreadHandle,
    pub syscallno: i64,
}

/// Addresses of the arrays backing the slot table
#[derive(Debug, Clone, Copy)]
pub struct SlotTable {
    /// First element of `slotlthreads`
    pub lthreads: u64,
    /// First element of `S`
    pub syscalls: u64,
    pub capacity: u64,
}

impl SlotTable {
    /// Owner of `slot`, `None` when the slot is free
    pub fn owner<H: InspectionHost + ?Sized>(&self, host: &H, slot: u64) -> Result<Option<LthreadHandle>> {
        let lthread = LthreadHandle(host.read_u64(element_addr(self.lthreads, slot, 8, 0)?)?);
        Ok((!lthread.is_null()).then_some(lthread))
    }

    /// Every occupied slot in index order
    pub fn occupied<H: InspectionHost + ?Sized>(
        &self,
        host: &H,
        layout: &SyscallLayout,
    ) -> Result<Vec<SlotEntry>> {
        let mut entries = Vec::new();
        for slot in 0..self.capacity {
            let Some(lthread) = self.owner(host, slot)? else {
                continue;
            };
            let syscallno =
                host.read_u64(element_addr(self.syscalls, slot, layout.entry_size, layout.syscallno)?)?;
            entries.push(SlotEntry {
                slot,
                lthread,
                syscallno: syscallno as i64,
            });
        }
        Ok(entries)
    }
}
