//! Logical thread handles and their on-demand attributes

use crate::config::LthreadLayout;
use crate::error::Result;
use crate::host::{field_addr, InspectionHost};
use serde::Serialize;
use std::fmt;

/// Target address of a `struct lthread`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LthreadHandle(pub u64);

impl LthreadHandle {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LthreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Machine context an lthread saved when it last yielded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    pub frame_pointer: u64,
    pub stack_pointer: u64,
    pub instruction_pointer: u64,
}

impl SavedContext {
    pub fn read<H: InspectionHost + ?Sized>(
        host: &H,
        layout: &LthreadLayout,
        lthread: LthreadHandle,
    ) -> Result<Self> {
        Ok(Self {
            frame_pointer: host.read_u64(field_addr(lthread.0, layout.ctx_ebp)?)?,
            stack_pointer: host.read_u64(field_addr(lthread.0, layout.ctx_esp)?)?,
            instruction_pointer: host.read_u64(field_addr(lthread.0, layout.ctx_eip)?)?,
        })
    }
}

/// Identity of an lthread as read from target memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LthreadInfo {
    pub handle: LthreadHandle,
    pub tid: i32,
    pub cpu: i32,
    pub name: String,
}

impl LthreadInfo {
    pub fn read<H: InspectionHost + ?Sized>(
        host: &H,
        layout: &LthreadLayout,
        lthread: LthreadHandle,
    ) -> Result<Self> {
        Ok(Self {
            handle: lthread,
            tid: host.read_i32(field_addr(lthread.0, layout.tid)?)?,
            cpu: host.read_i32(field_addr(lthread.0, layout.cpu)?)?,
            name: host.read_c_string(field_addr(lthread.0, layout.funcname)?, layout.funcname_len)?,
        })
    }
}
