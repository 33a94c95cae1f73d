//! The futex wait list
//!
//! `futex_queues` is an SLIST head; each `struct futex_q` is embedded in the
//! lthread that waits on it. Insertion is at the head, so list order is the
//! reverse of registration order.

use crate::config::{FutexLayout, Limits};
use crate::error::Result;
use crate::host::{field_addr, InspectionHost};
use crate::scheduler::list::ListCursor;
use crate::scheduler::lthread::LthreadHandle;
use serde::Serialize;

/// One lthread blocked on a futex
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FutexWaiter {
    /// Address of the `futex_q` node
    pub node: u64,
    pub key: u32,
    pub lthread: LthreadHandle,
    /// Absolute wake-up deadline in microseconds, 0 when waiting forever
    pub deadline: u64,
}

impl FutexWaiter {
    pub fn read<H: InspectionHost + ?Sized>(host: &H, layout: &FutexLayout, node: u64) -> Result<Self> {
        Ok(Self {
            node,
            key: host.read_u32(field_addr(node, layout.key)?)?,
            lthread: LthreadHandle(host.read_u64(field_addr(node, layout.lt)?)?),
            deadline: host.read_u64(field_addr(node, layout.deadline)?)?,
        })
    }
}

/// Walk the list whose head structure is at `head_addr`
pub fn walk_futex_queue<H: InspectionHost + ?Sized>(
    host: &H,
    layout: &FutexLayout,
    limits: &Limits,
    head_addr: u64,
) -> Result<Vec<FutexWaiter>> {
    // slh_first is the only member of the head
    let first = host.read_u64(head_addr)?;
    ListCursor::new(host, first, layout.next, limits.max_list_nodes, "futex_queues")
        .map(|node| node.and_then(|node| FutexWaiter::read(host, layout, node)))
        .collect()
}
