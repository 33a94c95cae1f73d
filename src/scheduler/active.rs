//! The list of all live lthreads (`__active_lthreads`)

use crate::config::{ActiveListLayout, Limits};
use crate::error::Result;
use crate::host::{field_addr, InspectionHost};
use crate::scheduler::list::ListCursor;
use crate::scheduler::lthread::LthreadHandle;

/// Walk the `struct lthread_queue` chain whose head pointer is at `pointer_addr`
pub fn walk_active_lthreads<H: InspectionHost + ?Sized>(
    host: &H,
    layout: &ActiveListLayout,
    limits: &Limits,
    pointer_addr: u64,
) -> Result<Vec<LthreadHandle>> {
    let first = host.read_u64(pointer_addr)?;
    ListCursor::new(host, first, layout.next, limits.max_list_nodes, "__active_lthreads")
        .map(|node| {
            node.and_then(|node| field_addr(node, layout.lt))
                .and_then(|at| host.read_u64(at))
                .map(LthreadHandle)
        })
        .collect()
}
