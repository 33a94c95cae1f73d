//! Bounded MPMC ring queues of the lthread scheduler
//!
//! Each queue keeps two monotonically increasing counters. Logical position
//! `i` in `[dequeue_pos, enqueue_pos)` lives in physical cell
//! `i & buffer_mask`. The run queue stores lthread pointers in its cells;
//! the syscall request/return queues store slot numbers that index the
//! `slotlthreads` table.

use crate::config::{InspectorConfig, QueueLayout, SymbolNames};
use crate::error::{InspectError, Result};
use crate::host::{element_addr, field_addr, InspectionHost};
use crate::scheduler::lthread::LthreadHandle;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Which scheduler queue to inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Run,
    SyscallRequest,
    SyscallReturn,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [
        QueueKind::Run,
        QueueKind::SyscallRequest,
        QueueKind::SyscallReturn,
    ];

    /// Global holding the queue pointer
    pub fn symbol<'a>(&self, names: &'a SymbolNames) -> &'a str {
        match self {
            QueueKind::Run => &names.run_queue,
            QueueKind::SyscallRequest => &names.syscall_request_queue,
            QueueKind::SyscallReturn => &names.syscall_return_queue,
        }
    }

    /// Whether cell payloads are slot numbers rather than lthread pointers
    pub fn uses_slot_table(&self) -> bool {
        !matches!(self, QueueKind::Run)
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Run => write!(f, "scheduler queue"),
            QueueKind::SyscallRequest => write!(f, "syscall request queue"),
            QueueKind::SyscallReturn => write!(f, "syscall return queue"),
        }
    }
}

/// A logical queue position and the physical cell holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub position: u64,
    pub slot: u64,
}

/// Snapshot of a queue's header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingQueue {
    pub name: String,
    pub address: u64,
    pub enqueue_pos: u64,
    pub dequeue_pos: u64,
    pub buffer_mask: u64,
    pub buffer: u64,
}

/// Physical slots for positions `[dequeue_pos, enqueue_pos)`, oldest first
pub fn physical_slots(
    name: &str,
    enqueue_pos: u64,
    dequeue_pos: u64,
    buffer_mask: u64,
) -> Result<Vec<QueueSlot>> {
    if dequeue_pos > enqueue_pos {
        return Err(InspectError::QueueInvariantViolation {
            queue: name.to_string(),
            enqueue_pos,
            dequeue_pos,
        });
    }
    Ok((dequeue_pos..enqueue_pos)
        .map(|position| QueueSlot {
            position,
            slot: position & buffer_mask,
        })
        .collect())
}

impl RingQueue {
    /// Read the queue whose pointer is stored at `pointer_addr`
    pub fn read<H: InspectionHost + ?Sized>(
        host: &H,
        layout: &QueueLayout,
        name: &str,
        pointer_addr: u64,
    ) -> Result<Self> {
        let address = host.read_u64(pointer_addr)?;
        Self::read_at(host, layout, name, address)
    }

    /// Read the queue header located at `address`
    pub fn read_at<H: InspectionHost + ?Sized>(
        host: &H,
        layout: &QueueLayout,
        name: &str,
        address: u64,
    ) -> Result<Self> {
        let queue = Self {
            name: name.to_string(),
            address,
            enqueue_pos: host.read_u64(field_addr(address, layout.enqueue_pos)?)?,
            dequeue_pos: host.read_u64(field_addr(address, layout.dequeue_pos)?)?,
            buffer_mask: host.read_u64(field_addr(address, layout.buffer_mask)?)?,
            buffer: host.read_u64(field_addr(address, layout.buffer)?)?,
        };
        debug!(
            queue = name,
            enqueue_pos = queue.enqueue_pos,
            dequeue_pos = queue.dequeue_pos,
            buffer_mask = queue.buffer_mask,
            "read queue header"
        );
        Ok(queue)
    }

    /// Number of waiting elements
    pub fn len(&self) -> Result<u64> {
        self.check_invariant()?;
        Ok(self.enqueue_pos - self.dequeue_pos)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    fn check_invariant(&self) -> Result<()> {
        if self.dequeue_pos > self.enqueue_pos {
            return Err(InspectError::QueueInvariantViolation {
                queue: self.name.clone(),
                enqueue_pos: self.enqueue_pos,
                dequeue_pos: self.dequeue_pos,
            });
        }
        Ok(())
    }

    /// Slots of all waiting positions, oldest first
    pub fn slots(&self) -> Result<Vec<QueueSlot>> {
        physical_slots(&self.name, self.enqueue_pos, self.dequeue_pos, self.buffer_mask)
    }

    /// Raw payload of a physical cell
    pub fn payload<H: InspectionHost + ?Sized>(
        &self,
        host: &H,
        layout: &QueueLayout,
        slot: u64,
    ) -> Result<u64> {
        host.read_u64(element_addr(self.buffer, slot, layout.cell_size, layout.cell_data)?)
    }
}

/// Threads found in a queue plus the positions that could not be resolved
#[derive(Debug, Default)]
pub struct QueueWalk {
    pub queue: Option<RingQueue>,
    pub threads: Vec<LthreadHandle>,
    /// `MissingThreadForSlot` entries, one per skipped position
    pub diagnostics: Vec<InspectError>,
}

/// Resolve every waiting position of a queue to its lthread
///
/// `slot_table` is the address of the first `slotlthreads` entry and is only
/// consulted for syscall queues. A structural error aborts the walk with no
/// partial result; an empty slot is recorded and skipped.
pub fn walk_queue<H: InspectionHost + ?Sized>(
    host: &H,
    config: &InspectorConfig,
    kind: QueueKind,
    pointer_addr: u64,
    slot_table: Option<u64>,
) -> Result<QueueWalk> {
    let name = kind.symbol(&config.symbols);
    let queue = RingQueue::read(host, &config.queue, name, pointer_addr)?;
    let len = queue.len()?;
    if len > config.limits.max_queue_walk {
        return Err(InspectError::TraversalLimit {
            what: name.to_string(),
            limit: config.limits.max_queue_walk as usize,
        });
    }

    let mut walk = QueueWalk::default();
    for QueueSlot { position, slot } in queue.slots()? {
        let payload = queue.payload(host, &config.queue, slot)?;
        if !kind.uses_slot_table() {
            walk.threads.push(LthreadHandle(payload));
            continue;
        }

        let table = slot_table.ok_or_else(|| {
            InspectError::UnresolvedSymbol(config.symbols.slot_table.clone())
        })?;
        // Cells of the syscall queues carry an int slot number
        let index = payload as u32 as u64;
        let lthread = LthreadHandle(host.read_u64(element_addr(table, index, 8, 0)?)?);
        if lthread.is_null() {
            let missing = InspectError::MissingThreadForSlot {
                queue: name.to_string(),
                position,
                slot: index,
            };
            warn!("{}", missing);
            walk.diagnostics.push(missing);
            continue;
        }
        walk.threads.push(lthread);
    }
    walk.queue = Some(queue);
    Ok(walk)
}
