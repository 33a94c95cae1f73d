//! Kernel task list walker
//!
//! Starting at `init_task`, visits every thread of every thread group: the
//! inner loop follows the `thread_group` ring of the current leader, the
//! outer loop follows the leaders' `tasks` ring until it returns to
//! `init_task`. Both rings are `struct list_head`s embedded in the task, so
//! every `next` pointer is converted back with container_of arithmetic.

use crate::config::{Limits, TaskLayout};
use crate::error::{InspectError, Result};
use crate::host::{field_addr, InspectionHost};
use serde::Serialize;

/// One kernel task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub address: u64,
    pub pid: i32,
    /// `tid` of the task's `thread_info`
    pub thread_id: u64,
    pub comm: String,
}

/// Address of the structure embedding the member at `member_addr`
pub fn container_of(member_addr: u64, member_offset: u64) -> u64 {
    member_addr.wrapping_sub(member_offset)
}

/// Iterator over task addresses in traversal order
pub struct TaskWalker<'a, H: InspectionHost + ?Sized> {
    host: &'a H,
    layout: &'a TaskLayout,
    init_task: u64,
    leader: u64,
    current: Option<u64>,
    visited: usize,
    limit: usize,
}

impl<'a, H: InspectionHost + ?Sized> TaskWalker<'a, H> {
    pub fn new(host: &'a H, layout: &'a TaskLayout, limits: &Limits, init_task: u64) -> Self {
        Self {
            host,
            layout,
            init_task,
            leader: init_task,
            current: Some(init_task),
            visited: 0,
            limit: limits.max_list_nodes,
        }
    }

    fn follow(&self, task: u64, member: u64) -> Result<u64> {
        let next = self.host.read_u64(field_addr(task, member)?)?;
        Ok(container_of(next, member))
    }

    /// Task after `task`, or `None` once the walk is back at `init_task`
    fn advance(&mut self, task: u64) -> Result<Option<u64>> {
        let sibling = self.follow(task, self.layout.thread_group)?;
        if sibling != self.leader {
            return Ok(Some(sibling));
        }
        let next_leader = self.follow(self.leader, self.layout.tasks)?;
        if next_leader == self.init_task {
            return Ok(None);
        }
        self.leader = next_leader;
        Ok(Some(next_leader))
    }
}

impl<H: InspectionHost + ?Sized> Iterator for TaskWalker<'_, H> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let task = self.current.take()?;
        if self.visited == self.limit {
            return Some(Err(InspectError::TraversalLimit {
                what: "task list".to_string(),
                limit: self.limit,
            }));
        }
        self.visited += 1;
        match self.advance(task) {
            Ok(next) => self.current = next,
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(task))
    }
}

impl TaskInfo {
    pub fn read<H: InspectionHost + ?Sized>(host: &H, layout: &TaskLayout, task: u64) -> Result<Self> {
        let thread_info = host.read_u64(field_addr(task, layout.stack)?)?;
        Ok(Self {
            address: task,
            pid: host.read_i32(field_addr(task, layout.pid)?)?,
            thread_id: host.read_u64(field_addr(thread_info, layout.thread_info_tid)?)?,
            comm: host.read_c_string(field_addr(task, layout.comm)?, layout.comm_len)?,
        })
    }
}

/// Every task reachable from `init_task`
pub fn list_tasks<H: InspectionHost + ?Sized>(
    host: &H,
    layout: &TaskLayout,
    limits: &Limits,
    init_task: u64,
) -> Result<Vec<TaskInfo>> {
    TaskWalker::new(host, layout, limits, init_task)
        .map(|task| task.and_then(|task| TaskInfo::read(host, layout, task)))
        .collect()
}

/// First task with `pid` in traversal order
pub fn find_task_by_pid<H: InspectionHost + ?Sized>(
    host: &H,
    layout: &TaskLayout,
    limits: &Limits,
    init_task: u64,
    pid: i32,
) -> Result<Option<u64>> {
    for task in TaskWalker::new(host, layout, limits, init_task) {
        let task = task?;
        if host.read_i32(field_addr(task, layout.pid)?)? == pid {
            return Ok(Some(task));
        }
    }
    Ok(None)
}
