//! One inspection session against one target
//!
//! The session owns the host exclusively, so commands run one at a time and
//! the register substitution used for backtraces can never be re-entered.
//! It also owns the symbol cache and every scratch file extracted from the
//! target; scratch files are deleted when the session is dropped.

use crate::backtrace::{lthread_backtrace, Backtrace};
use crate::config::InspectorConfig;
use crate::error::Result;
use crate::host::InspectionHost;
use crate::kernel::{self, TaskInfo};
use crate::scheduler::active::walk_active_lthreads;
use crate::scheduler::futex::{walk_futex_queue, FutexWaiter};
use crate::scheduler::queue::{walk_queue, QueueKind, QueueWalk, RingQueue};
use crate::scheduler::slots::{SlotEntry, SlotTable};
use crate::scheduler::{LthreadHandle, LthreadInfo};
use crate::symbols::{load_symbol_file, SymbolCache, SymbolFileRegistration};
use serde::Serialize;
use std::path::Path;
use tempfile::TempPath;
use tracing::debug;

/// Waiting-thread counts across the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub run_queue: u64,
    pub syscall_request_queue: u64,
    pub syscall_return_queue: u64,
    pub futex_waiters: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.run_queue + self.syscall_request_queue + self.syscall_return_queue + self.futex_waiters
    }
}

pub struct Session<H: InspectionHost> {
    pub host: H,
    pub config: InspectorConfig,
    pub symbols: SymbolCache,
    scratch: Vec<TempPath>,
}

impl<H: InspectionHost> Session<H> {
    pub fn new(host: H, config: InspectorConfig) -> Self {
        Self {
            host,
            config,
            symbols: SymbolCache::new(),
            scratch: Vec::new(),
        }
    }

    /// Runtime address of a global, cached until the next symbol load
    pub fn resolve(&mut self, name: &str) -> Result<u64> {
        self.symbols.resolve(&self.host, name)
    }

    /// Like [`resolve`](Self::resolve) but `None` for unknown symbols
    pub fn probe(&mut self, name: &str) -> Result<Option<u64>> {
        self.symbols.probe(&self.host, name)
    }

    /// Register an object's symbols at `base` and invalidate cached lookups
    pub fn load_symbols(&mut self, path: &Path, base: u64) -> Result<SymbolFileRegistration> {
        self.host.ensure_paused()?;
        let registration = load_symbol_file(&mut self.host, path, base)?;
        self.symbols.invalidate();
        Ok(registration)
    }

    /// Keep a scratch file alive until the session ends
    pub fn keep_scratch(&mut self, path: TempPath) {
        debug!(path = %path.display(), "holding scratch file until session end");
        self.scratch.push(path);
    }

    pub fn scratch_files(&self) -> impl Iterator<Item = &Path> {
        self.scratch.iter().map(|p| &**p)
    }

    /// Header of one scheduler queue
    pub fn queue(&mut self, kind: QueueKind) -> Result<RingQueue> {
        self.host.ensure_paused()?;
        let name = kind.symbol(&self.config.symbols).to_string();
        let pointer = self.resolve(&name)?;
        RingQueue::read(&self.host, &self.config.queue, &name, pointer)
    }

    /// Threads waiting in a queue, oldest first
    pub fn queue_threads(&mut self, kind: QueueKind) -> Result<QueueWalk> {
        self.host.ensure_paused()?;
        let pointer = self.resolve(kind.symbol(&self.config.symbols).to_string().as_str())?;
        let slot_table = if kind.uses_slot_table() {
            let table_ptr = self.resolve(&self.config.symbols.slot_table.clone())?;
            Some(self.host.read_u64(table_ptr)?)
        } else {
            None
        };
        walk_queue(&self.host, &self.config, kind, pointer, slot_table)
    }

    pub fn queue_stats(&mut self) -> Result<QueueStats> {
        self.host.ensure_paused()?;
        Ok(QueueStats {
            run_queue: self.queue(QueueKind::Run)?.len()?,
            syscall_request_queue: self.queue(QueueKind::SyscallRequest)?.len()?,
            syscall_return_queue: self.queue(QueueKind::SyscallReturn)?.len()?,
            futex_waiters: self.futex_waiters()?.len() as u64,
        })
    }

    /// Entries of the futex wait list in list order
    pub fn futex_waiters(&mut self) -> Result<Vec<FutexWaiter>> {
        self.host.ensure_paused()?;
        let head = self.resolve(&self.config.symbols.futex_queues.clone())?;
        walk_futex_queue(&self.host, &self.config.futex, &self.config.limits, head)
    }

    /// Every live lthread
    pub fn active_lthreads(&mut self) -> Result<Vec<LthreadHandle>> {
        self.host.ensure_paused()?;
        let pointer = self.resolve(&self.config.symbols.active_lthreads.clone())?;
        walk_active_lthreads(&self.host, &self.config.active, &self.config.limits, pointer)
    }

    /// The syscall slot table
    pub fn slot_table(&mut self) -> Result<SlotTable> {
        self.host.ensure_paused()?;
        let names = self.config.symbols.clone();
        let lthreads_ptr = self.resolve(&names.slot_table)?;
        let syscalls_ptr = self.resolve(&names.syscall_table)?;
        let max_syscalls = self.resolve(&names.max_syscalls)?;
        let lthreads = self.host.read_u64(lthreads_ptr)?;
        let syscalls = self.host.read_u64(syscalls_ptr)?;
        let capacity = self.host.read_i32(max_syscalls)?.max(0) as u64;
        Ok(SlotTable {
            lthreads,
            syscalls,
            capacity,
        })
    }

    pub fn occupied_slots(&mut self) -> Result<Vec<SlotEntry>> {
        let table = self.slot_table()?;
        table.occupied(&self.host, &self.config.syscall)
    }

    pub fn lthread_info(&self, lthread: LthreadHandle) -> Result<LthreadInfo> {
        self.host.ensure_paused()?;
        LthreadInfo::read(&self.host, &self.config.lthread, lthread)
    }

    /// Backtrace of a parked lthread
    pub fn backtrace(&mut self, lthread: LthreadHandle, depth: Option<usize>) -> Result<Backtrace> {
        lthread_backtrace(&mut self.host, &self.config.lthread, lthread, depth)
    }

    pub fn tasks(&mut self) -> Result<Vec<TaskInfo>> {
        self.host.ensure_paused()?;
        let init = self.resolve(&self.config.symbols.init_task.clone())?;
        kernel::list_tasks(&self.host, &self.config.task, &self.config.limits, init)
    }

    pub fn find_task_by_pid(&mut self, pid: i32) -> Result<Option<TaskInfo>> {
        self.host.ensure_paused()?;
        let init = self.resolve(&self.config.symbols.init_task.clone())?;
        kernel::find_task_by_pid(&self.host, &self.config.task, &self.config.limits, init, pid)?
            .map(|task| TaskInfo::read(&self.host, &self.config.task, task))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InspectError;
    use crate::host::memory::MemoryHost;

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            run_queue: 2,
            syscall_request_queue: 3,
            syscall_return_queue: 1,
            futex_waiters: 4,
        };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn test_commands_fail_fast_when_running() {
        let mut host = MemoryHost::new();
        host.set_running(true);
        let mut session = Session::new(host, InspectorConfig::default());
        assert!(matches!(
            session.queue_stats(),
            Err(InspectError::TargetUnavailable(_))
        ));
        assert!(matches!(
            session.futex_waiters(),
            Err(InspectError::TargetUnavailable(_))
        ));
        assert!(session.symbols.is_empty());
    }

    #[test]
    fn test_backtrace_of_handle_at_address_space_end() {
        let mut session = Session::new(MemoryHost::new(), InspectorConfig::default());
        let err = session
            .backtrace(LthreadHandle(u64::MAX - 4), None)
            .unwrap_err();
        assert!(matches!(err, InspectError::MemoryRead { .. }));
        assert_eq!(session.host.register_writes(), 0);
    }

    #[test]
    fn test_missing_queue_symbol() {
        let mut session = Session::new(MemoryHost::new(), InspectorConfig::default());
        let err = session.queue(QueueKind::Run).unwrap_err();
        assert!(matches!(err, InspectError::UnresolvedSymbol(ref s) if s == "__scheduler_queue"));
    }

    #[test]
    fn test_failed_load_leaves_cache_intact() {
        let mut host = MemoryHost::new();
        host.define_symbol("futex_queues", 0x100);
        let mut session = Session::new(host, InspectorConfig::default());
        session.resolve("futex_queues").unwrap();
        assert!(session
            .load_symbols(Path::new("/nonexistent/lib.so"), 0x1000)
            .is_err());
        assert_eq!(session.symbols.len(), 1);
        assert!(session.host.registrations().is_empty());
    }

    #[test]
    fn test_scratch_files_deleted_on_drop() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let mut session = Session::new(MemoryHost::new(), InspectorConfig::default());
        session.keep_scratch(file.into_temp_path());
        assert!(path.exists());
        assert_eq!(session.scratch_files().count(), 1);
        drop(session);
        assert!(!path.exists());
    }
}
