//! Live process host built on ptrace
//!
//! Attaches to (or spawns) one process and traces every thread of it. The
//! host works all-stop: while the target is paused every traced thread is
//! stopped, and `resume` lets all of them run until one hits one of our
//! breakpoints or the process exits. New threads are picked up through
//! `PTRACE_O_TRACECLONE`.
//!
//! Internal breakpoints are classic `int3` patches. After a breakpoint hit
//! the instruction pointer of the hitting thread is rewound onto the patched
//! byte; the next `resume` restores the original byte, single-steps that
//! thread over it and re-arms it before continuing.

use super::{InspectionHost, Register, StopReason};
use crate::dwarf::SourceLocation;
use crate::error::{InspectError, Result};
use crate::symbols::loader::{load_symbol_file, SymbolFileRegistration};
use crate::symbols::registry::SymbolRegistry;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use object::{Object, ObjectKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::c_void;
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const INT3: u8 = 0xcc;
const WORD: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Stopped,
    Running,
    Exited(i32),
}

#[derive(Debug)]
struct Breakpoint {
    symbol: String,
    original: u8,
}

/// One row of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

/// Parse one line of `/proc/<pid>/maps`
pub fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let _perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(PathBuf::from);
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// Thread ids listed under `/proc/<pid>/task`
pub fn list_threads(pid: i32) -> std::io::Result<BTreeSet<i32>> {
    let mut tids = BTreeSet::new();
    for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
        if let Some(tid) = entry?.file_name().to_str().and_then(|n| n.parse().ok()) {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

fn unavailable(message: String) -> InspectError {
    InspectError::TargetUnavailable(message)
}

/// Send `signal` to one thread of a thread group
fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> nix::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            pid.as_raw(),
            tid.as_raw(),
            signal as libc::c_int,
        )
    };
    Errno::result(ret).map(drop)
}

/// A traced process
#[derive(Debug)]
pub struct PtraceHost {
    pid: Pid,
    /// Thread whose registers are read and written
    current: Pid,
    /// Every traced thread; all of them are stopped while paused
    threads: BTreeSet<Pid>,
    /// Cloned threads whose initial SIGSTOP has not been seen yet
    starting: HashSet<Pid>,
    /// Signals held back while stopping a thread, delivered on the next resume
    pending: HashMap<Pid, Signal>,
    state: TargetState,
    spawned: bool,
    symbols: SymbolRegistry,
    breakpoints: HashMap<u64, Breakpoint>,
}

impl PtraceHost {
    fn new(pid: Pid, spawned: bool) -> Self {
        Self {
            pid,
            current: pid,
            threads: BTreeSet::new(),
            starting: HashSet::new(),
            pending: HashMap::new(),
            state: TargetState::Stopped,
            spawned,
            symbols: SymbolRegistry::new(),
            breakpoints: HashMap::new(),
        }
    }

    /// Attach to every thread of a running process and stop them all
    ///
    /// `/proc/<pid>/task` is re-read until a pass finds no thread we have
    /// not attached to, so threads created during the attach are caught
    /// either here or by `PTRACE_O_TRACECLONE` on their parent.
    pub fn attach(pid: i32) -> Result<Self> {
        let mut host = Self::new(Pid::from_raw(pid), false);
        let mut seen = BTreeSet::new();
        loop {
            let tids = list_threads(pid).map_err(|e| {
                unavailable(format!("failed to attach to PID {}: {}", pid, e))
            })?;
            let fresh: Vec<Pid> = tids
                .into_iter()
                .map(Pid::from_raw)
                .filter(|tid| seen.insert(*tid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for tid in fresh {
                match ptrace::attach(tid) {
                    Ok(()) => host.await_attach_stop(tid)?,
                    // Exited between listing and attaching
                    Err(Errno::ESRCH) if tid != host.pid => continue,
                    Err(e) => {
                        return Err(unavailable(format!(
                            "failed to attach to PID {}: {}",
                            pid, e
                        )))
                    }
                }
            }
        }
        info!(pid, threads = host.threads.len(), "attached");
        host.load_main_symbols();
        Ok(host)
    }

    /// Start `command` under trace, stopped at its first instruction
    pub fn spawn(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(unavailable("empty command".to_string()));
        };

        match unsafe { fork() }.map_err(|e| unavailable(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child } => {
                waitpid(child, None)
                    .map_err(|e| unavailable(format!("failed to wait for child: {}", e)))?;
                let options =
                    ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACECLONE;
                ptrace::setoptions(child, options)
                    .map_err(|e| unavailable(format!("failed to set ptrace options: {}", e)))?;
                info!(pid = child.as_raw(), program = %program, "spawned");
                let mut host = Self::new(child, true);
                host.threads.insert(child);
                host.load_main_symbols();
                Ok(host)
            }
            ForkResult::Child => {
                if let Err(e) = ptrace::traceme() {
                    eprintln!("Failed to PTRACE_TRACEME: {}", e);
                    std::process::exit(1);
                }
                let err = Command::new(program).args(args).exec();
                eprintln!("Failed to exec {}: {}", program, err);
                std::process::exit(1);
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Number of threads currently traced
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Thread that reported the last stop
    pub fn current_thread(&self) -> i32 {
        self.current.as_raw()
    }

    fn load_main_symbols(&mut self) {
        if let Err(e) = self.register_main_executable() {
            warn!(error = %e, "no symbols for the main executable");
        }
    }

    /// Load the executable's own symbols at its mapped base
    fn register_main_executable(&mut self) -> Result<()> {
        let exe = std::fs::read_link(format!("/proc/{}/exe", self.pid))?;
        let maps = std::fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        let start = maps
            .lines()
            .filter_map(parse_maps_line)
            .find(|m| m.offset == 0 && m.path.as_deref() == Some(exe.as_path()))
            .map(|m| m.start)
            .ok_or_else(|| InspectError::malformed(&exe, "executable is not mapped"))?;

        let base = if is_position_independent(&exe)? { start } else { 0 };
        load_symbol_file(self, &exe, base)?;
        Ok(())
    }

    /// Wait for the SIGSTOP that follows `PTRACE_ATTACH`
    ///
    /// Any other signal that arrives first is held back and delivered on the
    /// next resume.
    fn await_attach_stop(&mut self, tid: Pid) -> Result<()> {
        loop {
            match self.wait_for(tid)? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                WaitStatus::Stopped(_, signal) => {
                    self.pending.insert(tid, signal);
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Ok(()),
                _ => self.cont_thread(tid, None)?,
            }
        }
        ptrace::setoptions(tid, ptrace::Options::PTRACE_O_TRACECLONE)
            .map_err(|e| unavailable(format!("failed to set ptrace options: {}", e)))?;
        self.threads.insert(tid);
        Ok(())
    }

    fn peek(&self, addr: u64) -> Result<u64> {
        ptrace::read(self.current, addr as *mut c_void)
            .map(|word| word as u64)
            .map_err(|_| InspectError::MemoryRead { addr, len: WORD as usize })
    }

    fn poke(&self, addr: u64, word: u64) -> Result<()> {
        ptrace::write(self.current, addr as *mut c_void, word as libc::c_long)
            .map_err(|_| InspectError::MemoryWrite { addr, len: WORD as usize })
    }

    fn patch_byte(&self, addr: u64, byte: u8) -> Result<u8> {
        let word = self.peek(addr)?;
        let original = (word & 0xff) as u8;
        self.poke(addr, (word & !0xff) | byte as u64)?;
        Ok(original)
    }

    fn regs_of(&self, tid: Pid) -> Result<libc::user_regs_struct> {
        ptrace::getregs(tid).map_err(|e| InspectError::Register {
            register: "all".to_string(),
            reason: e.to_string(),
        })
    }

    fn set_regs_of(&self, tid: Pid, regs: libc::user_regs_struct, register: Register) -> Result<()> {
        ptrace::setregs(tid, regs).map_err(|e| InspectError::Register {
            register: register.to_string(),
            reason: e.to_string(),
        })
    }

    fn wait_for(&self, tid: Pid) -> Result<WaitStatus> {
        waitpid(tid, Some(WaitPidFlag::__WALL))
            .map_err(|e| unavailable(format!("waitpid failed: {}", e)))
    }

    /// Next event from any traced thread
    fn wait_any(&self) -> Result<WaitStatus> {
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))
            .map_err(|e| unavailable(format!("waitpid failed: {}", e)))
    }

    /// Continue one thread; a thread that vanished is reported by `wait_any`
    fn cont_thread(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        match ptrace::cont(tid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(unavailable(format!("continue failed: {}", e))),
        }
    }

    /// Forget an exited thread; returns the exit status once the process is gone
    fn reap(&mut self, tid: Pid, status: i32) -> Option<i32> {
        self.threads.remove(&tid);
        self.starting.remove(&tid);
        self.pending.remove(&tid);
        if tid == self.current {
            self.current = self.threads.first().copied().unwrap_or(self.pid);
        }
        if tid != self.pid {
            debug!(tid = tid.as_raw(), status, "thread exited");
            return None;
        }
        self.state = TargetState::Exited(status);
        Some(status)
    }

    /// Record the thread announced by a `PTRACE_EVENT_CLONE` stop of `parent`
    ///
    /// Returns the new thread when its initial stop is still to come.
    fn track_clone(&mut self, parent: Pid) -> Result<Option<Pid>> {
        let raw = ptrace::getevent(parent)
            .map_err(|e| unavailable(format!("failed to read clone event: {}", e)))?;
        let tid = Pid::from_raw(raw as i32);
        if !self.threads.insert(tid) {
            return Ok(None);
        }
        debug!(parent = parent.as_raw(), tid = tid.as_raw(), "new thread");
        self.starting.insert(tid);
        Ok(Some(tid))
    }

    /// Whether a SIGSTOP of `tid` is the initial stop of a cloned thread
    fn is_initial_stop(&mut self, tid: Pid) -> bool {
        self.starting.remove(&tid) || self.threads.insert(tid)
    }

    /// If `tid` trapped on one of our breakpoints, rewind it onto the patch
    fn breakpoint_hit(&self, tid: Pid) -> Result<Option<String>> {
        let mut regs = self.regs_of(tid)?;
        let hit = regs.rip.wrapping_sub(1);
        let Some(symbol) = self.breakpoints.get(&hit).map(|bp| bp.symbol.clone()) else {
            return Ok(None);
        };
        regs.rip = hit;
        self.set_regs_of(tid, regs, Register::InstructionPointer)?;
        Ok(Some(symbol))
    }

    /// Stop every traced thread other than `except`
    ///
    /// A thread that traps on a breakpoint on its way to the stop is rewound
    /// so the hit is reported again after the next resume.
    fn stop_others(&mut self, except: Pid) -> Result<()> {
        let mut outstanding = BTreeSet::new();
        for &tid in &self.threads {
            if tid == except {
                continue;
            }
            if !self.starting.contains(&tid) {
                match tgkill(self.pid, tid, Signal::SIGSTOP) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(unavailable(format!("failed to stop thread {}: {}", tid, e))),
                }
            }
            outstanding.insert(tid);
        }

        while !outstanding.is_empty() {
            match self.wait_any()? {
                WaitStatus::Stopped(tid, Signal::SIGSTOP) => {
                    self.starting.remove(&tid);
                    self.threads.insert(tid);
                    outstanding.remove(&tid);
                }
                WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                    self.breakpoint_hit(tid)?;
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::Stopped(tid, signal) => {
                    self.pending.insert(tid, signal);
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                    if let Some(new) = self.track_clone(tid)? {
                        outstanding.insert(new);
                    }
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::PtraceEvent(tid, ..) | WaitStatus::PtraceSyscall(tid) => {
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::Exited(tid, code) => {
                    outstanding.remove(&tid);
                    if self.reap(tid, code).is_some() {
                        return Ok(());
                    }
                }
                WaitStatus::Signaled(tid, signal, _) => {
                    outstanding.remove(&tid);
                    if self.reap(tid, 128 + signal as i32).is_some() {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        debug!(threads = self.threads.len(), "all threads stopped");
        Ok(())
    }

    /// Execute the original instruction under a breakpoint the current
    /// thread is parked on
    fn step_over_breakpoint(&mut self) -> Result<()> {
        let tid = self.current;
        let rip = self.regs_of(tid)?.rip;
        let Some(original) = self.breakpoints.get(&rip).map(|bp| bp.original) else {
            return Ok(());
        };
        self.patch_byte(rip, original)?;
        loop {
            ptrace::step(tid, None)
                .map_err(|e| unavailable(format!("single-step failed: {}", e)))?;
            match self.wait_for(tid)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
                // Interrupted before the instruction ran; step it again
                WaitStatus::Stopped(_, signal) => {
                    self.pending.insert(tid, signal);
                }
                WaitStatus::Exited(_, code) => {
                    if self.reap(tid, code).is_some() {
                        return Ok(());
                    }
                    break;
                }
                WaitStatus::Signaled(_, signal, _) => {
                    if self.reap(tid, 128 + signal as i32).is_some() {
                        return Ok(());
                    }
                    break;
                }
                _ => break,
            }
        }
        self.patch_byte(rip, INT3)?;
        Ok(())
    }
}

fn is_position_independent(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| InspectError::malformed(path, e))?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| InspectError::malformed(path, e))?;
    let object = object::File::parse(&*mmap).map_err(|e| InspectError::malformed(path, e))?;
    Ok(object.kind() == ObjectKind::Dynamic)
}

impl InspectionHost for PtraceHost {
    fn ensure_paused(&self) -> Result<()> {
        match self.state {
            TargetState::Stopped => Ok(()),
            TargetState::Running => Err(unavailable(format!("process {} is running", self.pid))),
            TargetState::Exited(code) => Err(unavailable(format!(
                "process {} exited with status {}",
                self.pid, code
            ))),
        }
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }
        let mut local = [IoSliceMut::new(&mut buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        let read = process_vm_readv(self.pid, &mut local, &remote)
            .map_err(|_| InspectError::MemoryRead { addr, len })?;
        if read != len {
            return Err(InspectError::MemoryRead { addr, len });
        }
        Ok(buf)
    }

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let err = || InspectError::MemoryWrite {
            addr,
            len: bytes.len(),
        };
        let end = addr.checked_add(bytes.len() as u64).ok_or_else(err)?;
        let mut word_addr = addr & !(WORD - 1);
        while word_addr < end {
            let mut word = self.peek(word_addr).map_err(|_| err())?.to_le_bytes();
            for (i, byte) in word.iter_mut().enumerate() {
                let at = word_addr + i as u64;
                if at >= addr && at < end {
                    *byte = bytes[(at - addr) as usize];
                }
            }
            self.poke(word_addr, u64::from_le_bytes(word)).map_err(|_| err())?;
            word_addr += WORD;
        }
        Ok(())
    }

    fn read_register(&self, register: Register) -> Result<u64> {
        let regs = self.regs_of(self.current)?;
        let value = match register {
            Register::FramePointer => regs.rbp,
            Register::StackPointer => regs.rsp,
            Register::InstructionPointer => regs.rip,
            Register::Argument(0) => regs.rdi,
            Register::Argument(1) => regs.rsi,
            Register::Argument(2) => regs.rdx,
            Register::Argument(3) => regs.rcx,
            Register::Argument(4) => regs.r8,
            Register::Argument(5) => regs.r9,
            Register::Argument(_) => {
                return Err(InspectError::Register {
                    register: register.to_string(),
                    reason: "passed on the stack".to_string(),
                })
            }
        };
        Ok(value)
    }

    fn write_register(&mut self, register: Register, value: u64) -> Result<()> {
        let mut regs = self.regs_of(self.current)?;
        let slot = match register {
            Register::FramePointer => &mut regs.rbp,
            Register::StackPointer => &mut regs.rsp,
            Register::InstructionPointer => &mut regs.rip,
            Register::Argument(0) => &mut regs.rdi,
            Register::Argument(1) => &mut regs.rsi,
            Register::Argument(2) => &mut regs.rdx,
            Register::Argument(3) => &mut regs.rcx,
            Register::Argument(4) => &mut regs.r8,
            Register::Argument(5) => &mut regs.r9,
            Register::Argument(_) => {
                return Err(InspectError::Register {
                    register: register.to_string(),
                    reason: "passed on the stack".to_string(),
                })
            }
        };
        *slot = value;
        self.set_regs_of(self.current, regs, register)
    }

    fn lookup_symbol(&self, name: &str) -> Result<u64> {
        self.symbols
            .lookup(name)
            .ok_or_else(|| InspectError::UnresolvedSymbol(name.to_string()))
    }

    fn add_symbol_file(&mut self, registration: &SymbolFileRegistration) -> Result<()> {
        let object = self.symbols.register(registration)?;
        debug!(
            path = %registration.path.display(),
            symbols = object.symbol_count(),
            "object registered"
        );
        Ok(())
    }

    fn insert_breakpoint(&mut self, symbol: &str) -> Result<()> {
        self.ensure_paused()?;
        let addr = self.lookup_symbol(symbol)?;
        if self.breakpoints.contains_key(&addr) {
            return Ok(());
        }
        let original = self.patch_byte(addr, INT3)?;
        debug!(symbol, addr = %format!("0x{:x}", addr), "breakpoint inserted");
        self.breakpoints.insert(
            addr,
            Breakpoint {
                symbol: symbol.to_string(),
                original,
            },
        );
        Ok(())
    }

    fn resume(&mut self) -> Result<StopReason> {
        self.ensure_paused()?;
        self.step_over_breakpoint()?;
        if let TargetState::Exited(code) = self.state {
            return Ok(StopReason::Exited(code));
        }

        let threads: Vec<Pid> = self.threads.iter().copied().collect();
        for tid in threads {
            let signal = self.pending.remove(&tid);
            self.cont_thread(tid, signal)?;
        }
        self.state = TargetState::Running;

        loop {
            match self.wait_any()? {
                WaitStatus::Exited(tid, code) => {
                    if let Some(code) = self.reap(tid, code) {
                        return Ok(StopReason::Exited(code));
                    }
                }
                WaitStatus::Signaled(tid, signal, _) => {
                    if let Some(code) = self.reap(tid, 128 + signal as i32) {
                        return Ok(StopReason::Exited(code));
                    }
                }
                WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                    let Some(symbol) = self.breakpoint_hit(tid)? else {
                        self.cont_thread(tid, None)?;
                        continue;
                    };
                    self.current = tid;
                    self.stop_others(tid)?;
                    if let TargetState::Exited(code) = self.state {
                        return Ok(StopReason::Exited(code));
                    }
                    self.state = TargetState::Stopped;
                    debug!(tid = tid.as_raw(), symbol = %symbol, "breakpoint hit");
                    return Ok(StopReason::Breakpoint(symbol));
                }
                WaitStatus::Stopped(tid, Signal::SIGSTOP) if self.is_initial_stop(tid) => {
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::Stopped(tid, signal) => {
                    debug!(tid = tid.as_raw(), %signal, "forwarding signal");
                    self.cont_thread(tid, Some(signal))?;
                }
                WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                    self.track_clone(tid)?;
                    self.cont_thread(tid, None)?;
                }
                WaitStatus::PtraceEvent(tid, ..) | WaitStatus::PtraceSyscall(tid) => {
                    self.cont_thread(tid, None)?;
                }
                _ => {}
            }
        }
    }

    fn symbolize(&self, ip: u64) -> (Option<String>, Option<SourceLocation>) {
        self.symbols.symbolize(ip)
    }
}

impl Drop for PtraceHost {
    fn drop(&mut self) {
        if self.state != TargetState::Stopped {
            return;
        }
        for (&addr, bp) in &self.breakpoints {
            if let Err(e) = self.patch_byte(addr, bp.original) {
                warn!(symbol = %bp.symbol, error = %e, "failed to remove breakpoint");
            }
        }
        if self.spawned {
            return;
        }
        for &tid in &self.threads {
            let signal = self.pending.get(&tid).copied();
            if let Err(e) = ptrace::detach(tid, signal) {
                warn!(tid = tid.as_raw(), error = %e, "failed to detach");
            }
        }
    }
}
