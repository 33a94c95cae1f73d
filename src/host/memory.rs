//! In-memory inspection host
//!
//! A synthetic, always-paused address space. Regions, registers and symbols
//! are set up by the caller; stops returned by [`InspectionHost::resume`] are
//! scripted. Used to exercise the inspector without a live process.

use super::{InspectionHost, Register, StopReason};
use crate::dwarf::SourceLocation;
use crate::error::{InspectError, Result};
use crate::symbols::loader::SymbolFileRegistration;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Synthetic target backed by plain byte vectors
#[derive(Debug, Default)]
pub struct MemoryHost {
    regions: BTreeMap<u64, Vec<u8>>,
    registers: HashMap<Register, u64>,
    symbols: HashMap<String, u64>,
    registrations: Vec<SymbolFileRegistration>,
    breakpoints: BTreeSet<String>,
    stops: VecDeque<StopReason>,
    running: bool,
    fail_unwind: bool,
    register_writes: usize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`, replacing any region starting there
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.insert(base, bytes);
    }

    /// Map a zeroed region of `len` bytes
    pub fn map_zeroed(&mut self, base: u64, len: usize) {
        self.map(base, vec![0; len]);
    }

    pub fn define_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn set_register(&mut self, register: Register, value: u64) {
        self.registers.insert(register, value);
    }

    /// Queue a stop for the next `resume`
    pub fn push_stop(&mut self, stop: StopReason) {
        self.stops.push_back(stop);
    }

    /// Simulate a target that is running (not paused)
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Make every subsequent unwind fail
    pub fn set_fail_unwind(&mut self, fail: bool) {
        self.fail_unwind = fail;
    }

    pub fn registrations(&self) -> &[SymbolFileRegistration] {
        &self.registrations
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &str> {
        self.breakpoints.iter().map(String::as_str)
    }

    /// Total register writes performed through the host interface
    pub fn register_writes(&self) -> usize {
        self.register_writes
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write_memory(addr, &value.to_le_bytes())
    }

    fn region_containing(&self, addr: u64, len: usize) -> Option<(u64, &Vec<u8>)> {
        let (&base, bytes) = self.regions.range(..=addr).next_back()?;
        let end = base.checked_add(bytes.len() as u64)?;
        let want_end = addr.checked_add(len as u64)?;
        (want_end <= end).then_some((base, bytes))
    }
}

impl InspectionHost for MemoryHost {
    fn ensure_paused(&self) -> Result<()> {
        if self.running {
            return Err(InspectError::TargetUnavailable(
                "target is running".to_string(),
            ));
        }
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let (base, bytes) = self
            .region_containing(addr, len)
            .ok_or(InspectError::MemoryRead { addr, len })?;
        let start = (addr - base) as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        let base = self
            .region_containing(addr, len)
            .map(|(base, _)| base)
            .ok_or(InspectError::MemoryWrite { addr, len })?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(InspectError::MemoryWrite { addr, len })?;
        let start = (addr - base) as usize;
        region[start..start + len].copy_from_slice(data);
        Ok(())
    }

    fn read_register(&self, register: Register) -> Result<u64> {
        Ok(self.registers.get(&register).copied().unwrap_or(0))
    }

    fn write_register(&mut self, register: Register, value: u64) -> Result<()> {
        self.register_writes += 1;
        self.registers.insert(register, value);
        Ok(())
    }

    fn lookup_symbol(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| InspectError::UnresolvedSymbol(name.to_string()))
    }

    fn add_symbol_file(&mut self, registration: &SymbolFileRegistration) -> Result<()> {
        debug!(path = %registration.path.display(), "registering symbol file");
        self.registrations.push(registration.clone());
        Ok(())
    }

    fn insert_breakpoint(&mut self, symbol: &str) -> Result<()> {
        self.lookup_symbol(symbol)?;
        self.breakpoints.insert(symbol.to_string());
        Ok(())
    }

    fn resume(&mut self) -> Result<StopReason> {
        Ok(self.stops.pop_front().unwrap_or(StopReason::Exited(0)))
    }

    fn symbolize(&self, ip: u64) -> (Option<String>, Option<SourceLocation>) {
        let function = self
            .symbols
            .iter()
            .filter(|(_, &addr)| addr <= ip)
            .max_by_key(|(_, &addr)| addr)
            .map(|(name, _)| name.clone());
        (function, None)
    }

    fn unwind(&self, depth: Option<usize>) -> Result<crate::backtrace::Backtrace> {
        if self.fail_unwind {
            return Err(InspectError::Unwind("simulated unwind failure".to_string()));
        }
        let frames = crate::stack_unwind::unwind_stack(self, depth)?;
        Ok(crate::backtrace::Backtrace::from_stack_frames(self, frames))
    }
}
