// Shared fixtures: a synthetic lthread scheduler laid out in an in-memory host

#![allow(dead_code)]

use ltscope::config::InspectorConfig;
use ltscope::host::memory::MemoryHost;
use ltscope::host::{InspectionHost, Register};
use ltscope::scheduler::QueueKind;
use ltscope::Session;

/// Entry point every parked lthread appears to be stopped in
pub const SCHED_EVENT: u64 = 0x40_1000;

/// Builds target memory with the default sgx-lkl x86_64 layout
pub struct TargetBuilder {
    pub host: MemoryHost,
    pub config: InspectorConfig,
    next: u64,
}

impl Default for TargetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetBuilder {
    pub fn new() -> Self {
        let mut host = MemoryHost::new();
        host.define_symbol("_lthread_sched_event", SCHED_EVENT);
        host.set_register(Register::FramePointer, 0x7fff_0000);
        host.set_register(Register::StackPointer, 0x7ffe_fff0);
        host.set_register(Register::InstructionPointer, 0x50_0000);
        Self {
            host,
            config: InspectorConfig::default(),
            next: 0x10_0000,
        }
    }

    /// Zeroed, page-aligned block of target memory
    pub fn alloc(&mut self, len: u64) -> u64 {
        let addr = self.next;
        self.host.map_zeroed(addr, len as usize);
        self.next += (len + 0xfff) & !0xfff;
        addr
    }

    /// Pointer-sized global named `name` holding `value`
    pub fn pointer_global(&mut self, name: &str, value: u64) -> u64 {
        let addr = self.alloc(8);
        self.host.write_u64(addr, value).unwrap();
        self.host.define_symbol(name, addr);
        addr
    }

    /// A parked lthread whose saved context is a single frame
    pub fn lthread(&mut self, tid: i32, cpu: i32, name: &str) -> u64 {
        let layout = self.config.lthread.clone();
        let lt = self.alloc(0x400);
        self.host.write_i32(lt + layout.tid, tid).unwrap();
        self.host.write_i32(lt + layout.cpu, cpu).unwrap();
        self.host
            .write_memory(lt + layout.funcname, format!("{}\0", name).as_bytes())
            .unwrap();
        self.host.write_u64(lt + layout.ctx_eip, SCHED_EVENT).unwrap();
        lt
    }

    /// A ring queue with the given counters and `(slot, payload)` cells
    pub fn ring_queue(
        &mut self,
        kind: QueueKind,
        enqueue_pos: u64,
        dequeue_pos: u64,
        buffer_mask: u64,
        cells: &[(u64, u64)],
    ) -> u64 {
        let q = self.config.queue.clone();
        let buffer = self.alloc((buffer_mask + 1) * q.cell_size);
        for &(slot, payload) in cells {
            self.host
                .write_u64(buffer + slot * q.cell_size + q.cell_data, payload)
                .unwrap();
        }
        let queue = self.alloc(0x100);
        self.host.write_u64(queue + q.enqueue_pos, enqueue_pos).unwrap();
        self.host.write_u64(queue + q.dequeue_pos, dequeue_pos).unwrap();
        self.host.write_u64(queue + q.buffer_mask, buffer_mask).unwrap();
        self.host.write_u64(queue + q.buffer, buffer).unwrap();
        let name = kind.symbol(&self.config.symbols).to_string();
        self.pointer_global(&name, queue);
        queue
    }

    /// `slotlthreads`, `S` and `maxsyscalls` for the given slot owners
    pub fn slot_table(&mut self, owners: &[u64], syscallnos: &[i64]) {
        let names = self.config.symbols.clone();
        let syscall = self.config.syscall.clone();
        let count = owners.len() as u64;

        let lthreads = self.alloc(count.max(1) * 8);
        for (i, &lt) in owners.iter().enumerate() {
            self.host.write_u64(lthreads + i as u64 * 8, lt).unwrap();
        }
        let syscalls = self.alloc(count.max(1) * syscall.entry_size);
        for (i, &no) in syscallnos.iter().enumerate() {
            self.host
                .write_u64(syscalls + i as u64 * syscall.entry_size + syscall.syscallno, no as u64)
                .unwrap();
        }
        self.pointer_global(&names.slot_table, lthreads);
        self.pointer_global(&names.syscall_table, syscalls);
        let max = self.alloc(4);
        self.host.write_i32(max, count as i32).unwrap();
        self.host.define_symbol(&names.max_syscalls, max);
    }

    /// `futex_queues` with `(key, lthread, deadline)` nodes in list order
    pub fn futex_list(&mut self, waiters: &[(u32, u64, u64)]) -> Vec<u64> {
        let layout = self.config.futex.clone();
        let nodes: Vec<u64> = waiters.iter().map(|_| self.alloc(0x40)).collect();
        for (i, &(key, lt, deadline)) in waiters.iter().enumerate() {
            let node = nodes[i];
            self.host
                .write_memory(node + layout.key, &key.to_le_bytes())
                .unwrap();
            self.host.write_u64(node + layout.lt, lt).unwrap();
            self.host.write_u64(node + layout.deadline, deadline).unwrap();
            let next = nodes.get(i + 1).copied().unwrap_or(0);
            self.host.write_u64(node + layout.next, next).unwrap();
        }
        let name = self.config.symbols.futex_queues.clone();
        self.pointer_global(&name, nodes.first().copied().unwrap_or(0));
        nodes
    }

    /// `__active_lthreads` chaining `lthreads` in order
    pub fn active_list(&mut self, lthreads: &[u64]) {
        let layout = self.config.active.clone();
        let nodes: Vec<u64> = lthreads.iter().map(|_| self.alloc(0x10)).collect();
        for (i, &lt) in lthreads.iter().enumerate() {
            self.host.write_u64(nodes[i] + layout.lt, lt).unwrap();
            let next = nodes.get(i + 1).copied().unwrap_or(0);
            self.host.write_u64(nodes[i] + layout.next, next).unwrap();
        }
        let name = self.config.symbols.active_lthreads.clone();
        self.pointer_global(&name, nodes.first().copied().unwrap_or(0));
    }

    pub fn session(self) -> Session<MemoryHost> {
        Session::new(self.host, self.config)
    }
}

/// Current rbp/rsp/rip of a host
pub fn registers(host: &MemoryHost) -> [u64; 3] {
    [
        Register::FramePointer,
        Register::StackPointer,
        Register::InstructionPointer,
    ]
    .map(|r| host.read_register(r).unwrap())
}

/// Count CSV records, treating quoted line breaks as part of a field
pub fn csv_records(csv: &str) -> Vec<String> {
    let mut records = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in csv.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '\n' if !quoted => records.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}
