//! Struct layout and symbol configuration
//!
//! The inspector interprets raw target memory purely from external knowledge
//! of type layout. Defaults describe an sgx-lkl build on x86_64; a TOML file
//! can override any field.
//!
//! # Example ltscope.toml
//!
//! ```toml
//! [lthread]
//! tid = 0x5c
//! cpu = 0x1d4
//!
//! [limits]
//! max_list_nodes = 4096
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct InspectorConfig {
    pub symbols: SymbolNames,
    pub lthread: LthreadLayout,
    pub queue: QueueLayout,
    pub futex: FutexLayout,
    pub active: ActiveListLayout,
    pub syscall: SyscallLayout,
    pub enclave: EnclaveLayout,
    pub dso: DsoLayout,
    pub task: TaskLayout,
    pub limits: Limits,
}

impl InspectorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.cell_size == 0 {
            anyhow::bail!("queue.cell_size must be non-zero");
        }
        if self.syscall.entry_size == 0 {
            anyhow::bail!("syscall.entry_size must be non-zero");
        }
        if self.limits.max_list_nodes == 0
            || self.limits.max_queue_walk == 0
            || self.limits.max_read_size == 0
        {
            anyhow::bail!("limits must be non-zero");
        }
        Ok(())
    }
}

/// Global symbol names in the target
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SymbolNames {
    pub run_queue: String,
    pub syscall_request_queue: String,
    pub syscall_return_queue: String,
    pub slot_table: String,
    pub max_syscalls: String,
    pub syscall_table: String,
    pub futex_queues: String,
    pub active_lthreads: String,
    pub init_task: String,
    pub simulated_library_path: String,
    pub debug_symbols_alive: String,
}

impl Default for SymbolNames {
    fn default() -> Self {
        Self {
            run_queue: "__scheduler_queue".to_string(),
            syscall_request_queue: "__syscall_queue".to_string(),
            syscall_return_queue: "__return_queue".to_string(),
            slot_table: "slotlthreads".to_string(),
            max_syscalls: "maxsyscalls".to_string(),
            syscall_table: "S".to_string(),
            futex_queues: "futex_queues".to_string(),
            active_lthreads: "__active_lthreads".to_string(),
            init_task: "init_task".to_string(),
            simulated_library_path: "libsgxlkl_path".to_string(),
            debug_symbols_alive: "__gdb_load_debug_symbols_alive".to_string(),
        }
    }
}

/// Field offsets within `struct lthread`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LthreadLayout {
    pub ctx_ebp: u64,
    pub ctx_esp: u64,
    pub ctx_eip: u64,
    pub tid: u64,
    pub cpu: u64,
    pub funcname: u64,
    pub funcname_len: usize,
}

impl Default for LthreadLayout {
    fn default() -> Self {
        Self {
            ctx_ebp: 0x08,
            ctx_esp: 0x00,
            ctx_eip: 0x10,
            tid: 0x5c,
            cpu: 0x1d4,
            funcname: 0x60,
            funcname_len: 64,
        }
    }
}

/// Field offsets within `struct mpmc_queue` and its cells
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueLayout {
    pub buffer: u64,
    pub buffer_mask: u64,
    pub enqueue_pos: u64,
    pub dequeue_pos: u64,
    pub cell_size: u64,
    pub cell_data: u64,
}

impl Default for QueueLayout {
    fn default() -> Self {
        Self {
            buffer: 0x40,
            buffer_mask: 0x48,
            enqueue_pos: 0x80,
            dequeue_pos: 0xc0,
            cell_size: 16,
            cell_data: 8,
        }
    }
}

/// Field offsets within `struct futex_q`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FutexLayout {
    pub key: u64,
    pub deadline: u64,
    pub lt: u64,
    pub next: u64,
}

impl Default for FutexLayout {
    fn default() -> Self {
        Self {
            key: 0x00,
            deadline: 0x08,
            lt: 0x18,
            next: 0x20,
        }
    }
}

/// Field offsets within `struct lthread_queue`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActiveListLayout {
    pub lt: u64,
    pub next: u64,
}

impl Default for ActiveListLayout {
    fn default() -> Self {
        Self { lt: 0x00, next: 0x08 }
    }
}

/// Layout of the syscall slot array `S`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyscallLayout {
    pub entry_size: u64,
    pub syscallno: u64,
}

impl Default for SyscallLayout {
    fn default() -> Self {
        Self {
            entry_size: 0x40,
            syscallno: 0x00,
        }
    }
}

/// Enclave configuration passed to the starter-ready hook
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnclaveLayout {
    pub base: u64,
    pub mode: u64,
    pub hw_mode_value: i32,
}

impl Default for EnclaveLayout {
    fn default() -> Self {
        Self {
            base: 0x00,
            mode: 0x10,
            hw_mode_value: 1,
        }
    }
}

/// Field offsets within the dynamic loader's `struct dso`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DsoLayout {
    pub base: u64,
}

impl Default for DsoLayout {
    fn default() -> Self {
        Self { base: 0x00 }
    }
}

/// Kernel `task_struct` and `thread_info` offsets
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskLayout {
    pub stack: u64,
    pub tasks: u64,
    pub pid: u64,
    pub thread_group: u64,
    pub comm: u64,
    pub comm_len: usize,
    pub thread_info_tid: u64,
}

impl Default for TaskLayout {
    fn default() -> Self {
        Self {
            stack: 0x08,
            tasks: 0x2b0,
            pid: 0x398,
            thread_group: 0x3e0,
            comm: 0x5b8,
            comm_len: 16,
            thread_info_tid: 0x20,
        }
    }
}

/// Traversal budgets guarding against corrupted target structures
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    pub max_list_nodes: usize,
    pub max_queue_walk: u64,
    /// Largest single block read on request: library images and memory dumps
    pub max_read_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_list_nodes: 65_536,
            max_queue_walk: 1 << 20,
            max_read_size: 1 << 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = InspectorConfig::from_toml_str("").unwrap();
        assert_eq!(config, InspectorConfig::default());
        assert_eq!(config.symbols.run_queue, "__scheduler_queue");
    }

    #[test]
    fn test_partial_section_override() {
        let config = InspectorConfig::from_toml_str(
            r#"
[lthread]
tid = 0x10

[symbols]
futex_queues = "my_futexes"
"#,
        )
        .unwrap();
        assert_eq!(config.lthread.tid, 0x10);
        assert_eq!(config.lthread.cpu, LthreadLayout::default().cpu);
        assert_eq!(config.symbols.futex_queues, "my_futexes");
        assert_eq!(config.symbols.run_queue, "__scheduler_queue");
    }

    #[test]
    fn test_zero_cell_size_rejected() {
        let result = InspectorConfig::from_toml_str("[queue]\ncell_size = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(InspectorConfig::from_toml_str("[lthread\n").is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = InspectorConfig::from_file("/nonexistent/ltscope.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
