//! CLI argument parsing for ltscope

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

/// Queue selector for `list-queue-threads`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueArg {
    Run,
    SyscallRequest,
    SyscallReturn,
}

/// Parse an unsigned number given in decimal or with a `0x` prefix
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[command(name = "ltscope")]
#[command(version)]
#[command(
    about = "Inspect the lthread scheduler of a stopped process: queues, futex waiters and backtraces of parked threads",
    long_about = None
)]
pub struct Cli {
    /// Attach to running process by PID
    #[arg(short = 'p', long = "pid", value_name = "PID", global = true)]
    pub pid: Option<i32>,

    /// TOML file overriding struct layouts and symbol names
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Backtrace of one parked lthread
    Backtrace {
        /// Address of the lthread
        #[arg(value_parser = parse_number)]
        thread: u64,
        /// Maximum number of frames
        depth: Option<usize>,
    },

    /// Threads waiting in one scheduler queue, oldest first
    ListQueueThreads {
        #[arg(long = "queue", value_enum)]
        queue: QueueArg,
        /// Also print each thread's backtrace, at most this deep
        #[arg(long = "depth")]
        depth: Option<usize>,
    },

    /// Number of waiting lthreads per queue
    QueueStats,

    /// Backtrace of every lthread waiting on a futex
    ListFutexWaiters {
        depth: Option<usize>,
    },

    /// Backtrace of every active lthread
    ListThreads {
        depth: Option<usize>,
    },

    /// Occupied syscall slots with their owner and system call number
    SlotTable,

    /// Write all active lthreads to a CSV file
    ExportThreads {
        #[arg(long = "dest", value_name = "FILE", default_value = "/tmp/backtrace.csv")]
        dest: PathBuf,
        #[arg(long = "depth")]
        depth: Option<usize>,
    },

    /// Write all futex waiters to a CSV file
    ExportFutexWaiters {
        #[arg(long = "dest", value_name = "FILE", default_value = "/tmp/waiters.csv")]
        dest: PathBuf,
        #[arg(long = "depth")]
        depth: Option<usize>,
    },

    /// Register an object's symbols at a runtime base address
    LoadSymbols {
        object: PathBuf,
        #[arg(value_parser = parse_number)]
        base: u64,
    },

    /// Kernel task with the given pid
    FindTaskByPid {
        pid: i32,
    },

    /// Every kernel task reachable from init_task
    ListTasks,

    /// Hex dump of target memory
    DumpMemory {
        #[arg(value_parser = parse_number)]
        address: u64,
        #[arg(value_parser = parse_number, default_value = "0x100")]
        count: u64,
    },

    /// Source file of the current instruction pointer
    SourcePath,

    /// Run a program under the lifecycle hooks until it exits
    Watch {
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}
