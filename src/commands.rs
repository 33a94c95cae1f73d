//! Operator commands
//!
//! Each command runs against a paused target through a [`Session`] and
//! writes its report to `out`, as text or JSON.

use crate::cli::{Command, OutputFormat, QueueArg};
use crate::export::{self, FutexRow, ThreadRow};
use crate::host::{InspectionHost, Register};
use crate::scheduler::queue::RingQueue;
use crate::scheduler::{LthreadHandle, LthreadInfo, QueueKind};
use crate::session::Session;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Write;

impl From<QueueArg> for QueueKind {
    fn from(arg: QueueArg) -> Self {
        match arg {
            QueueArg::Run => QueueKind::Run,
            QueueArg::SyscallRequest => QueueKind::SyscallRequest,
            QueueArg::SyscallReturn => QueueKind::SyscallReturn,
        }
    }
}

/// Write `value` as JSON, or the text produced by `text`
fn emit<W: Write, T: Serialize>(
    out: &mut W,
    format: OutputFormat,
    value: &T,
    text: impl FnOnce() -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(value)?)?,
        OutputFormat::Text => write!(out, "{}", text())?,
    }
    Ok(())
}

#[derive(Serialize)]
struct QueueReport {
    queue: Option<RingQueue>,
    threads: Vec<LthreadInfo>,
    diagnostics: Vec<String>,
}

/// Header counters of a queue that was just walked
fn queue_stats_line(queue: &RingQueue) -> String {
    format!(
        "{}: enqueue_pos {}, dequeue_pos {}, waiting {}, buffer_mask 0x{:x}\n",
        queue.name,
        queue.enqueue_pos,
        queue.dequeue_pos,
        queue.enqueue_pos.saturating_sub(queue.dequeue_pos),
        queue.buffer_mask
    )
}

#[derive(Serialize)]
struct SlotReport {
    slot: u64,
    lthread: LthreadHandle,
    tid: i32,
    syscallno: i64,
}

/// Run one inspection command
///
/// `watch` needs to own the process lifecycle and is handled by the caller.
pub fn run<H: InspectionHost, W: Write>(
    session: &mut Session<H>,
    command: &Command,
    format: OutputFormat,
    out: &mut W,
) -> Result<()> {
    match command {
        Command::Backtrace { thread, depth } => {
            let bt = session
                .backtrace(LthreadHandle(*thread), *depth)
                .with_context(|| format!("Failed to backtrace lthread 0x{:x}", thread))?;
            emit(out, format, &bt, || bt.to_string())
        }

        Command::ListQueueThreads { queue, depth } => {
            let kind = QueueKind::from(*queue);
            let walk = session.queue_threads(kind)?;
            let diagnostics: Vec<String> = walk.diagnostics.iter().map(|d| d.to_string()).collect();

            if let Some(depth) = depth {
                let rows = export::thread_rows(session, &walk.threads, Some(*depth))?;
                return emit(out, format, &rows, || {
                    let mut text = format!("{} lthreads:\n", kind);
                    if let Some(queue) = &walk.queue {
                        text.push_str(&queue_stats_line(queue));
                    }
                    text.push_str(&export::render_thread_report(&rows));
                    for d in &diagnostics {
                        text.push_str(&format!("warning: {}\n", d));
                    }
                    text
                });
            }

            let threads = walk
                .threads
                .iter()
                .map(|&lt| session.lthread_info(lt))
                .collect::<crate::error::Result<Vec<_>>>()?;
            let report = QueueReport {
                queue: walk.queue,
                threads,
                diagnostics,
            };
            emit(out, format, &report, || {
                let mut text = format!("\n{} lthreads:\n", kind);
                if let Some(queue) = &report.queue {
                    text.push_str(&queue_stats_line(queue));
                }
                for t in &report.threads {
                    text.push_str(&format!("  {} tid {:>3} cpu {} {}\n", t.handle, t.tid, t.cpu, t.name));
                }
                for d in &report.diagnostics {
                    text.push_str(&format!("warning: {}\n", d));
                }
                text
            })
        }

        Command::QueueStats => {
            let stats = session.queue_stats()?;
            emit(out, format, &stats, || {
                format!(
                    "Waiting lthreads:\n  \
                     scheduler queue:       {}\n  \
                     syscall request queue: {}\n  \
                     syscall return queue:  {}\n  \
                     waiting for futex:     {}\n  \
                     Total:                 {}\n",
                    stats.run_queue,
                    stats.syscall_request_queue,
                    stats.syscall_return_queue,
                    stats.futex_waiters,
                    stats.total()
                )
            })
        }

        Command::ListFutexWaiters { depth } => {
            let rows = futex_rows(session, *depth)?;
            emit(out, format, &rows, || export::render_futex_report(&rows))
        }

        Command::ListThreads { depth } => {
            let rows = active_thread_rows(session, *depth)?;
            emit(out, format, &rows, || export::render_thread_report(&rows))
        }

        Command::SlotTable => {
            let slots = session
                .occupied_slots()?
                .into_iter()
                .map(|entry| {
                    Ok(SlotReport {
                        slot: entry.slot,
                        lthread: entry.lthread,
                        tid: session.lthread_info(entry.lthread)?.tid,
                        syscallno: entry.syscallno,
                    })
                })
                .collect::<crate::error::Result<Vec<_>>>()?;
            emit(out, format, &slots, || {
                slots
                    .iter()
                    .map(|s| {
                        format!(
                            "slot {:>3}: lthread {} tid {} syscall {}\n",
                            s.slot, s.lthread, s.tid, s.syscallno
                        )
                    })
                    .collect()
            })
        }

        Command::ExportThreads { dest, depth } => {
            let rows = active_thread_rows(session, *depth)?;
            writeln!(out, "write to {}", dest.display())?;
            export::write_csv(&rows, dest)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            Ok(())
        }

        Command::ExportFutexWaiters { dest, depth } => {
            let rows = futex_rows(session, *depth)?;
            writeln!(out, "{}", rows.len())?;
            writeln!(out, "write to {}", dest.display())?;
            export::write_csv(&rows, dest)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            Ok(())
        }

        Command::LoadSymbols { object, base } => {
            let registration = session
                .load_symbols(object, *base)
                .with_context(|| format!("Failed to load symbols from {}", object.display()))?;
            writeln!(out, "add-symbol-file {}", registration)?;
            Ok(())
        }

        Command::FindTaskByPid { pid } => match session.find_task_by_pid(*pid)? {
            Some(task) => emit(out, format, &task, || {
                format!("0x{:x} {} {} {}\n", task.address, task.pid, task.thread_id, task.comm)
            }),
            None => bail!("No task of PID {}", pid),
        },

        Command::ListTasks => {
            let tasks = session.tasks()?;
            emit(out, format, &tasks, || {
                let mut text = format!("{:<18} {:>6} {:>6} {}\n", "TASK", "PID", "TID", "COMM");
                for task in &tasks {
                    text.push_str(&format!(
                        "0x{:016x} {:>6} {:>6} {}\n",
                        task.address, task.pid, task.thread_id, task.comm
                    ));
                }
                text
            })
        }

        Command::DumpMemory { address, count } => {
            session.host.ensure_paused()?;
            let limit = session.config.limits.max_read_size;
            if *count > limit as u64 {
                bail!("Refusing to dump {} bytes (limits.max_read_size is {})", count, limit);
            }
            let bytes = session.host.read_memory(*address, *count as usize)?;
            let text = hexdump(*address, &bytes);
            emit(out, format, &hex::encode(&bytes), || text)
        }

        Command::SourcePath => {
            session.host.ensure_paused()?;
            let rip = session.host.read_register(Register::InstructionPointer)?;
            let (_, location) = session.host.symbolize(rip);
            let file = location.map(|l| l.file);
            emit(out, format, &file, || match &file {
                Some(file) => format!("{}\n", file),
                None => format!("No source information for 0x{:x}\n", rip),
            })
        }

        Command::Watch { .. } => bail!("watch must be run as the top-level command"),
    }
}

fn active_thread_rows<H: InspectionHost>(
    session: &mut Session<H>,
    depth: Option<usize>,
) -> Result<Vec<ThreadRow>> {
    let threads = session.active_lthreads()?;
    Ok(export::thread_rows(session, &threads, depth)?)
}

fn futex_rows<H: InspectionHost>(session: &mut Session<H>, depth: Option<usize>) -> Result<Vec<FutexRow>> {
    let waiters = session.futex_waiters()?;
    Ok(export::futex_rows(session, &waiters, depth)?)
}

/// 16 bytes per line: address, hex bytes, printable characters
pub fn hexdump(address: u64, bytes: &[u8]) -> String {
    let mut text = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        text.push_str(&format!(
            "{:016x}: {:<47}  {}\n",
            address.wrapping_add((i * 16) as u64),
            hex.join(" "),
            ascii
        ));
    }
    text
}
