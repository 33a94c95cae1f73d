//! Snapshot exports of lthread state
//!
//! Rows are built in input order. A thread whose stack cannot be unwound
//! still gets a row; its backtrace field reads `<unavailable: reason>`.

use crate::csv_output::{CsvOutput, CsvRecord};
use crate::error::Result;
use crate::host::InspectionHost;
use crate::scheduler::{FutexWaiter, LthreadHandle, LthreadInfo};
use crate::session::Session;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// One active lthread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadRow {
    pub thread: LthreadHandle,
    pub tid: i32,
    pub name: String,
    pub cpu: i32,
    pub backtrace: String,
}

/// One futex wait-list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FutexRow {
    pub key: u32,
    pub lt: LthreadHandle,
    pub deadline: u64,
    pub backtrace: String,
}

impl CsvRecord for ThreadRow {
    const HEADER: &'static [&'static str] = &["thread", "tid", "name", "cpu", "backtrace"];

    fn fields(&self) -> Vec<String> {
        vec![
            self.thread.to_string(),
            self.tid.to_string(),
            self.name.clone(),
            self.cpu.to_string(),
            self.backtrace.clone(),
        ]
    }
}

impl CsvRecord for FutexRow {
    const HEADER: &'static [&'static str] = &["key", "lt", "deadline", "backtrace"];

    fn fields(&self) -> Vec<String> {
        vec![
            self.key.to_string(),
            self.lt.to_string(),
            self.deadline.to_string(),
            self.backtrace.clone(),
        ]
    }
}

/// Rendered backtrace, or the reason it is missing
fn backtrace_field<H: InspectionHost>(
    session: &mut Session<H>,
    lthread: LthreadHandle,
    depth: Option<usize>,
) -> String {
    match session.backtrace(lthread, depth) {
        Ok(bt) => bt.to_string(),
        Err(e) => {
            warn!(lthread = %lthread, error = %e, "backtrace unavailable");
            format!("<unavailable: {}>", e)
        }
    }
}

pub fn thread_rows<H: InspectionHost>(
    session: &mut Session<H>,
    threads: &[LthreadHandle],
    depth: Option<usize>,
) -> Result<Vec<ThreadRow>> {
    session.host.ensure_paused()?;
    let mut rows = Vec::with_capacity(threads.len());
    for &lthread in threads {
        let LthreadInfo { tid, cpu, name, .. } = session.lthread_info(lthread)?;
        let backtrace = backtrace_field(session, lthread, depth);
        rows.push(ThreadRow {
            thread: lthread,
            tid,
            name,
            cpu,
            backtrace,
        });
    }
    Ok(rows)
}

pub fn futex_rows<H: InspectionHost>(
    session: &mut Session<H>,
    waiters: &[FutexWaiter],
    depth: Option<usize>,
) -> Result<Vec<FutexRow>> {
    session.host.ensure_paused()?;
    Ok(waiters
        .iter()
        .map(|waiter| FutexRow {
            key: waiter.key,
            lt: waiter.lthread,
            deadline: waiter.deadline,
            backtrace: backtrace_field(session, waiter.lthread, depth),
        })
        .collect())
}

/// Console report, one block per thread
pub fn render_thread_report(rows: &[ThreadRow]) -> String {
    let mut out = String::new();
    for (no, row) in rows.iter().enumerate() {
        let _ = writeln!(
            out,
            "#{:>3} Lthread: TID: {:>3}, Addr: {}, Name: {}, CPU: {}",
            no + 1,
            row.tid,
            row.thread,
            row.name,
            row.cpu
        );
        out.push_str(&row.backtrace);
        out.push('\n');
    }
    out
}

/// Console report, one block per futex waiter
pub fn render_futex_report(rows: &[FutexRow]) -> String {
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "FX entry: key: {}, lt: {}, deadline: {}",
            row.key, row.lt, row.deadline
        );
        out.push_str(&row.backtrace);
        out.push('\n');
    }
    out
}

/// Write `rows` as CSV to `dest`
pub fn write_csv<R: CsvRecord>(rows: &[R], dest: &Path) -> Result<()> {
    CsvOutput::new(rows).write_to(dest)?;
    info!(dest = %dest.display(), rows = rows.len(), "snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectorConfig;
    use crate::host::memory::MemoryHost;
    use crate::host::Register;

    fn parked(host: &mut MemoryHost, config: &InspectorConfig, lt: u64, tid: i32, name: &str) {
        let layout = &config.lthread;
        host.map_zeroed(lt, 0x400);
        host.write_i32(lt + layout.tid, tid).unwrap();
        host.write_i32(lt + layout.cpu, 1).unwrap();
        host.write_memory(lt + layout.funcname, format!("{}\0", name).as_bytes())
            .unwrap();
        host.write_u64(lt + layout.ctx_eip, 0x40_1000).unwrap();
    }

    fn session_with_threads() -> Session<MemoryHost> {
        let config = InspectorConfig::default();
        let mut host = MemoryHost::new();
        parked(&mut host, &config, 0x10_000, 5, "idle");
        parked(&mut host, &config, 0x20_000, 6, "worker, main");
        host.define_symbol("_lthread_sched_event", 0x40_1000);
        host.set_register(Register::InstructionPointer, 0x99);
        Session::new(host, config)
    }

    #[test]
    fn test_thread_rows_in_input_order() {
        let mut session = session_with_threads();
        let rows = thread_rows(
            &mut session,
            &[LthreadHandle(0x20_000), LthreadHandle(0x10_000)],
            None,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tid, 6);
        assert_eq!(rows[1].name, "idle");
        assert!(rows[1].backtrace.contains("_lthread_sched_event"));
    }

    #[test]
    fn test_failed_backtrace_recorded_per_row() {
        let mut session = session_with_threads();
        session.host.set_fail_unwind(true);
        let rows = thread_rows(&mut session, &[LthreadHandle(0x10_000)], None).unwrap();
        assert!(rows[0].backtrace.starts_with("<unavailable: "));
        assert_eq!(
            session.host.read_register(Register::InstructionPointer).unwrap(),
            0x99
        );
    }

    #[test]
    fn test_csv_has_header_once_plus_one_row_each() {
        let mut session = session_with_threads();
        let rows = thread_rows(
            &mut session,
            &[LthreadHandle(0x10_000), LthreadHandle(0x20_000)],
            None,
        )
        .unwrap();
        let csv = CsvOutput::new(&rows).to_csv();
        assert!(csv.starts_with("thread,tid,name,cpu,backtrace\n"));
        assert_eq!(csv.matches("thread,tid,name,cpu,backtrace").count(), 1);
        assert!(csv.contains("\"worker, main\""));
    }

    #[test]
    fn test_futex_report_format() {
        let rows = vec![FutexRow {
            key: 7,
            lt: LthreadHandle(0x10_000),
            deadline: 0,
            backtrace: "#0  0x0000000000401000 in f ()\n".to_string(),
        }];
        assert_eq!(
            render_futex_report(&rows),
            "FX entry: key: 7, lt: 0x10000, deadline: 0\n#0  0x0000000000401000 in f ()\n\n"
        );
    }

    #[test]
    fn test_thread_report_numbering() {
        let row = ThreadRow {
            thread: LthreadHandle(0xabc),
            tid: 4,
            name: "main".to_string(),
            cpu: 0,
            backtrace: String::new(),
        };
        let report = render_thread_report(&[row.clone(), row]);
        assert!(report.starts_with("#  1 Lthread: TID:   4, Addr: 0xabc, Name: main, CPU: 0\n"));
        assert!(report.contains("#  2 Lthread"));
    }
}
