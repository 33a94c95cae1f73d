//! Scheduler lifecycle hooks
//!
//! The target calls empty marker functions at well-known points: once the
//! starter has mapped the library image, and each time its dynamic loader
//! maps another library. The controller plants an internal breakpoint on
//! each marker and keeps a dispatch table from marker symbol to handler.
//! Every handler lets the target continue; a handler that fails is logged
//! and the target still continues.
//!
//! Marker arguments are read from the SysV argument registers at function
//! entry:
//!
//! | marker | arguments |
//! |---|---|
//! | `__gdb_hook_starter_ready` | `conf` |
//! | `__gdb_hook_load_debug_symbols` | `dso`, `symmem`, `symsz` |
//! | `__gdb_hook_load_debug_symbols_from_file` | `dso`, `libpath` |

use crate::error::{InspectError, Result};
use crate::host::{field_addr, InspectionHost, Register, StopReason};
use crate::session::Session;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{error, info, warn};

/// Longest path read out of target memory
const PATH_MAX: usize = 4096;

/// Lifecycle events signalled by marker functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    SchedulerReady,
    LibraryFromImage,
    LibraryFromFile,
}

impl HookEvent {
    pub fn marker(&self) -> &'static str {
        match self {
            HookEvent::SchedulerReady => "__gdb_hook_starter_ready",
            HookEvent::LibraryFromImage => "__gdb_hook_load_debug_symbols",
            HookEvent::LibraryFromFile => "__gdb_hook_load_debug_symbols_from_file",
        }
    }
}

/// What the controller does after a handler ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Continue, and arm these hooks first
    ContinueAndArm(Vec<HookEvent>),
}

/// Reaction to one marker being hit
pub trait HookHandler<H: InspectionHost> {
    fn on_hit(&mut self, session: &mut Session<H>) -> Result<HookAction>;
}

/// The simulated library image is mapped and the scheduler is about to start
#[derive(Debug, Default)]
pub struct SchedulerReadyHook {
    debug_symbols_enabled: bool,
}

impl<H: InspectionHost> HookHandler<H> for SchedulerReadyHook {
    fn on_hit(&mut self, session: &mut Session<H>) -> Result<HookAction> {
        info!("__gdb_hook_starter_ready");
        let layout = session.config.enclave.clone();
        let names = session.config.symbols.clone();
        let conf = session.host.read_register(Register::Argument(0))?;

        let mode = session.host.read_i32(field_addr(conf, layout.mode)?)?;
        if mode == layout.hw_mode_value {
            info!("Running on hardware... skipping simulation load");
        } else {
            let path_ptr = session.resolve(&names.simulated_library_path)?;
            let path = session
                .host
                .read_c_string(session.host.read_u64(path_ptr)?, PATH_MAX)?;
            let base = session.host.read_u64(field_addr(conf, layout.base)?)?;
            info!("Loading symbols for {} at base 0x{:x}", path, base);
            session.load_symbols(Path::new(&path), base)?;
        }

        if self.debug_symbols_enabled {
            return Ok(HookAction::Continue);
        }
        let Some(flag) = session.probe(&names.debug_symbols_alive)? else {
            return Ok(HookAction::Continue);
        };
        session.host.write_i32(flag, 1)?;
        self.debug_symbols_enabled = true;
        info!("Enabled loading in-enclave debug symbols");
        Ok(HookAction::ContinueAndArm(vec![
            HookEvent::LibraryFromImage,
            HookEvent::LibraryFromFile,
        ]))
    }
}

/// The loader mapped a library it only has as an in-memory image
#[derive(Debug, Default)]
pub struct LibraryImageHook;

impl<H: InspectionHost> HookHandler<H> for LibraryImageHook {
    fn on_hit(&mut self, session: &mut Session<H>) -> Result<HookAction> {
        let dso = session.host.read_register(Register::Argument(0))?;
        let symmem = session.host.read_register(Register::Argument(1))?;
        let symsz = session.host.read_register(Register::Argument(2))? as i64;
        if symsz <= 0 || symsz as u64 > session.config.limits.max_read_size as u64 {
            return Err(InspectError::malformed(
                format!("<image at 0x{:x}>", symmem),
                format!("invalid image size {}", symsz),
            ));
        }

        let image = session.host.read_memory(symmem, symsz as usize)?;
        let base = session.host.read_u64(field_addr(dso, session.config.dso.base)?)?;

        let mut file = tempfile::Builder::new()
            .prefix("ltscope-")
            .suffix(".so")
            .tempfile()?;
        file.write_all(&image)?;
        file.flush()?;
        let path = file.into_temp_path();

        info!("Loading symbols at base 0x{:x}...", base);
        let loaded = session.load_symbols(&path, base);
        session.keep_scratch(path);
        loaded?;
        Ok(HookAction::Continue)
    }
}

/// The loader mapped a library from a path both sides can open
#[derive(Debug, Default)]
pub struct LibraryFileHook;

impl<H: InspectionHost> HookHandler<H> for LibraryFileHook {
    fn on_hit(&mut self, session: &mut Session<H>) -> Result<HookAction> {
        let dso = session.host.read_register(Register::Argument(0))?;
        let libpath = session.host.read_register(Register::Argument(1))?;
        let path = session.host.read_c_string(libpath, PATH_MAX)?;
        let base = session.host.read_u64(field_addr(dso, session.config.dso.base)?)?;

        info!("Loading symbols at base 0x{:x}...", base);
        session.load_symbols(Path::new(&path), base)?;
        Ok(HookAction::Continue)
    }
}

fn handler_for<H: InspectionHost>(event: HookEvent) -> Box<dyn HookHandler<H>> {
    match event {
        HookEvent::SchedulerReady => Box::new(SchedulerReadyHook::default()),
        HookEvent::LibraryFromImage => Box::new(LibraryImageHook),
        HookEvent::LibraryFromFile => Box::new(LibraryFileHook),
    }
}

/// Dispatch table from marker symbol to handler
pub struct HookController<H: InspectionHost> {
    handlers: HashMap<&'static str, (HookEvent, Box<dyn HookHandler<H>>)>,
}

impl<H: InspectionHost> Default for HookController<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H: InspectionHost> HookController<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant the marker breakpoint for `event` and install its handler
    pub fn arm(&mut self, session: &mut Session<H>, event: HookEvent) -> Result<()> {
        self.arm_with(session, event, handler_for(event))
    }

    /// Arm `event` with a caller-supplied handler
    pub fn arm_with(
        &mut self,
        session: &mut Session<H>,
        event: HookEvent,
        handler: Box<dyn HookHandler<H>>,
    ) -> Result<()> {
        if self.handlers.contains_key(event.marker()) {
            return Ok(());
        }
        session.host.insert_breakpoint(event.marker())?;
        self.handlers.insert(event.marker(), (event, handler));
        info!(marker = event.marker(), "hook armed");
        Ok(())
    }

    /// Armed events in a stable order
    pub fn armed(&self) -> Vec<HookEvent> {
        let mut events: Vec<HookEvent> = self.handlers.values().map(|(e, _)| *e).collect();
        events.sort();
        events
    }

    /// Run the handler registered for `marker`
    pub fn dispatch(&mut self, session: &mut Session<H>, marker: &str) -> Result<()> {
        let Some((_, handler)) = self.handlers.get_mut(marker) else {
            warn!(marker, "stop at a breakpoint with no handler");
            return Ok(());
        };
        match handler.on_hit(session)? {
            HookAction::Continue => Ok(()),
            HookAction::ContinueAndArm(events) => {
                for event in events {
                    self.arm(session, event)?;
                }
                Ok(())
            }
        }
    }

    /// Drive the target until it exits, dispatching every marker hit
    ///
    /// Returns the target's exit status.
    pub fn run(&mut self, session: &mut Session<H>) -> Result<i32> {
        if let Err(e) = self.arm(session, HookEvent::SchedulerReady) {
            warn!(error = %e, "scheduler hook not armed; running without hooks");
        }
        loop {
            match session.host.resume()? {
                StopReason::Breakpoint(marker) => {
                    if let Err(e) = self.dispatch(session, &marker) {
                        error!(marker = %marker, error = %e, "hook failed; continuing");
                    }
                }
                StopReason::Exited(code) => {
                    info!(code, "target exited");
                    return Ok(code);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectorConfig;
    use crate::host::memory::MemoryHost;

    const CONF: u64 = 0x1000;
    const FLAG: u64 = 0x2000;

    fn session(hw_mode: bool, with_flag: bool) -> Session<MemoryHost> {
        let config = InspectorConfig::default();
        let mut host = MemoryHost::new();
        host.map_zeroed(CONF, 0x40);
        let mode = if hw_mode { config.enclave.hw_mode_value } else { 0 };
        host.write_i32(CONF + config.enclave.mode, mode).unwrap();
        host.set_register(Register::Argument(0), CONF);
        for event in [
            HookEvent::SchedulerReady,
            HookEvent::LibraryFromImage,
            HookEvent::LibraryFromFile,
        ] {
            host.define_symbol(event.marker(), 0x40_0000 + event as u64 * 0x10);
        }
        if with_flag {
            host.map_zeroed(FLAG, 4);
            host.define_symbol(&config.symbols.debug_symbols_alive, FLAG);
        }
        Session::new(host, config)
    }

    #[test]
    fn test_hw_mode_skips_load_and_arms_library_hooks() {
        let mut session = session(true, true);
        let mut controller = HookController::new();
        controller.arm(&mut session, HookEvent::SchedulerReady).unwrap();
        controller
            .dispatch(&mut session, HookEvent::SchedulerReady.marker())
            .unwrap();

        assert!(session.host.registrations().is_empty());
        assert_eq!(session.host.read_i32(FLAG).unwrap(), 1);
        assert_eq!(
            controller.armed(),
            vec![
                HookEvent::SchedulerReady,
                HookEvent::LibraryFromImage,
                HookEvent::LibraryFromFile
            ]
        );
    }

    #[test]
    fn test_debug_flag_enabled_exactly_once() {
        let mut session = session(true, true);
        let mut hook = SchedulerReadyHook::default();
        assert!(matches!(
            hook.on_hit(&mut session).unwrap(),
            HookAction::ContinueAndArm(_)
        ));
        session.host.write_i32(FLAG, 0).unwrap();
        assert_eq!(hook.on_hit(&mut session).unwrap(), HookAction::Continue);
        assert_eq!(session.host.read_i32(FLAG).unwrap(), 0);
    }

    #[test]
    fn test_without_flag_nothing_more_is_armed() {
        let mut session = session(true, false);
        let mut controller = HookController::new();
        controller.arm(&mut session, HookEvent::SchedulerReady).unwrap();
        controller
            .dispatch(&mut session, HookEvent::SchedulerReady.marker())
            .unwrap();
        assert_eq!(controller.armed(), vec![HookEvent::SchedulerReady]);
    }

    #[test]
    fn test_simulation_mode_with_bad_library_fails() {
        let mut session = session(false, true);
        let path_ptr = 0x3000;
        let path_str = 0x3100;
        session.host.map_zeroed(path_ptr, 8);
        session.host.write_u64(path_ptr, path_str).unwrap();
        session
            .host
            .map(path_str, b"/nonexistent/libsgxlkl.so\0".to_vec());
        let name = session.config.symbols.simulated_library_path.clone();
        session.host.define_symbol(&name, path_ptr);

        let mut hook = SchedulerReadyHook::default();
        let err = hook.on_hit(&mut session).unwrap_err();
        assert!(matches!(err, InspectError::MalformedObject { .. }));
        assert!(session.host.registrations().is_empty());
    }

    #[test]
    fn test_run_survives_failing_hook_and_returns_exit_code() {
        let mut session = session(false, false);
        session
            .host
            .push_stop(StopReason::Breakpoint(HookEvent::SchedulerReady.marker().to_string()));
        session.host.push_stop(StopReason::Exited(3));
        let mut controller = HookController::new();
        // simulated library path is unresolved, so the handler fails
        assert_eq!(controller.run(&mut session).unwrap(), 3);
    }

    #[test]
    fn test_run_without_markers_waits_for_exit() {
        let mut session = Session::new(MemoryHost::new(), InspectorConfig::default());
        session.host.push_stop(StopReason::Exited(0));
        let mut controller = HookController::new();
        assert_eq!(controller.run(&mut session).unwrap(), 0);
        assert!(controller.armed().is_empty());
    }

    #[test]
    fn test_negative_image_size_rejected() {
        let mut session = session(true, false);
        session.host.set_register(Register::Argument(2), (-1i64) as u64);
        let err = LibraryImageHook.on_hit(&mut session).unwrap_err();
        assert!(matches!(err, InspectError::MalformedObject { .. }));
    }

    #[test]
    fn test_oversized_image_rejected_before_reading() {
        let mut session = session(true, false);
        session.config.limits.max_read_size = 0x1000;
        session.host.set_register(Register::Argument(1), 0x5000);
        session.host.set_register(Register::Argument(2), 1 << 40);
        let err = LibraryImageHook.on_hit(&mut session).unwrap_err();
        assert!(matches!(err, InspectError::MalformedObject { .. }));
        assert_eq!(session.scratch_files().count(), 0);
    }

    #[test]
    fn test_image_hook_keeps_scratch_file_until_session_end() {
        let mut session = session(true, false);
        session.host.map(0x5000, b"not an elf image".to_vec());
        session.host.map_zeroed(0x6000, 8);
        session.host.set_register(Register::Argument(0), 0x6000);
        session.host.set_register(Register::Argument(1), 0x5000);
        session.host.set_register(Register::Argument(2), 16);

        assert!(LibraryImageHook.on_hit(&mut session).is_err());
        let scratch: Vec<_> = session.scratch_files().map(|p| p.to_path_buf()).collect();
        assert_eq!(scratch.len(), 1);
        assert!(scratch[0].exists());
        assert_eq!(std::fs::read(&scratch[0]).unwrap(), b"not an elf image");
        drop(session);
        assert!(!scratch[0].exists());
    }
}
