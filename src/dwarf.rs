//! DWARF debug info for source correlation of backtrace frames
//!
//! Uses addr2line over gimli sections loaded from a memory-mapped object.
//! Addresses passed to [`DwarfContext::lookup`] are link-time addresses; the
//! symbol registry subtracts the load bias first.

use anyhow::{Context, Result};
use object::{Object, ObjectSection};
use std::fmt;
use std::fs::File;
use std::path::Path;

/// Source location information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file path
    pub file: String,
    /// Line number
    pub line: u32,
    /// Function name (if available)
    pub function: Option<String>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// DWARF debug info context for one object file
pub struct DwarfContext {
    context: addr2line::Context<gimli::EndianRcSlice<gimli::RunTimeEndian>>,
}

impl fmt::Debug for DwarfContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DwarfContext").finish_non_exhaustive()
    }
}

impl DwarfContext {
    /// Load DWARF debug info from an ELF object
    pub fn load(binary_path: &Path) -> Result<Self> {
        let file = File::open(binary_path)
            .with_context(|| format!("Failed to open binary: {}", binary_path.display()))?;

        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map binary")?;

        let object = object::File::parse(&*mmap).context("Failed to parse ELF binary")?;

        Self::from_object(&object)
    }

    /// Build a context from an already parsed object
    pub fn from_object(object: &object::File<'_>) -> Result<Self> {
        if object.section_by_name(".debug_info").is_none() {
            anyhow::bail!("Object has no .debug_info section");
        }

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section =
            |id: gimli::SectionId| -> Result<gimli::EndianRcSlice<gimli::RunTimeEndian>> {
                let data = object
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[]));
                let bytes: std::rc::Rc<[u8]> = std::rc::Rc::from(data.into_owned());
                Ok(gimli::EndianRcSlice::new(bytes, endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section).context("Failed to load DWARF sections")?;

        let context =
            addr2line::Context::from_dwarf(dwarf).context("Failed to create DWARF context")?;

        Ok(Self { context })
    }

    /// Look up the source location for a link-time address
    ///
    /// Return addresses point just past the call instruction, so the byte
    /// before is tried too.
    pub fn lookup(&self, addr: u64) -> Option<SourceLocation> {
        for probe in [addr, addr.saturating_sub(1)] {
            let Ok(Some(location)) = self.context.find_location(probe) else {
                continue;
            };
            let (Some(file), Some(line)) = (location.file, location.line) else {
                continue;
            };
            if line == 0 {
                continue;
            }

            let function = self
                .context
                .find_frames(probe)
                .skip_all_loads()
                .ok()
                .and_then(|mut frames| frames.next().ok().flatten())
                .and_then(|frame| frame.function)
                .and_then(|func| func.raw_name().ok().map(|name| name.to_string()));

            return Some(SourceLocation {
                file: file.to_string(),
                line,
                function,
            });
        }
        None
    }
}
