//! Symbol loading for objects relocated at runtime
//!
//! Reads an object's section table, relocates every allocated section by the
//! runtime base and hands the complete registration to the host in a single
//! call. Nothing reaches the host until the whole table has been validated,
//! so a malformed object never leaves a partial registration behind.

use crate::error::{InspectError, Result};
use crate::host::InspectionHost;
use object::{Object, ObjectSection, SectionKind};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the section every registration is anchored on
pub const ANCHOR_SECTION: &str = ".text";

/// One row of an object's section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSection {
    pub index: usize,
    pub name: String,
    pub kind: SectionKind,
    /// Address as declared in the object file
    pub address: u64,
}

/// Parsed section table of an object file
#[derive(Debug, Clone)]
pub struct SectionTable {
    pub path: PathBuf,
    pub sections: Vec<SymbolSection>,
}

impl SectionTable {
    /// Memory-map and parse the section table of `path`
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| InspectError::malformed(path, e))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| InspectError::malformed(path, e))?;
        Self::parse(path, &mmap)
    }

    /// Parse the section table from object bytes
    pub fn parse(path: &Path, data: &[u8]) -> Result<Self> {
        let object = object::File::parse(data).map_err(|e| InspectError::malformed(path, e))?;
        Self::from_object(path, &object)
    }

    pub fn from_object(path: &Path, object: &object::File<'_>) -> Result<Self> {
        let mut sections = Vec::new();
        for section in object.sections() {
            let index = section.index().0;
            // The null section carries no data
            if index == 0 {
                continue;
            }
            let name = section
                .name()
                .map_err(|e| InspectError::malformed(path, format!("section {}: {}", index, e)))?;
            sections.push(SymbolSection {
                index,
                name: name.to_string(),
                kind: section.kind(),
                address: section.address(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            sections,
        })
    }

    /// The `.text` section every other section is placed relative to
    pub fn anchor(&self) -> Option<&SymbolSection> {
        self.sections.iter().find(|s| s.name == ANCHOR_SECTION)
    }
}

/// A section placed at its runtime address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedSection {
    pub name: String,
    pub address: u64,
}

/// Everything the host needs to resolve symbols of a relocated object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFileRegistration {
    pub path: PathBuf,
    pub base: u64,
    /// Runtime address of the anchor section
    pub text_address: u64,
    /// Runtime addresses of every other allocated section
    pub sections: Vec<RelocatedSection>,
}

impl SymbolFileRegistration {
    /// Runtime address of a named section, the anchor included
    pub fn section_address(&self, name: &str) -> Option<u64> {
        if name == ANCHOR_SECTION {
            return Some(self.text_address);
        }
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address)
    }
}

impl fmt::Display for SymbolFileRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 0x{:08x}", self.path.display(), self.text_address)?;
        for section in &self.sections {
            write!(f, " -s {} 0x{:x}", section.name, section.address)?;
        }
        Ok(())
    }
}

/// Runtime address of a section declared at `declared`
pub fn relocate(base: u64, declared: u64) -> u64 {
    base.wrapping_add(declared)
}

/// Compute the full registration for `table` loaded at `base`
pub fn plan_registration(table: &SectionTable, base: u64) -> Result<SymbolFileRegistration> {
    let anchor = table
        .anchor()
        .ok_or_else(|| InspectError::malformed(&table.path, "no .text section"))?;

    let sections = table
        .sections
        .iter()
        .filter(|s| s.name != ANCHOR_SECTION && s.address != 0)
        .map(|s| RelocatedSection {
            name: s.name.clone(),
            address: relocate(base, s.address),
        })
        .collect();

    Ok(SymbolFileRegistration {
        path: table.path.clone(),
        base,
        text_address: relocate(base, anchor.address),
        sections,
    })
}

/// Load the symbols of `path` into the host at runtime base `base`
pub fn load_symbol_file<H: InspectionHost + ?Sized>(
    host: &mut H,
    path: &Path,
    base: u64,
) -> Result<SymbolFileRegistration> {
    let table = SectionTable::read(path)?;
    debug!(
        path = %path.display(),
        sections = table.sections.len(),
        "parsed section table"
    );
    let registration = plan_registration(&table, base)?;
    host.add_symbol_file(&registration)?;
    info!("add-symbol-file {}", registration);
    Ok(registration)
}
