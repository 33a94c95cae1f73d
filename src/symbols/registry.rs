//! Symbols of every object registered with a live host
//!
//! Each registered object keeps its symbol table rebased to runtime
//! addresses and, when the object carries DWARF, a context for source
//! correlation of backtrace frames.

use super::loader::{SymbolFileRegistration, ANCHOR_SECTION};
use crate::dwarf::{DwarfContext, SourceLocation};
use crate::error::{InspectError, Result};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
struct SymbolEntry {
    name: String,
    size: u64,
}

/// One object registered at its runtime addresses
#[derive(Debug)]
pub struct LoadedObject {
    pub path: PathBuf,
    /// Runtime minus declared address of the anchor section
    pub text_bias: u64,
    by_name: HashMap<String, u64>,
    by_addr: BTreeMap<u64, SymbolEntry>,
    dwarf: Option<DwarfContext>,
}

impl LoadedObject {
    /// Parse `registration.path` and rebase its symbols
    pub fn load(registration: &SymbolFileRegistration) -> Result<Self> {
        let path = &registration.path;
        let file = File::open(path).map_err(|e| InspectError::malformed(path, e))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| InspectError::malformed(path, e))?;
        let object = object::File::parse(&*mmap).map_err(|e| InspectError::malformed(path, e))?;

        // Bias per section index; sections that were not attached stay absent
        let mut biases = HashMap::new();
        let mut text_bias = registration.base;
        for section in object.sections() {
            let Ok(name) = section.name() else { continue };
            if let Some(runtime) = registration.section_address(name) {
                let bias = runtime.wrapping_sub(section.address());
                if name == ANCHOR_SECTION {
                    text_bias = bias;
                }
                biases.insert(section.index(), bias);
            }
        }

        let mut by_name = HashMap::new();
        let mut by_addr = BTreeMap::new();
        for symbol in object.symbols() {
            if !matches!(symbol.kind(), SymbolKind::Text | SymbolKind::Data) {
                continue;
            }
            let (Ok(name), Some(index)) = (symbol.name(), symbol.section_index()) else {
                continue;
            };
            let Some(bias) = biases.get(&index) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let addr = symbol.address().wrapping_add(*bias);
            by_name.entry(name.to_string()).or_insert(addr);
            by_addr.insert(
                addr,
                SymbolEntry {
                    name: name.to_string(),
                    size: symbol.size(),
                },
            );
        }

        let dwarf = match DwarfContext::from_object(&object) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no DWARF for object");
                None
            }
        };

        Ok(Self {
            path: path.clone(),
            text_bias,
            by_name,
            by_addr,
            dwarf,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Symbol containing `ip`, with its start address
    fn containing(&self, ip: u64) -> Option<(u64, &SymbolEntry)> {
        let (&start, entry) = self.by_addr.range(..=ip).next_back()?;
        let within = entry.size == 0 || ip < start.saturating_add(entry.size);
        within.then_some((start, entry))
    }

    pub fn symbol_count(&self) -> usize {
        self.by_name.len()
    }
}

/// All objects registered with a host, in registration order
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    objects: Vec<LoadedObject>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object, replacing an earlier registration of the same path
    pub fn register(&mut self, registration: &SymbolFileRegistration) -> Result<&LoadedObject> {
        let loaded = LoadedObject::load(registration)?;
        debug!(
            path = %loaded.path.display(),
            symbols = loaded.symbol_count(),
            "registered object"
        );
        self.objects.retain(|o| o.path != loaded.path);
        self.objects.push(loaded);
        Ok(&self.objects[self.objects.len() - 1])
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.objects.iter().find_map(|o| o.lookup(name))
    }

    /// Function name and source location for a runtime address
    pub fn symbolize(&self, ip: u64) -> (Option<String>, Option<SourceLocation>) {
        let best = self
            .objects
            .iter()
            .filter_map(|o| o.containing(ip).map(|(start, entry)| (o, start, entry)))
            .max_by_key(|(_, start, _)| *start);

        let Some((object, _, entry)) = best else {
            return (None, None);
        };

        let location = object
            .dwarf
            .as_ref()
            .and_then(|d| d.lookup(ip.wrapping_sub(object.text_bias)));
        let function = location
            .as_ref()
            .and_then(|l| l.function.clone())
            .or_else(|| Some(entry.name.clone()));
        (function, location)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
