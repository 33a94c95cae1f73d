//! Cached symbol resolution
//!
//! Resolving a name through the host can mean a registry scan; commands look
//! up the same handful of scheduler globals over and over. Entries stay valid
//! until the target's symbol set changes, at which point the owner must call
//! [`SymbolCache::invalidate`] (the hook controller and `load-symbols` do).

use crate::error::{InspectError, Result};
use crate::host::InspectionHost;
use std::collections::HashMap;
use tracing::trace;

/// Symbol addresses keyed by name, cleared on every reload
#[derive(Debug, Default)]
pub struct SymbolCache {
    entries: HashMap<String, u64>,
    generation: u64,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name`, consulting the host only on a miss
    pub fn resolve<H: InspectionHost + ?Sized>(&mut self, host: &H, name: &str) -> Result<u64> {
        if let Some(&addr) = self.entries.get(name) {
            return Ok(addr);
        }
        let addr = host.lookup_symbol(name)?;
        trace!("symbol {} cached at 0x{:x}", name, addr);
        self.entries.insert(name.to_string(), addr);
        Ok(addr)
    }

    /// Like [`resolve`](Self::resolve), but an unknown symbol is `None`
    pub fn probe<H: InspectionHost + ?Sized>(
        &mut self,
        host: &H,
        name: &str,
    ) -> Result<Option<u64>> {
        match self.resolve(host, name) {
            Ok(addr) => Ok(Some(addr)),
            Err(InspectError::UnresolvedSymbol(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop every entry; called whenever the target's symbols change
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }

    /// Number of invalidations so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    #[test]
    fn test_hit_survives_host_change_until_invalidated() {
        let mut host = MemoryHost::new();
        host.define_symbol("__scheduler_queue", 0x1000);
        let mut cache = SymbolCache::new();
        assert_eq!(cache.resolve(&host, "__scheduler_queue").unwrap(), 0x1000);

        host.define_symbol("__scheduler_queue", 0x2000);
        assert_eq!(cache.resolve(&host, "__scheduler_queue").unwrap(), 0x1000);

        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.resolve(&host, "__scheduler_queue").unwrap(), 0x2000);
    }

    #[test]
    fn test_unresolved_is_not_cached() {
        let mut host = MemoryHost::new();
        let mut cache = SymbolCache::new();
        assert!(matches!(
            cache.resolve(&host, "futex_queues"),
            Err(InspectError::UnresolvedSymbol(_))
        ));
        host.define_symbol("futex_queues", 0x3000);
        assert_eq!(cache.resolve(&host, "futex_queues").unwrap(), 0x3000);
    }

    #[test]
    fn test_probe_maps_unresolved_to_none() {
        let host = MemoryHost::new();
        let mut cache = SymbolCache::new();
        assert_eq!(cache.probe(&host, "__gdb_load_debug_symbols_alive").unwrap(), None);
        assert_eq!(cache.len(), 0);
    }
}
