//! Runtime symbol loading, registration and cached resolution

pub mod cache;
pub mod loader;
pub mod registry;

pub use cache::SymbolCache;
pub use loader::{load_symbol_file, SymbolFileRegistration};
