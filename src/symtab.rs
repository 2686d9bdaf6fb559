//! Process-wide symbol table.
//!
//! Every loaded module publishes its externally visible definitions here and
//! resolves its imports against it. Names that no loaded module defines fall
//! back to the host process image via `dlsym`, so loaded code can call libc
//! and the host runtime directly.
//!
//! The table is externally synchronized: callers that load modules from
//! multiple threads must serialize access themselves.

use std::collections::HashMap;
use std::ffi::CString;

/// A published symbol definition.
#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub addr: u64,
    pub weak: bool,
    /// Display name of the module that published the definition.
    pub owner: String,
}

/// The global name -> address map shared by all loaded modules.
#[derive(Debug, Default)]
pub struct GlobalSymbols {
    map: HashMap<String, SymbolDef>,
}

impl GlobalSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a name to an address, consulting loaded modules first and the
    /// host process image second.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        if let Some(def) = self.map.get(name) {
            return Some(def.addr);
        }
        system_lookup(name)
    }

    /// Resolves a name against loaded modules only.
    pub fn lookup_loaded(&self, name: &str) -> Option<u64> {
        self.map.get(name).map(|def| def.addr)
    }

    /// Publishes a definition. A weak definition never displaces an existing
    /// one; a strong definition wins over anything already present.
    pub fn insert(&mut self, owner: &str, name: &str, addr: u64, weak: bool) {
        if weak && self.map.contains_key(name) {
            tracing::debug!(name, owner, "weak definition yields to existing symbol");
            return;
        }
        self.map.insert(
            name.to_string(),
            SymbolDef {
                addr,
                weak,
                owner: owner.to_string(),
            },
        );
    }

    /// Withdraws every definition a module published, for unload.
    pub fn retract(&mut self, owner: &str) {
        self.map.retain(|_, def| def.owner != owner);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Asks the platform loader for a symbol defined in the process image.
fn system_lookup(name: &str) -> Option<u64> {
    let cname = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as u64)
    }
}
