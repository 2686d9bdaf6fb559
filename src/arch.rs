//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates all
//! architecture-specific relocation logic. The strategy is selected once per
//! module from the image's CPU type; the rest of the pipeline is identical
//! across architectures.

use anyhow::{bail, Result};
use object::macho;

use crate::loader::ObjectModule;
use crate::symtab::GlobalSymbols;

pub mod aarch64;
pub mod x86_64;

/// A relocation strategy for one instruction-set family.
pub trait Architecture {
    fn name(&self) -> &'static str;

    /// Allocates the per-module side structures this architecture needs
    /// before any relocation can be applied (offset tables, jump-island
    /// blocks).
    fn prepare(&self, oc: &mut ObjectModule, globals: &GlobalSymbols) -> Result<()>;

    /// Rewrites every relocation site of one section using the resolved
    /// symbol addresses.
    fn relocate_section(
        &self,
        oc: &mut ObjectModule,
        globals: &GlobalSymbols,
        sec_idx: usize,
    ) -> Result<()>;
}

/// Picks the relocation strategy for a module from its header's CPU type.
pub fn for_cputype(cputype: u32) -> Result<&'static dyn Architecture> {
    match cputype {
        macho::CPU_TYPE_X86_64 => Ok(&x86_64::X86_64),
        macho::CPU_TYPE_ARM64 => Ok(&aarch64::AArch64),
        _ => bail!("unsupported cpu type {cputype:#x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert_eq!(for_cputype(macho::CPU_TYPE_X86_64).unwrap().name(), "x86_64");
        assert_eq!(for_cputype(macho::CPU_TYPE_ARM64).unwrap().name(), "aarch64");
        assert!(for_cputype(macho::CPU_TYPE_ARM).is_err());
    }
}
