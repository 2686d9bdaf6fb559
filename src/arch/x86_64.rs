//! x86_64 relocation backend.
//!
//! Byte-addend model: every relocation site carries its addend in place at
//! the site's width, and values are either absolute addresses or
//! displacements relative to the end of the referencing instruction.
//! Offset-table references and out-of-range branches are redirected through
//! per-symbol indirection slots (an address cell plus a jump island)
//! allocated in one block per module.

use anyhow::{anyhow, bail, ensure, Result};
use object::macho;

use super::Architecture;
use crate::loader::ObjectModule;
use crate::mmap::{MemoryMap, Protection};
use crate::symtab::GlobalSymbols;

/// Per-symbol slot layout: an 8-byte cell holding the target address,
/// followed by a `jmp *-14(%rip)` that branches through it.
const EXTRA_SLOT_SIZE: u64 = 16;
const JUMP_ISLAND: [u8; 6] = [0xff, 0x25, 0xf2, 0xff, 0xff, 0xff];

pub struct X86_64;

impl Architecture for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn prepare(&self, oc: &mut ObjectModule, _globals: &GlobalSymbols) -> Result<()> {
        ensure_extras(oc)
    }

    fn relocate_section(
        &self,
        oc: &mut ObjectModule,
        globals: &GlobalSymbols,
        sec_idx: usize,
    ) -> Result<()> {
        relocate_section_x86_64(oc, globals, sec_idx)
    }
}

fn ensure_extras(oc: &mut ObjectModule) -> Result<()> {
    if oc.extras.is_some() || oc.symbols.is_empty() {
        return Ok(());
    }
    let size = oc.symbols.len() as u64 * EXTRA_SLOT_SIZE;
    let map = MemoryMap::anonymous(size, Protection::ReadWrite)
        .map_err(|e| anyhow!("{}: jump island allocation failed: {e}", oc.name))?;
    tracing::debug!(
        module = %oc.name,
        base = %format_args!("{:#x}", map.start()),
        slots = oc.symbols.len(),
        "allocated jump island block"
    );
    oc.proddable.push((map.start(), size));
    oc.extras = Some(map);
    Ok(())
}

struct ExtraSlot {
    /// Address of the 8-byte cell holding the target.
    cell: u64,
    /// Address of the indirect jump through the cell.
    island: u64,
}

/// Returns the indirection slot for a symbol, pointing it at `target`. The
/// slot is written on first use per target and reused afterwards.
fn symbol_extra(oc: &mut ObjectModule, index: usize, target: u64) -> Result<ExtraSlot> {
    ensure_extras(oc)?;
    let base = oc
        .extras
        .as_ref()
        .map(|m| m.start())
        .ok_or_else(|| anyhow!("{}: no symbol table, cannot build jump islands", oc.name))?;
    ensure!(
        index < oc.symbols.len(),
        "{}: jump island index {} out of range",
        oc.name,
        index
    );
    let cell = base + index as u64 * EXTRA_SLOT_SIZE;
    let island = cell + 8;
    if oc.peek(cell, 8)? != target {
        oc.poke(cell, 8, target)?;
        for (i, byte) in JUMP_ISLAND.iter().enumerate() {
            oc.poke(island + i as u64, 1, u64::from(*byte))?;
        }
    }
    Ok(ExtraSlot { cell, island })
}

fn relocate_section_x86_64(
    oc: &mut ObjectModule,
    globals: &GlobalSymbols,
    sec_idx: usize,
) -> Result<()> {
    if oc.sections[sec_idx].size == 0 {
        return Ok(());
    }
    // Pointer-table sections were already filled by the import resolver.
    if crate::loader::POINTER_SECTIONS[..4]
        .contains(&oc.info.sections[sec_idx].sectname.as_str())
    {
        return Ok(());
    }

    let meta_addr = oc.info.sections[sec_idx].addr;
    let sec_addr = oc.sections[sec_idx].addr;
    let relocs = oc.section_relocs(sec_idx)?;
    tracing::trace!(
        module = %oc.name,
        section = %oc.info.sections[sec_idx].sectname,
        nreloc = relocs.len(),
        "relocating section"
    );

    for reloc in &relocs {
        let mut ty = reloc.r_type as u8;
        let site = sec_addr + u64::from(reloc.r_address);
        let width = 1u64 << reloc.r_length;
        let mut thing = oc.peek(site, width)?;

        // SIGNED_N sites sit before a trailing immediate of N bytes; the
        // instruction end the displacement is relative to moves accordingly.
        let next_instr_adj: u64 = match ty {
            macho::X86_64_RELOC_SIGNED_1 => 1,
            macho::X86_64_RELOC_SIGNED_2 => 2,
            macho::X86_64_RELOC_SIGNED_4 => 4,
            _ => 0,
        };
        let base_value = site + width + next_instr_adj;
        let mut value: u64 = 0;

        if ty == macho::X86_64_RELOC_GOT || ty == macho::X86_64_RELOC_GOT_LOAD {
            ensure!(
                reloc.r_extern,
                "{}: offset-table relocation without a symbol",
                oc.name
            );
            let sym = oc.symbol(reloc.r_symbolnum)?;
            let addr = if sym.is_external() {
                globals.lookup(&sym.name).ok_or_else(|| {
                    anyhow!(
                        "lookup failed in relocation (offset table)\n{}: unknown symbol `{}'",
                        oc.name,
                        sym.name
                    )
                })?
            } else if sym.is_section_defined() {
                sym.addr.ok_or_else(|| {
                    anyhow!(
                        "{}: address of internal symbol {} was not resolved",
                        oc.name,
                        sym.name
                    )
                })?
            } else {
                bail!(
                    "{}: {} is neither exported nor defined in a section",
                    oc.name,
                    sym.name
                );
            };
            // The site becomes a PC-relative load of the cell holding the
            // absolute address.
            value = symbol_extra(oc, reloc.r_symbolnum as usize, addr)?.cell;
            ty = macho::X86_64_RELOC_SIGNED;
        } else if reloc.r_extern {
            let sym = oc.symbol(reloc.r_symbolnum)?;
            value = if sym.is_section_defined() {
                sym.addr.ok_or_else(|| {
                    anyhow!(
                        "{}: address of symbol {} was not resolved",
                        oc.name,
                        sym.name
                    )
                })?
            } else {
                globals.lookup(&sym.name).ok_or_else(|| {
                    anyhow!(
                        "lookup failed in relocation\n{}: unknown symbol `{}'",
                        oc.name,
                        sym.name
                    )
                })?
            };
        } else {
            // Internal relocation: r_symbolnum is a 1-based section ordinal,
            // and the in-place value is relative to the image, so it must be
            // re-derived against the section's new home.
            ensure!(
                reloc.r_symbolnum >= 1,
                "{}: internal relocation with section ordinal 0",
                oc.name
            );
            let target_idx = (reloc.r_symbolnum - 1) as usize;
            ensure!(
                target_idx < oc.sections.len(),
                "{}: relocation against unknown section {}",
                oc.name,
                reloc.r_symbolnum
            );
            let target_meta_addr = oc.info.sections[target_idx].addr;
            let target_start = oc.sections[target_idx].addr;
            match ty {
                macho::X86_64_RELOC_UNSIGNED => {
                    ensure!(
                        thing >= target_meta_addr,
                        "{}: unsigned displacement {:#x} before section {}",
                        oc.name,
                        thing,
                        oc.info.sections[target_idx].sectname
                    );
                    thing = target_start + (thing - target_meta_addr);
                    value = 0;
                }
                macho::X86_64_RELOC_SIGNED
                | macho::X86_64_RELOC_SIGNED_1
                | macho::X86_64_RELOC_SIGNED_2
                | macho::X86_64_RELOC_SIGNED_4 => {
                    let base_offset = u64::from(reloc.r_address) + width + next_instr_adj;
                    let image_loc = meta_addr.wrapping_add(base_offset).wrapping_add(thing);
                    ensure!(
                        image_loc >= target_meta_addr,
                        "{}: target location {:#x} before section {}",
                        oc.name,
                        image_loc,
                        oc.info.sections[target_idx].sectname
                    );
                    thing = (target_start + (image_loc - target_meta_addr))
                        .wrapping_sub(sec_addr + base_offset);
                    // Cancels against base_value when the displacement is
                    // applied below.
                    value = base_value;
                }
                _ => bail!(
                    "{}: unexpected internal relocation type {}",
                    oc.name,
                    ty
                ),
            }
        }

        if ty == macho::X86_64_RELOC_BRANCH {
            let mut disp = value.wrapping_sub(base_value) as i64;
            if i64::from(disp as i32) != disp {
                ensure!(
                    reloc.r_extern,
                    "{}: out-of-range branch without a symbol",
                    oc.name
                );
                value = symbol_extra(oc, reloc.r_symbolnum as usize, value)?.island;
                disp = value.wrapping_sub(base_value) as i64;
                ensure!(
                    i64::from(disp as i32) == disp,
                    "{}: branch displacement {:#x} still out of range after jump island",
                    oc.name,
                    disp
                );
            }
            ty = macho::X86_64_RELOC_SIGNED;
        }

        match ty {
            macho::X86_64_RELOC_UNSIGNED => {
                ensure!(!reloc.r_pcrel, "{}: pc-relative UNSIGNED relocation", oc.name);
                thing = thing.wrapping_add(value);
            }
            macho::X86_64_RELOC_SIGNED
            | macho::X86_64_RELOC_SIGNED_1
            | macho::X86_64_RELOC_SIGNED_2
            | macho::X86_64_RELOC_SIGNED_4 => {
                ensure!(reloc.r_pcrel, "{}: absolute SIGNED relocation", oc.name);
                thing = thing.wrapping_add(value.wrapping_sub(base_value));
            }
            macho::X86_64_RELOC_SUBTRACTOR => {
                ensure!(!reloc.r_pcrel, "{}: pc-relative SUBTRACTOR relocation", oc.name);
                thing = thing.wrapping_sub(value);
            }
            other => bail!("{}: unknown relocation type {}", oc.name, other),
        }

        oc.poke(site, width, thing)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_island_targets_its_cell() {
        // jmp *disp32(%rip) with disp32 = -14: rip points 6 bytes past the
        // island start, which itself sits 8 bytes past the cell.
        assert_eq!(JUMP_ISLAND[0], 0xff);
        assert_eq!(JUMP_ISLAND[1], 0x25);
        let disp = i32::from_le_bytes(JUMP_ISLAND[2..6].try_into().unwrap());
        assert_eq!(disp, -14);
        assert_eq!(EXTRA_SLOT_SIZE, 8 + JUMP_ISLAND.len() as u64 + 2);
    }
}
