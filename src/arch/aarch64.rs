//! aarch64 relocation backend.
//!
//! Instruction-bit-field model: addends and values live inside the
//! instruction words, split across the architecture's immediate fields, so
//! every relocation both decodes the existing addend and re-encodes the
//! computed value. External and cross-section references are addressed
//! indirectly through a per-module offset table, and branches that cannot
//! reach their target get a trampoline in the owning section's scratch
//! space.

use anyhow::{anyhow, bail, ensure, Context, Result};
use object::macho;

use super::Architecture;
use crate::image::{ModuleSymbol, RelocEntry};
use crate::layout::Stub;
use crate::loader::{ObjectModule, STUB_SLOT_SIZE};
use crate::mmap::{MemoryMap, Protection};
use crate::symtab::GlobalSymbols;

// ldr x16, #-8 then br x16; the trampoline's target word sits directly
// before the load.
const STUB_LDR_X16: u32 = 0x58ff_ffd0;
const STUB_BR_X16: u32 = 0xd61f_0200;

pub struct AArch64;

impl Architecture for AArch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn prepare(&self, oc: &mut ObjectModule, globals: &GlobalSymbols) -> Result<()> {
        build_offset_table(oc)?;
        fill_offset_table(oc, globals)
    }

    fn relocate_section(
        &self,
        oc: &mut ObjectModule,
        globals: &GlobalSymbols,
        sec_idx: usize,
    ) -> Result<()> {
        relocate_section_aarch64(oc, globals, sec_idx)
    }
}

/// Sign-extends the low `bits` of `val`.
pub(crate) fn sign_extend(val: u64, bits: u32) -> i64 {
    debug_assert!((1..=64).contains(&bits));
    ((val << (64 - bits)) as i64) >> (64 - bits)
}

/// True iff `value` is representable as a two's-complement integer of
/// exactly `bits` bits: every bit from the sign bit upward must agree.
pub(crate) fn fits_bits(bits: u32, value: i64) -> bool {
    if bits >= 64 {
        return true;
    }
    let high = value >> (bits - 1);
    high == 0 || high == -1
}

fn is_load_store(word: u32) -> bool {
    word & 0x3b00_0000 == 0x3900_0000
}

fn is_vector_op(word: u32) -> bool {
    word & 0x0480_0000 == 0x0480_0000
}

/// Element-size shift a load/store instruction applies to its immediate
/// offset, read out of the instruction word itself.
fn implied_shift(word: u32) -> u32 {
    if !is_load_store(word) {
        return 0;
    }
    let size = (word >> 30) & 0x3;
    if size == 0 && is_vector_op(word) {
        4
    } else {
        size
    }
}

/// Branch immediate: 26 bits stored pre-shifted by 2, since instructions
/// are 4-byte aligned; sign-extends from 28 bits.
pub(crate) fn decode_branch26(word: u32) -> i64 {
    sign_extend(u64::from(word & 0x03ff_ffff) << 2, 28)
}

pub(crate) fn encode_branch26(word: u32, value: i64) -> Result<u32> {
    ensure!(
        fits_bits(26, value >> 2),
        "branch displacement {value:#x} out of range"
    );
    Ok((word & 0xfc00_0000) | ((value >> 2) as u32 & 0x03ff_ffff))
}

/// Page immediate: a 21-bit count of 4 KiB pages split between immlo
/// (bits 29-30) and immhi (bits 5-23); the decoded value is a byte
/// distance, sign-extended from 33 bits.
pub(crate) fn decode_page21(word: u32) -> i64 {
    let immlo = u64::from((word >> 29) & 0x3);
    let immhi = u64::from((word >> 5) & 0x7_ffff);
    sign_extend((immlo << 12) | (immhi << 14), 33)
}

pub(crate) fn encode_page21(word: u32, value: i64) -> Result<u32> {
    ensure!(
        fits_bits(21, value >> 12),
        "page displacement {value:#x} out of range"
    );
    Ok((word & 0x9f00_001f)
        | (((value << 17) & 0x6000_0000) as u32)
        | (((value >> 9) & 0x00ff_ffe0) as u32))
}

/// Page offset: 12 bits at bits 10-21, scaled down by the instruction's
/// implied element size before encoding.
pub(crate) fn decode_pageoff12(word: u32) -> i64 {
    let imm = i64::from((word >> 10) & 0xfff);
    imm << implied_shift(word)
}

pub(crate) fn encode_pageoff12(word: u32, value: i64) -> Result<u32> {
    ensure!(
        fits_bits(12, value),
        "page offset {value:#x} out of range"
    );
    let shift = implied_shift(word);
    Ok((word & 0xffc0_03ff) | ((((value >> shift) << 10) & 0x003f_fc00) as u32))
}

/// A symbol needs an offset-table slot when it is external and either
/// undefined here or defined in some section: sections may land anywhere in
/// the address space, so even same-module references go through the table.
fn needs_got_slot(sym: &ModuleSymbol) -> bool {
    sym.is_external() && (sym.is_undefined() || sym.n_sect != macho::NO_SECT)
}

fn is_got_load(reloc: &RelocEntry) -> bool {
    reloc.r_type as u8 == macho::ARM64_RELOC_GOT_LOAD_PAGE21
        || reloc.r_type as u8 == macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12
}

fn build_offset_table(oc: &mut ObjectModule) -> Result<()> {
    if oc.got.is_some() {
        return Ok(());
    }
    let slots = oc.symbols.iter().filter(|s| needs_got_slot(s)).count() as u64;
    if slots == 0 {
        return Ok(());
    }
    let map = MemoryMap::anonymous(slots * 8, Protection::ReadWrite)
        .map_err(|e| anyhow!("{}: offset table allocation failed: {e}", oc.name))?;
    tracing::debug!(
        module = %oc.name,
        base = %format_args!("{:#x}", map.start()),
        slots,
        "allocated offset table"
    );
    let mut slot = map.start();
    for sym in oc.symbols.iter_mut() {
        if needs_got_slot(sym) {
            sym.got_addr = Some(slot);
            slot += 8;
        }
    }
    oc.proddable.push((map.start(), slots * 8));
    oc.got = Some(map);
    Ok(())
}

fn fill_offset_table(oc: &mut ObjectModule, globals: &GlobalSymbols) -> Result<()> {
    for i in 0..oc.symbols.len() {
        let Some(slot) = oc.symbols[i].got_addr else {
            continue;
        };
        if oc.symbols[i].addr.is_none() {
            let name = oc.symbols[i].name.clone();
            let addr = globals.lookup(&name).ok_or_else(|| {
                anyhow!(
                    "lookup failed in offset table\n{}: unknown symbol `{name}'",
                    oc.name
                )
            })?;
            oc.symbols[i].addr = Some(addr);
        }
        let addr = oc.symbols[i].addr.unwrap_or_default();
        oc.poke(slot, 8, addr)?;
    }
    Ok(())
}

/// Returns the trampoline for `target`, creating one in the section's
/// scratch space on first use. Identity is the target address: two branches
/// to the same place share a trampoline.
fn find_or_make_stub(oc: &mut ObjectModule, sec_idx: usize, target: u64) -> Result<u64> {
    if let Some(stub) = oc.sections[sec_idx].stubs.iter().find(|s| s.target == target) {
        return Ok(stub.addr);
    }
    let (stub_base, stub_size, used) = {
        let sec = &oc.sections[sec_idx];
        (
            sec.stub_base,
            sec.stub_size,
            sec.stubs.len() as u64 * STUB_SLOT_SIZE,
        )
    };
    ensure!(
        used + STUB_SLOT_SIZE <= stub_size,
        "{}: trampoline space exhausted in section {}",
        oc.name,
        oc.info.sections[sec_idx].sectname
    );
    let addr = stub_base + used + 8;
    oc.poke(addr - 8, 8, target)?;
    oc.poke(addr, 4, u64::from(STUB_LDR_X16))?;
    oc.poke(addr + 4, 4, u64::from(STUB_BR_X16))?;
    oc.sections[sec_idx].stubs.push(Stub { target, addr });
    tracing::debug!(
        module = %oc.name,
        target = %format_args!("{target:#x}"),
        stub = %format_args!("{addr:#x}"),
        "synthesized branch trampoline"
    );
    Ok(addr)
}

/// Resolves a relocation's target: externals through the global table,
/// locals through the module's own resolved addresses.
fn resolve_value(oc: &ObjectModule, globals: &GlobalSymbols, sym: &ModuleSymbol) -> Result<u64> {
    if sym.is_external() {
        // External references bind to whatever the global table holds, so a
        // skipped weak definition resolves to the winning one.
        if let Some(addr) = globals.lookup(&sym.name) {
            return Ok(addr);
        }
        sym.addr.ok_or_else(|| {
            anyhow!(
                "failed to look up symbol\n{}: unknown symbol `{}'",
                oc.name,
                sym.name
            )
        })
    } else {
        sym.addr.ok_or_else(|| {
            anyhow!(
                "{}: address of symbol {} was not resolved",
                oc.name,
                sym.name
            )
        })
    }
}

fn got_slot(oc: &ObjectModule, sym: &ModuleSymbol) -> Result<u64> {
    sym.got_addr.ok_or_else(|| {
        anyhow!(
            "{}: no offset-table slot for symbol {}",
            oc.name,
            sym.name
        )
    })
}

fn decode_word_addend(oc: &ObjectModule, site: u64, reloc: &RelocEntry) -> Result<i64> {
    let width = 1u64 << reloc.r_length;
    let raw = oc.peek(site, width)?;
    Ok(sign_extend(raw, 8 * width as u32))
}

fn encode_word_addend(oc: &ObjectModule, site: u64, reloc: &RelocEntry, value: i64) -> Result<()> {
    let width = 1u64 << reloc.r_length;
    ensure!(
        fits_bits(8 * width as u32, value),
        "{}: value {value:#x} out of range for a {width}-byte site",
        oc.name
    );
    oc.poke(site, width, value as u64)
}

fn relocate_section_aarch64(
    oc: &mut ObjectModule,
    globals: &GlobalSymbols,
    sec_idx: usize,
) -> Result<()> {
    if oc.sections[sec_idx].size == 0 {
        return Ok(());
    }
    let sec_addr = oc.sections[sec_idx].addr;
    let relocs = oc.section_relocs(sec_idx)?;
    tracing::trace!(
        module = %oc.name,
        section = %oc.info.sections[sec_idx].sectname,
        nreloc = relocs.len(),
        "relocating section"
    );

    // An ADDEND entry carries the addend for the immediately following
    // page relocation out of band.
    let mut explicit_addend: i64 = 0;

    for (i, reloc) in relocs.iter().enumerate() {
        let site = sec_addr + u64::from(reloc.r_address);
        match reloc.r_type as u8 {
            macho::ARM64_RELOC_UNSIGNED => {
                let sym = oc.symbol(reloc.r_symbolnum)?;
                let addend = decode_word_addend(oc, site, reloc)?;
                let value = resolve_value(oc, globals, &sym)?;
                encode_word_addend(oc, site, reloc, (value as i64).wrapping_add(addend))
                    .with_context(|| format!("{}: UNSIGNED relocation of {}", oc.name, sym.name))?;
            }
            macho::ARM64_RELOC_SUBTRACTOR => {
                // Subtractor and unsigned work in tandem: first the site
                // becomes addend - base, then the following UNSIGNED adds
                // the target, yielding target - base.
                ensure!(
                    matches!(relocs.get(i + 1), Some(next) if next.r_type as u8 == macho::ARM64_RELOC_UNSIGNED),
                    "{}: SUBTRACTOR relocation must be followed by UNSIGNED",
                    oc.name
                );
                let sym = oc.symbol(reloc.r_symbolnum)?;
                let addend = decode_word_addend(oc, site, reloc)?;
                let value = resolve_value(oc, globals, &sym)?;
                encode_word_addend(oc, site, reloc, addend.wrapping_sub(value as i64))
                    .with_context(|| {
                        format!("{}: SUBTRACTOR relocation of {}", oc.name, sym.name)
                    })?;
            }
            macho::ARM64_RELOC_BRANCH26 => {
                let sym = oc.symbol(reloc.r_symbolnum)?;
                let word = oc.peek(site, 4)? as u32;
                let addend = decode_branch26(word);
                let pc = site;
                let mut value = resolve_value(oc, globals, &sym)?;
                let mut disp = (value as i64).wrapping_sub(pc as i64).wrapping_add(addend);
                if !fits_bits(28, disp) {
                    value = find_or_make_stub(oc, sec_idx, value)?;
                    disp = (value as i64).wrapping_sub(pc as i64).wrapping_add(addend);
                }
                let word = encode_branch26(word, disp).with_context(|| {
                    format!("{}: branch to {} unreachable", oc.name, sym.name)
                })?;
                oc.poke(site, 4, u64::from(word))?;
            }
            macho::ARM64_RELOC_PAGE21 | macho::ARM64_RELOC_GOT_LOAD_PAGE21 => {
                let sym = oc.symbol(reloc.r_symbolnum)?;
                let word = oc.peek(site, 4)? as u32;
                let addend = decode_page21(word);
                ensure!(
                    explicit_addend == 0 || addend == 0,
                    "{}: explicit and encoded addends cannot both be set",
                    oc.name
                );
                let value = if is_got_load(reloc) {
                    got_slot(oc, &sym)?
                } else {
                    resolve_value(oc, globals, &sym)?
                };
                let target = (value as i64)
                    .wrapping_add(addend)
                    .wrapping_add(explicit_addend);
                let delta = (target & !0xfff).wrapping_sub(site as i64 & !0xfff);
                let word = encode_page21(word, delta).with_context(|| {
                    format!("{}: page of {} unreachable", oc.name, sym.name)
                })?;
                oc.poke(site, 4, u64::from(word))?;
                explicit_addend = 0;
            }
            macho::ARM64_RELOC_PAGEOFF12 | macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12 => {
                let sym = oc.symbol(reloc.r_symbolnum)?;
                let word = oc.peek(site, 4)? as u32;
                let addend = decode_pageoff12(word);
                ensure!(
                    explicit_addend == 0 || addend == 0,
                    "{}: explicit and encoded addends cannot both be set",
                    oc.name
                );
                let value = if is_got_load(reloc) {
                    got_slot(oc, &sym)?
                } else {
                    resolve_value(oc, globals, &sym)?
                };
                let target = (value as i64)
                    .wrapping_add(addend)
                    .wrapping_add(explicit_addend);
                let word = encode_pageoff12(word, target & 0xfff).with_context(|| {
                    format!("{}: page offset of {} unencodable", oc.name, sym.name)
                })?;
                oc.poke(site, 4, u64::from(word))?;
                explicit_addend = 0;
            }
            macho::ARM64_RELOC_ADDEND => {
                explicit_addend = sign_extend(u64::from(reloc.r_symbolnum), 24);
                ensure!(
                    matches!(
                        relocs.get(i + 1),
                        Some(next) if next.r_type as u8 == macho::ARM64_RELOC_PAGE21
                            || next.r_type as u8 == macho::ARM64_RELOC_PAGEOFF12
                    ),
                    "{}: ADDEND relocation must be followed by PAGE21 or PAGEOFF12",
                    oc.name
                );
            }
            other => bail!("{}: relocation of type {} not supported", oc.name, other),
        }
    }
    Ok(())
}
