//! Object module loading pipeline.
//!
//! This module contains the `ObjectModule` struct which carries a loaded
//! object through the whole pipeline:
//! 1. Parsing: validate the image and index its structure (`image`).
//! 2. Segment building: allocate memory per permission class.
//! 3. Section loading: copy or zero each section, resolve symbol addresses,
//!    publish exports and allocate common storage.
//! 4. Resolution: fill pointer tables, build architecture side tables, apply
//!    relocations, and seal instruction memory.
//! 5. Initialization: run the module's initializer functions.
//!
//! A load either completes all stages or fails on the first unrecoverable
//! error; partially constructed state is reclaimed when the module is
//! dropped.

use anyhow::{anyhow, bail, ensure, Context, Result};
use object::macho;
use std::os::raw::{c_char, c_int};

use crate::arch::{self, Architecture};
use crate::env::ProgramArgs;
use crate::image::{self, FormatInfo, ModuleSymbol, RelocEntry};
use crate::layout::{
    classify_section, segment_class, Section, Segment, SegmentClass, SegmentProt, SEGMENT_CLASSES,
};
use crate::mmap::{protect_range, MemoryMap, Protection};
use crate::symtab::GlobalSymbols;
use crate::utils::{align_up, round_up_to_page};

/// Bytes reserved per relocation for branch trampolines: an 8-byte target
/// word plus two instructions.
pub(crate) const STUB_SLOT_SIZE: u64 = 16;

/// Sections that hold indirection-table slots rather than code or plain
/// data; filled by the import resolver and skipped by the relocator.
pub(crate) const POINTER_SECTIONS: [&str; 6] = [
    "__la_symbol_ptr",
    "__la_sym_ptr2",
    "__la_sym_ptr3",
    "__nl_symbol_ptr",
    "__pointers",
    "__jump_table",
];

/// How section memory is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    /// One contiguous mapping per module, one segment per permission class.
    Compound,
    /// One mapping per section, writable first and made executable only
    /// after relocation. Required where writable+executable pages are
    /// forbidden, and by the aarch64 engine's per-section trampolines.
    Isolated,
}

impl LoadProfile {
    pub fn select(cputype: u32, force_isolated: bool) -> LoadProfile {
        if force_isolated || cputype == macho::CPU_TYPE_ARM64 {
            LoadProfile::Isolated
        } else {
            LoadProfile::Compound
        }
    }
}

/// A loaded (or partially loaded) object module and everything it owns.
pub struct ObjectModule {
    /// Display name, used in every diagnostic.
    pub name: String,
    image: Vec<u8>,
    pub info: FormatInfo,
    pub symbols: Vec<ModuleSymbol>,
    pub sections: Vec<Section>,
    pub segments: Vec<Segment>,
    profile: LoadProfile,
    arch: &'static dyn Architecture,
    /// Compound-profile backing store for all segments.
    region: Option<MemoryMap>,
    /// Zero-initialized backing store for common symbols.
    common: Option<MemoryMap>,
    /// Offset table (one slot per symbol needing indirection), aarch64.
    pub(crate) got: Option<MemoryMap>,
    /// Per-symbol indirection cells and jump islands, x86_64.
    pub(crate) extras: Option<MemoryMap>,
    /// Names this module published, retracted on release.
    exports: Vec<String>,
    /// Address ranges relocation code may legitimately rewrite.
    pub(crate) proddable: Vec<(u64, u64)>,
}

impl ObjectModule {
    /// Validates and indexes an object image. No memory is allocated for the
    /// module's contents yet.
    pub fn init_from_image(name: &str, image: Vec<u8>, force_isolated: bool) -> Result<ObjectModule> {
        image::verify_image(&image, name)?;
        let (info, symbols) = image::parse_image(&image, name)?;
        let arch = arch::for_cputype(info.cputype)
            .with_context(|| format!("{name}: cannot relocate this image"))?;
        let profile = LoadProfile::select(info.cputype, force_isolated);
        tracing::debug!(
            module = name,
            arch = arch.name(),
            ?profile,
            nsects = info.sections.len(),
            nsyms = symbols.len(),
            "parsed object image"
        );
        Ok(ObjectModule {
            name: name.to_string(),
            image,
            info,
            symbols,
            sections: Vec::new(),
            segments: Vec::new(),
            profile,
            arch,
            region: None,
            common: None,
            got: None,
            extras: None,
            exports: Vec::new(),
            proddable: Vec::new(),
        })
    }

    /// Allocates memory for every section and fixes each section's run-time
    /// address, without touching the contents yet.
    pub fn build_segments(&mut self) -> Result<()> {
        ensure!(self.sections.is_empty(), "{}: segments already built", self.name);
        match self.profile {
            LoadProfile::Compound => self.build_compound(),
            LoadProfile::Isolated => self.build_isolated(),
        }?;
        for sec in &self.sections {
            if sec.size > 0 {
                self.proddable.push((sec.addr, sec.size + sec.stub_size));
            }
        }
        Ok(())
    }

    /// Compound profile: one mapping, one segment per permission class, the
    /// zero-fill class last. Section order within a class replicates file
    /// order so that address arithmetic downstream stays valid.
    fn build_compound(&mut self) -> Result<()> {
        let mut totals = [0u64; 3];
        let mut counts = [0usize; 3];
        for meta in &self.info.sections {
            let class = segment_class(meta) as usize;
            totals[class] = align_up(totals[class], meta.alignment()) + meta.size;
            counts[class] += 1;
        }
        let compound: u64 = totals.iter().map(|&t| round_up_to_page(t)).sum();

        self.sections = self
            .info
            .sections
            .iter()
            .map(|m| Section::empty(classify_section(&m.sectname)))
            .collect();
        if compound == 0 {
            return Ok(());
        }

        let region = MemoryMap::anonymous(compound, Protection::ReadWrite)
            .with_context(|| format!("{}: segment allocation failed", self.name))?;
        tracing::debug!(
            module = %self.name,
            base = %format_args!("{:#x}", region.start()),
            size = compound,
            "allocated segment region"
        );

        let mut cursor = region.start();
        let mut segments = Vec::new();
        for class in SEGMENT_CLASSES {
            if counts[class as usize] == 0 {
                continue;
            }
            let size = round_up_to_page(totals[class as usize]);
            let prot = if class == SegmentClass::Text {
                SegmentProt::ReadExec
            } else {
                SegmentProt::ReadWrite
            };
            let members = self
                .info
                .sections
                .iter()
                .enumerate()
                .filter(|(_, m)| segment_class(m) == class)
                .map(|(i, _)| i)
                .collect();
            segments.push(Segment {
                start: cursor,
                size,
                prot,
                sections: members,
            });
            cursor += size;
        }

        for seg in &segments {
            let mut cur = seg.start;
            for &idx in &seg.sections {
                let meta = &self.info.sections[idx];
                let addr = align_up(cur, meta.alignment());
                if meta.size > 0 {
                    self.sections[idx].addr = addr;
                    self.sections[idx].size = meta.size;
                }
                cur = addr + meta.size;
            }
        }

        self.segments = segments;
        self.region = Some(region);
        Ok(())
    }

    /// Constrained profile: an independent writable mapping per section,
    /// with trampoline scratch behind sections whose relocations may need
    /// branch stubs.
    fn build_isolated(&mut self) -> Result<()> {
        let wants_stubs = self.info.cputype == macho::CPU_TYPE_ARM64;
        let mut sections = Vec::with_capacity(self.info.sections.len());
        for meta in &self.info.sections {
            let mut sec = Section::empty(classify_section(&meta.sectname));
            if meta.size > 0 {
                let stub_space = if wants_stubs {
                    STUB_SLOT_SIZE * u64::from(meta.nreloc)
                } else {
                    0
                };
                let map = MemoryMap::anonymous(meta.size + stub_space, Protection::ReadWrite)
                    .with_context(|| {
                        format!("{}: failed to map section {}", self.name, meta.sectname)
                    })?;
                sec.addr = map.start();
                sec.size = meta.size;
                sec.stub_base = map.start() + meta.size;
                sec.stub_size = stub_space;
                sec.alloc = Some(map);
            }
            sections.push(sec);
        }
        self.sections = sections;
        Ok(())
    }

    /// Fills every section's memory, resolves the address of each
    /// section-defined symbol, publishes external definitions, and allocates
    /// common storage.
    pub fn extract_symbols_and_sections(&mut self, globals: &mut GlobalSymbols) -> Result<()> {
        ensure!(
            self.sections.len() == self.info.sections.len(),
            "{}: segments must be built before loading sections",
            self.name
        );
        self.load_section_contents()?;
        self.resolve_section_symbols()?;
        self.export_symbols(globals)?;
        self.allocate_common_storage(globals)
    }

    fn load_section_contents(&self) -> Result<()> {
        for (idx, meta) in self.info.sections.iter().enumerate() {
            let sec = &self.sections[idx];
            if sec.size == 0 {
                continue;
            }
            if meta.is_zerofill() {
                tracing::trace!(module = %self.name, section = %meta.sectname, "zero-filling");
                unsafe { std::ptr::write_bytes(sec.addr as *mut u8, 0, sec.size as usize) };
            } else {
                ensure!(
                    meta.offset != 0,
                    "{}: section {} has no file contents",
                    self.name,
                    meta.sectname
                );
                let start = meta.offset as usize;
                let bytes = start
                    .checked_add(meta.size as usize)
                    .and_then(|end| self.image.get(start..end))
                    .ok_or_else(|| {
                        anyhow!(
                            "{}: contents of section {} out of bounds",
                            self.name,
                            meta.sectname
                        )
                    })?;
                tracing::trace!(
                    module = %self.name,
                    section = %meta.sectname,
                    dst = %format_args!("{:#x}", sec.addr),
                    len = bytes.len(),
                    "copying section"
                );
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), sec.addr as *mut u8, bytes.len())
                };
            }
        }
        Ok(())
    }

    /// Now that all sections have been placed, the absolute address of every
    /// symbol they define can be computed: run-time section start, minus the
    /// section's address in the image, plus the symbol's address in the
    /// image.
    fn resolve_section_symbols(&mut self) -> Result<()> {
        for i in 0..self.symbols.len() {
            let sym = &self.symbols[i];
            if sym.is_stab() || !sym.is_section_defined() {
                continue;
            }
            ensure!(
                sym.n_sect != macho::NO_SECT,
                "{}: symbol {} has a section type but no section",
                self.name,
                sym.name
            );
            let n = usize::from(sym.n_sect - 1);
            ensure!(
                n < self.sections.len(),
                "{}: symbol {} names a section that does not exist",
                self.name,
                sym.name
            );
            if self.sections[n].size == 0 {
                // A discarded or empty section; nothing legitimately refers
                // to symbols in it.
                continue;
            }
            let meta = &self.info.sections[n];
            let offset = sym.n_value.checked_sub(meta.addr).ok_or_else(|| {
                anyhow!(
                    "{}: symbol {} lies before its section {}",
                    self.name,
                    sym.name,
                    meta.sectname
                )
            })?;
            self.symbols[i].addr = Some(self.sections[n].addr + offset);
        }
        Ok(())
    }

    fn export_symbols(&mut self, globals: &mut GlobalSymbols) -> Result<()> {
        for i in 0..self.symbols.len() {
            let sym = &self.symbols[i];
            if sym.is_stab() || !sym.is_external() || !sym.is_section_defined() {
                continue;
            }
            if sym.is_weak() && globals.lookup(&sym.name).is_some() {
                tracing::debug!(module = %self.name, symbol = %sym.name, "weak: keeping existing definition");
                continue;
            }
            let Some(addr) = sym.addr else {
                tracing::debug!(module = %self.name, symbol = %sym.name, "skipping symbol without a home");
                continue;
            };
            tracing::debug!(module = %self.name, symbol = %sym.name, addr = %format_args!("{addr:#x}"), "exporting");
            globals.insert(&self.name, &sym.name, addr, sym.is_weak());
            self.exports.push(sym.name.clone());
        }
        Ok(())
    }

    /// Common symbols carry a requested size but no storage; they all share
    /// one zero-initialized block, bump-allocated in symbol order.
    fn allocate_common_storage(&mut self, globals: &mut GlobalSymbols) -> Result<()> {
        let total: u64 = self
            .symbols
            .iter()
            .filter(|s| !s.is_stab() && s.is_common())
            .map(|s| s.n_value)
            .sum();
        if total == 0 {
            return Ok(());
        }
        let block = MemoryMap::anonymous(total, Protection::ReadWrite)
            .with_context(|| format!("{}: common storage allocation failed", self.name))?;
        tracing::debug!(module = %self.name, size = total, "allocated common storage");
        let mut cursor = block.start();
        for i in 0..self.symbols.len() {
            if self.symbols[i].is_stab() || !self.symbols[i].is_common() {
                continue;
            }
            let size = self.symbols[i].n_value;
            self.symbols[i].addr = Some(cursor);
            globals.insert(&self.name, &self.symbols[i].name, cursor, false);
            self.exports.push(self.symbols[i].name.clone());
            cursor += size;
        }
        self.proddable.push((block.start(), total));
        self.common = Some(block);
        Ok(())
    }

    /// Fills indirection tables, applies every relocation through the
    /// module's relocation strategy, and seals instruction memory.
    pub fn resolve_and_relocate(&mut self, globals: &mut GlobalSymbols) -> Result<()> {
        if !self.info.indirect.is_empty() {
            for idx in 0..self.info.sections.len() {
                if POINTER_SECTIONS.contains(&self.info.sections[idx].sectname.as_str()) {
                    self.resolve_imports(idx, globals)?;
                }
            }
        }
        let arch = self.arch;
        arch.prepare(self, globals)?;
        for idx in 0..self.sections.len() {
            arch.relocate_section(self, globals, idx).with_context(|| {
                format!(
                    "{}: relocation of section {} failed",
                    self.name, self.info.sections[idx].sectname
                )
            })?;
        }
        self.finalize_permissions()
    }

    /// Writes the resolved address of each indirectly named symbol into its
    /// pointer-table slot.
    fn resolve_imports(&self, idx: usize, globals: &GlobalSymbols) -> Result<()> {
        let meta = &self.info.sections[idx];
        let sec = &self.sections[idx];
        if sec.size == 0 {
            return Ok(());
        }
        for i in 0..sec.size / 8 {
            let table_index = meta.reserved1 as usize + i as usize;
            let Some(&sym_index) = self.info.indirect.get(table_index) else {
                bail!(
                    "{}: indirect symbol index {} out of range in {}",
                    self.name,
                    table_index,
                    meta.sectname
                );
            };
            if sym_index & (macho::INDIRECT_SYMBOL_LOCAL | macho::INDIRECT_SYMBOL_ABS) != 0 {
                continue;
            }
            let sym = self.symbols.get(sym_index as usize).ok_or_else(|| {
                anyhow!(
                    "{}: indirect entry {} names symbol {} beyond the symbol table",
                    self.name,
                    table_index,
                    sym_index
                )
            })?;
            // An undefined external with a recorded address is common
            // storage we allocated ourselves; everything else goes through
            // the global table.
            let addr = if sym.is_undefined() && sym.is_external() && sym.addr.is_some() {
                sym.addr
            } else {
                globals.lookup(&sym.name)
            }
            .ok_or_else(|| {
                anyhow!(
                    "lookup failed in import resolution\n{}: unknown symbol `{}'",
                    self.name,
                    sym.name
                )
            })?;
            tracing::trace!(module = %self.name, symbol = %sym.name, slot = i, "filling import slot");
            self.poke(sec.addr + i * 8, 8, addr)?;
        }
        Ok(())
    }

    /// Transitions instruction memory from writable to executable, once all
    /// relocations have been applied.
    fn finalize_permissions(&self) -> Result<()> {
        match self.profile {
            LoadProfile::Compound => {
                for seg in &self.segments {
                    if seg.prot == SegmentProt::ReadExec && seg.size > 0 {
                        protect_range(seg.start, seg.size as usize, Protection::ReadExec)
                            .with_context(|| {
                                format!("{}: failed to seal instruction segment", self.name)
                            })?;
                    }
                }
            }
            LoadProfile::Isolated => {
                for (idx, meta) in self.info.sections.iter().enumerate() {
                    let sec = &self.sections[idx];
                    if sec.size == 0 || !meta.is_pure_instructions() {
                        continue;
                    }
                    protect_range(
                        sec.addr,
                        (sec.size + sec.stub_size) as usize,
                        Protection::ReadExec,
                    )
                    .with_context(|| {
                        format!(
                            "{}: failed to seal instruction section {}",
                            self.name, meta.sectname
                        )
                    })?;
                }
            }
        }
        if let Some(extras) = &self.extras {
            extras
                .protect(Protection::ReadExec)
                .with_context(|| format!("{}: failed to seal jump islands", self.name))?;
        }
        Ok(())
    }

    /// Invokes every slot of the module's initializer-pointer sections with
    /// the host's argument and environment vectors, in slot order.
    pub fn run_initializers(&self) -> Result<()> {
        type InitFn = unsafe extern "C" fn(c_int, *const *const c_char, *const *const c_char);
        let args = ProgramArgs::capture();
        for (idx, meta) in self.info.sections.iter().enumerate() {
            let is_init = meta.sectname == "__mod_init_func"
                || meta.section_type() == macho::S_MOD_INIT_FUNC_POINTERS;
            if !is_init {
                continue;
            }
            let sec = &self.sections[idx];
            let mut slot = sec.addr;
            while slot + 8 <= sec.addr + sec.size {
                let fnptr = self.peek(slot, 8)?;
                if fnptr != 0 {
                    tracing::debug!(
                        module = %self.name,
                        init = %format_args!("{fnptr:#x}"),
                        "running module initializer"
                    );
                    let init: InitFn = unsafe { std::mem::transmute(fnptr as usize) };
                    unsafe { init(args.argc(), args.argv(), args.envp()) };
                }
                slot += 8;
            }
        }
        Ok(())
    }

    /// Withdraws the module's published symbols and releases everything it
    /// owns. Addresses previously handed out become dangling; the caller is
    /// responsible for making sure nothing refers to them any more.
    pub fn release(self, globals: &mut GlobalSymbols) {
        globals.retract(&self.name);
    }

    pub(crate) fn section_relocs(&self, idx: usize) -> Result<Vec<RelocEntry>> {
        image::relocations(&self.image, &self.info.sections[idx], &self.name)
    }

    pub(crate) fn symbol(&self, num: u32) -> Result<ModuleSymbol> {
        self.symbols.get(num as usize).cloned().ok_or_else(|| {
            anyhow!(
                "{}: relocation names symbol {} beyond the symbol table",
                self.name,
                num
            )
        })
    }

    /// Verifies that a prospective write stays inside memory this module
    /// loaded or allocated.
    pub(crate) fn check_proddable(&self, addr: u64, len: u64) -> Result<()> {
        let ok = len > 0
            && self
                .proddable
                .iter()
                .any(|&(start, size)| addr >= start && addr + len <= start + size);
        ensure!(
            ok,
            "{}: access of {} bytes at {:#x} is outside the module's memory",
            self.name,
            len,
            addr
        );
        Ok(())
    }

    /// Reads a little-endian value of 1, 2, 4 or 8 bytes from loaded memory.
    pub(crate) fn peek(&self, addr: u64, width: u64) -> Result<u64> {
        self.check_proddable(addr, width)?;
        let value = unsafe {
            match width {
                1 => u64::from(std::ptr::read(addr as *const u8)),
                2 => u64::from(std::ptr::read_unaligned(addr as *const u16)),
                4 => u64::from(std::ptr::read_unaligned(addr as *const u32)),
                8 => std::ptr::read_unaligned(addr as *const u64),
                _ => bail!("{}: unsupported access width {}", self.name, width),
            }
        };
        Ok(value)
    }

    /// Writes a little-endian value of 1, 2, 4 or 8 bytes, truncating.
    pub(crate) fn poke(&self, addr: u64, width: u64, value: u64) -> Result<()> {
        self.check_proddable(addr, width)?;
        unsafe {
            match width {
                1 => std::ptr::write(addr as *mut u8, value as u8),
                2 => std::ptr::write_unaligned(addr as *mut u16, value as u16),
                4 => std::ptr::write_unaligned(addr as *mut u32, value as u32),
                8 => std::ptr::write_unaligned(addr as *mut u64, value),
                _ => bail!("{}: unsupported access width {}", self.name, width),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectModule")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("sections", &self.sections.len())
            .field("segments", &self.segments.len())
            .field("symbols", &self.symbols.len())
            .field("exports", &self.exports.len())
            .field("region", &self.region.as_ref().map(MemoryMap::len))
            .field("common", &self.common.as_ref().map(MemoryMap::len))
            .field("got", &self.got.as_ref().map(MemoryMap::len))
            .field("extras", &self.extras.as_ref().map(MemoryMap::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::{decode_branch26, decode_page21, decode_pageoff12};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const N_EXT: u8 = macho::N_EXT;
    const N_SECT: u8 = macho::N_SECT;
    const N_UNDF: u8 = macho::N_UNDF;

    struct TestSection {
        sectname: &'static str,
        data: Vec<u8>,
        align: u32,
        flags: u32,
        reserved1: u32,
        /// (r_address, packed second word)
        relocs: Vec<(u32, u32)>,
    }

    impl TestSection {
        fn new(sectname: &'static str, data: Vec<u8>) -> TestSection {
            TestSection {
                sectname,
                data,
                align: 3,
                flags: 0,
                reserved1: 0,
                relocs: Vec::new(),
            }
        }

        fn align(mut self, align: u32) -> TestSection {
            self.align = align;
            self
        }

        fn flags(mut self, flags: u32) -> TestSection {
            self.flags = flags;
            self
        }

        fn reserved1(mut self, reserved1: u32) -> TestSection {
            self.reserved1 = reserved1;
            self
        }

        fn reloc(mut self, r_address: u32, word1: u32) -> TestSection {
            self.relocs.push((r_address, word1));
            self
        }
    }

    struct TestSymbol {
        name: &'static str,
        n_type: u8,
        n_sect: u8,
        n_desc: u16,
        n_value: u64,
    }

    fn undefined(name: &'static str) -> TestSymbol {
        TestSymbol {
            name,
            n_type: N_UNDF | N_EXT,
            n_sect: 0,
            n_desc: 0,
            n_value: 0,
        }
    }

    fn common(name: &'static str, size: u64) -> TestSymbol {
        TestSymbol {
            name,
            n_type: N_UNDF | N_EXT,
            n_sect: 0,
            n_desc: 0,
            n_value: size,
        }
    }

    fn defined(name: &'static str, sect: u8, vmaddr: u64) -> TestSymbol {
        TestSymbol {
            name,
            n_type: N_SECT | N_EXT,
            n_sect: sect,
            n_desc: 0,
            n_value: vmaddr,
        }
    }

    fn reloc_word1(symbolnum: u32, pcrel: bool, length: u8, external: bool, r_type: u32) -> u32 {
        symbolnum
            | (u32::from(pcrel) << 24)
            | (u32::from(length) << 25)
            | (u32::from(external) << 27)
            | (r_type << 28)
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_name16(buf: &mut Vec<u8>, name: &str) {
        let mut raw = [0u8; 16];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&raw);
    }

    /// Emits a minimal relocatable 64-bit Mach-O image: one segment command,
    /// a symbol table and a dynamic symbol table.
    fn build_object(
        cputype: u32,
        sections: &[TestSection],
        symbols: &[TestSymbol],
        indirect: &[u32],
    ) -> Vec<u8> {
        let nsects = sections.len();
        let seg_cmdsize = 72 + 80 * nsects;
        let sizeofcmds = seg_cmdsize + 24 + 80;
        let header_end = 32 + sizeofcmds;

        // Lay out section vmaddrs within the image and contents in the file.
        let mut vmaddrs = Vec::new();
        let mut offsets = Vec::new();
        let mut vmaddr = 0u64;
        let mut cursor = header_end;
        for sec in sections {
            vmaddr = align_up(vmaddr, 1 << sec.align);
            vmaddrs.push(vmaddr);
            vmaddr += sec.data.len() as u64;
            let zerofill = matches!(
                sec.flags & macho::SECTION_TYPE,
                macho::S_ZEROFILL | macho::S_GB_ZEROFILL
            );
            if zerofill {
                offsets.push(0);
            } else {
                offsets.push(cursor as u32);
                cursor += sec.data.len();
            }
        }
        let mut reloffs = Vec::new();
        for sec in sections {
            reloffs.push(cursor as u32);
            cursor += 8 * sec.relocs.len();
        }
        let symoff = cursor as u32;
        cursor += 16 * symbols.len();

        let mut strtab = vec![0u8];
        let mut stroffs = Vec::new();
        for sym in symbols {
            if sym.name.is_empty() {
                stroffs.push(0);
            } else {
                stroffs.push(strtab.len() as u32);
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
            }
        }
        let stroff = cursor as u32;
        cursor += strtab.len();
        let indirectsymoff = cursor as u32;

        let mut buf = Vec::new();
        // Header
        push_u32(&mut buf, macho::MH_MAGIC_64);
        push_u32(&mut buf, cputype);
        push_u32(&mut buf, 0); // cpusubtype
        push_u32(&mut buf, macho::MH_OBJECT);
        push_u32(&mut buf, 3); // ncmds
        push_u32(&mut buf, sizeofcmds as u32);
        push_u32(&mut buf, 0); // flags
        push_u32(&mut buf, 0); // reserved

        // Segment command
        push_u32(&mut buf, macho::LC_SEGMENT_64);
        push_u32(&mut buf, seg_cmdsize as u32);
        push_name16(&mut buf, "");
        push_u64(&mut buf, 0); // vmaddr
        push_u64(&mut buf, vmaddr); // vmsize
        push_u64(&mut buf, header_end as u64); // fileoff
        push_u64(&mut buf, (cursor - header_end) as u64); // filesize
        push_u32(&mut buf, 7); // maxprot
        push_u32(&mut buf, 7); // initprot
        push_u32(&mut buf, nsects as u32);
        push_u32(&mut buf, 0); // flags
        for (i, sec) in sections.iter().enumerate() {
            push_name16(&mut buf, sec.sectname);
            push_name16(&mut buf, "__TEST");
            push_u64(&mut buf, vmaddrs[i]);
            push_u64(&mut buf, sec.data.len() as u64);
            push_u32(&mut buf, offsets[i]);
            push_u32(&mut buf, sec.align);
            push_u32(&mut buf, reloffs[i]);
            push_u32(&mut buf, sec.relocs.len() as u32);
            push_u32(&mut buf, sec.flags);
            push_u32(&mut buf, sec.reserved1);
            push_u32(&mut buf, 0); // reserved2
            push_u32(&mut buf, 0); // reserved3
        }

        // Symbol table command
        push_u32(&mut buf, macho::LC_SYMTAB);
        push_u32(&mut buf, 24);
        push_u32(&mut buf, symoff);
        push_u32(&mut buf, symbols.len() as u32);
        push_u32(&mut buf, stroff);
        push_u32(&mut buf, strtab.len() as u32);

        // Dynamic symbol table command
        push_u32(&mut buf, macho::LC_DYSYMTAB);
        push_u32(&mut buf, 80);
        for field in 0..18u32 {
            match field {
                12 => push_u32(&mut buf, indirectsymoff),
                13 => push_u32(&mut buf, indirect.len() as u32),
                _ => push_u32(&mut buf, 0),
            }
        }

        assert_eq!(buf.len(), header_end);
        for (i, sec) in sections.iter().enumerate() {
            if offsets[i] != 0 {
                buf.extend_from_slice(&sec.data);
            }
        }
        for sec in sections {
            for &(r_address, word1) in &sec.relocs {
                push_u32(&mut buf, r_address);
                push_u32(&mut buf, word1);
            }
        }
        for (i, sym) in symbols.iter().enumerate() {
            push_u32(&mut buf, stroffs[i]);
            buf.push(sym.n_type);
            buf.push(sym.n_sect);
            buf.extend_from_slice(&sym.n_desc.to_le_bytes());
            push_u64(&mut buf, sym.n_value);
        }
        buf.extend_from_slice(&strtab);
        for &ix in indirect {
            push_u32(&mut buf, ix);
        }
        buf
    }

    fn load_module(
        name: &str,
        image: Vec<u8>,
        globals: &mut GlobalSymbols,
    ) -> Result<ObjectModule> {
        let mut module = ObjectModule::init_from_image(name, image, false)?;
        module.build_segments()?;
        module.extract_symbols_and_sections(globals)?;
        Ok(module)
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut globals = GlobalSymbols::new();
        let image = vec![0u8; 64];
        assert!(load_module("bad.o", image, &mut globals).is_err());
    }

    #[test]
    fn test_missing_segment_command_is_rejected() {
        let mut image = Vec::new();
        push_u32(&mut image, macho::MH_MAGIC_64);
        push_u32(&mut image, macho::CPU_TYPE_X86_64);
        for _ in 0..6 {
            push_u32(&mut image, 0);
        }
        let err = ObjectModule::init_from_image("empty.o", image, false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("no segment load command"), "{err}");
    }

    #[test]
    fn test_sections_load_and_symbols_resolve() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[
                TestSection::new("__text", vec![0x90; 5]).align(4),
                TestSection::new("__data", vec![1, 2, 3, 4, 5, 6, 7, 8]).align(3),
                TestSection::new("__bss", vec![0; 16])
                    .align(4)
                    .flags(macho::S_ZEROFILL),
            ],
            // Image vmaddrs: __text at 0, __data at 8, __bss at 16.
            &[
                defined("_foo", 1, 1),
                defined("_bar", 2, 8 + 4),
                defined("_zed", 3, 16),
            ],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let module = load_module("t.o", image, &mut globals).unwrap();

        // One RX segment for __text, one RW segment for the rest.
        assert_eq!(module.segments.len(), 2);
        assert_eq!(module.segments[0].prot, SegmentProt::ReadExec);
        assert_eq!(module.segments[0].sections, vec![0]);
        assert_eq!(module.segments[1].prot, SegmentProt::ReadWrite);
        assert_eq!(module.segments[1].sections, vec![1, 2]);

        for (idx, meta) in module.info.sections.iter().enumerate() {
            let sec = &module.sections[idx];
            assert_eq!(sec.addr % meta.alignment(), 0, "section {idx} misaligned");
        }

        // Round-trip addressing for every section-defined symbol.
        for sym in &module.symbols {
            let sec = &module.sections[usize::from(sym.n_sect - 1)];
            let meta = &module.info.sections[usize::from(sym.n_sect - 1)];
            assert_eq!(
                sym.addr.unwrap() - sec.addr,
                sym.n_value - meta.addr,
                "round trip failed for {}",
                sym.name
            );
        }

        // Contents copied and zero-filled.
        let data = &module.sections[1];
        assert_eq!(module.peek(data.addr, 8).unwrap(), 0x0807_0605_0403_0201);
        let bss = &module.sections[2];
        assert_eq!(module.peek(bss.addr, 8).unwrap(), 0);

        // Exports are visible.
        assert_eq!(globals.lookup_loaded("_foo"), module.symbols[0].addr);
    }

    #[test]
    fn test_common_symbols_share_one_packed_block() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__data", vec![0; 8])],
            &[common("_small", 8), common("_big", 24)],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let module = load_module("t.o", image, &mut globals).unwrap();

        let block = module.common.as_ref().expect("common block allocated");
        let small = globals.lookup_loaded("_small").unwrap();
        let big = globals.lookup_loaded("_big").unwrap();
        assert_eq!(small, block.start());
        assert_eq!(big, block.start() + 8);
        // Distinct, non-overlapping ranges inside the block.
        assert!(small + 8 <= big);
        assert!(big + 24 <= block.start() + block.len() as u64);
        assert_eq!(module.peek(big, 8).unwrap(), 0);
    }

    #[test]
    fn test_weak_definition_keeps_existing_symbol() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__data", vec![0; 8])],
            &[TestSymbol {
                name: "_dup",
                n_type: N_SECT | N_EXT,
                n_sect: 1,
                n_desc: macho::N_WEAK_DEF,
                n_value: 0,
            }],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        globals.insert("pre", "_dup", 0x1234, false);
        load_module("t.o", image, &mut globals).unwrap();
        assert_eq!(globals.lookup_loaded("_dup"), Some(0x1234));
    }

    #[test]
    fn test_import_slots_receive_resolved_addresses() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__nl_symbol_ptr", vec![0; 16]).reserved1(0)],
            &[undefined("_imp")],
            &[0, macho::INDIRECT_SYMBOL_ABS],
        );
        let mut globals = GlobalSymbols::new();
        globals.insert("host", "_imp", 0xabcd_1234, false);
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        module.resolve_and_relocate(&mut globals).unwrap();

        let slots = module.sections[0].addr;
        assert_eq!(module.peek(slots, 8).unwrap(), 0xabcd_1234);
        // The reserved-marker slot is left alone.
        assert_eq!(module.peek(slots + 8, 8).unwrap(), 0);
    }

    #[test]
    fn test_unresolved_import_aborts_the_load() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__nl_symbol_ptr", vec![0; 8])],
            &[undefined("_nowhere_to_be_found_xyzzy")],
            &[0],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        let err = module.resolve_and_relocate(&mut globals).unwrap_err();
        assert!(format!("{err:#}").contains("_nowhere_to_be_found_xyzzy"));
    }

    #[test]
    fn test_x86_64_absolute_and_pcrel_relocations() {
        // call rel32 at offset 0 (site at +1), then an absolute pointer and
        // an internal pc-relative reference in __data.
        let mut lea = vec![0x48, 0x8d, 0x05, 0, 0, 0, 0];
        // Internal SIGNED: image target = __data vmaddr + 2. With both
        // sections at align 0, __text sits at 0 and __data at 12, and the
        // site's base is the end of the lea at image address 12.
        let disp: i32 = (12 + 2) - 12;
        lea[3..7].copy_from_slice(&disp.to_le_bytes());
        let mut text = vec![0xe8, 0, 0, 0, 0];
        text.extend_from_slice(&lea);
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[
                TestSection::new("__text", text)
                    .align(0)
                    .reloc(1, reloc_word1(0, true, 2, true, macho::X86_64_RELOC_BRANCH.into()))
                    .reloc(8, reloc_word1(2, true, 2, false, macho::X86_64_RELOC_SIGNED.into())),
                TestSection::new("__data", {
                    let mut d = vec![0; 8];
                    // In-place value for internal UNSIGNED: __text vmaddr + 1.
                    d[0] = 1;
                    d
                })
                .align(0)
                .reloc(0, reloc_word1(1, false, 3, false, macho::X86_64_RELOC_UNSIGNED.into())),
            ],
            &[undefined("_ext")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();

        let text_addr = module.sections[0].addr;
        let data_addr = module.sections[1].addr;
        let ext = text_addr + 0x1000;
        globals.insert("host", "_ext", ext, false);
        module.resolve_and_relocate(&mut globals).unwrap();

        // call displacement is relative to the end of the instruction.
        let disp = module.peek(text_addr + 1, 4).unwrap() as u32 as i32;
        assert_eq!(
            text_addr.wrapping_add(5).wrapping_add(disp as u64),
            ext,
            "branch displacement"
        );
        // Internal lea now points at the relocated __data + 2.
        let disp = module.peek(text_addr + 8, 4).unwrap() as u32 as i32;
        assert_eq!(
            text_addr.wrapping_add(12).wrapping_add(disp as u64),
            data_addr + 2,
            "internal pc-relative reference"
        );
        // Absolute pointer to __text + 1.
        assert_eq!(module.peek(data_addr, 8).unwrap(), text_addr + 1);
    }

    #[test]
    fn test_x86_64_distant_branch_goes_through_jump_island() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__text", vec![0xe8, 0, 0, 0, 0])
                .align(0)
                .reloc(1, reloc_word1(0, true, 2, true, macho::X86_64_RELOC_BRANCH.into()))],
            &[undefined("_far")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();

        let text_addr = module.sections[0].addr;
        let far = text_addr.wrapping_add(1 << 33);
        globals.insert("host", "_far", far, false);
        module.resolve_and_relocate(&mut globals).unwrap();

        let disp = module.peek(text_addr + 1, 4).unwrap() as u32 as i32;
        let island = text_addr.wrapping_add(5).wrapping_add(disp as u64);
        // The island jumps through the cell holding the real target.
        assert_eq!(module.peek(island - 8, 8).unwrap(), far);
        assert_eq!(module.peek(island, 2).unwrap(), 0x25ff);
    }

    #[test]
    fn test_page_pair_relocation_reconstructs_target() {
        let mut text = Vec::new();
        text.extend_from_slice(&0x9000_0000u32.to_le_bytes()); // adrp x0
        text.extend_from_slice(&0x9100_0000u32.to_le_bytes()); // add x0, x0, #0
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[TestSection::new("__text", text)
                .align(2)
                .flags(macho::S_ATTR_PURE_INSTRUCTIONS)
                .reloc(0, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_PAGE21.into()))
                .reloc(4, reloc_word1(0, false, 2, true, macho::ARM64_RELOC_PAGEOFF12.into()))],
            &[undefined("_ext")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();

        let pc = module.sections[0].addr;
        let ext = pc + 0x12345;
        globals.insert("host", "_ext", ext, false);
        module.resolve_and_relocate(&mut globals).unwrap();

        let adrp = module.peek(pc, 4).unwrap() as u32;
        let add = module.peek(pc + 4, 4).unwrap() as u32;
        let page = (pc & !0xfff).wrapping_add(decode_page21(adrp) as u64);
        let target = page + decode_pageoff12(add) as u64;
        assert_eq!(target, ext, "page + pageoff must rebuild the address");
    }

    #[test]
    fn test_distant_branch_synthesizes_one_trampoline() {
        let mut text = Vec::new();
        text.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl
        text.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[TestSection::new("__text", text)
                .align(2)
                .flags(macho::S_ATTR_PURE_INSTRUCTIONS)
                .reloc(0, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_BRANCH26.into()))
                .reloc(4, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_BRANCH26.into()))],
            &[undefined("_far")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();

        let pc = module.sections[0].addr;
        let far = pc + 500 * 1024 * 1024;
        globals.insert("host", "_far", far, false);
        module.resolve_and_relocate(&mut globals).unwrap();

        // Two branches to one distant target share a single trampoline.
        let sec = &module.sections[0];
        assert_eq!(sec.stubs.len(), 1);
        let stub = sec.stubs[0];
        assert_eq!(stub.target, far);
        assert!(stub.addr >= sec.stub_base && stub.addr < sec.stub_base + sec.stub_size);

        let b0 = module.peek(pc, 4).unwrap() as u32;
        let b1 = module.peek(pc + 4, 4).unwrap() as u32;
        assert_eq!(pc.wrapping_add(decode_branch26(b0) as u64), stub.addr);
        assert_eq!((pc + 4).wrapping_add(decode_branch26(b1) as u64), stub.addr);
        // The trampoline loads the true 64-bit target from the word before it.
        assert_eq!(module.peek(stub.addr - 8, 8).unwrap(), far);
    }

    #[test]
    fn test_got_load_pair_goes_through_offset_table() {
        let mut text = Vec::new();
        text.extend_from_slice(&0x9000_0000u32.to_le_bytes()); // adrp x0
        text.extend_from_slice(&0xf940_0000u32.to_le_bytes()); // ldr x0, [x0]
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[TestSection::new("__text", text)
                .align(2)
                .flags(macho::S_ATTR_PURE_INSTRUCTIONS)
                .reloc(0, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_GOT_LOAD_PAGE21.into()))
                .reloc(
                    4,
                    reloc_word1(0, false, 2, true, macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12.into()),
                )],
            &[undefined("_ext")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        // A target far beyond direct reach; only the table slot must be near.
        let ext = 0x1122_3344_5566u64;
        globals.insert("host", "_ext", ext, false);
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        module.resolve_and_relocate(&mut globals).unwrap();

        let pc = module.sections[0].addr;
        let slot = module.symbols[0].got_addr.unwrap();
        let adrp = module.peek(pc, 4).unwrap() as u32;
        let ldr = module.peek(pc + 4, 4).unwrap() as u32;
        let loaded = (pc & !0xfff)
            .wrapping_add(decode_page21(adrp) as u64)
            .wrapping_add(decode_pageoff12(ldr) as u64);
        assert_eq!(loaded, slot, "instructions must address the table slot");
        assert_eq!(module.peek(slot, 8).unwrap(), ext);
    }

    #[test]
    fn test_explicit_addend_applies_to_following_page_pair() {
        let mut text = Vec::new();
        text.extend_from_slice(&0x9000_0000u32.to_le_bytes()); // adrp x0
        text.extend_from_slice(&0x9100_0000u32.to_le_bytes()); // add x0, x0, #0
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[TestSection::new("__text", text)
                .align(2)
                .flags(macho::S_ATTR_PURE_INSTRUCTIONS)
                .reloc(0, reloc_word1(0x10, false, 2, false, macho::ARM64_RELOC_ADDEND.into()))
                .reloc(0, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_PAGE21.into()))
                .reloc(4, reloc_word1(0x10, false, 2, false, macho::ARM64_RELOC_ADDEND.into()))
                .reloc(4, reloc_word1(0, false, 2, true, macho::ARM64_RELOC_PAGEOFF12.into()))],
            &[undefined("_ext")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();

        let pc = module.sections[0].addr;
        let ext = pc + 0x2000;
        globals.insert("host", "_ext", ext, false);
        module.resolve_and_relocate(&mut globals).unwrap();

        let adrp = module.peek(pc, 4).unwrap() as u32;
        let add = module.peek(pc + 4, 4).unwrap() as u32;
        let target = (pc & !0xfff)
            .wrapping_add(decode_page21(adrp) as u64)
            .wrapping_add(decode_pageoff12(add) as u64);
        assert_eq!(target, ext + 0x10, "out-of-band addend must be applied");
    }

    #[test]
    fn test_subtractor_requires_following_unsigned() {
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[TestSection::new("__data", vec![0; 8])
                .reloc(0, reloc_word1(0, false, 3, true, macho::ARM64_RELOC_SUBTRACTOR.into()))
                .reloc(0, reloc_word1(0, true, 2, true, macho::ARM64_RELOC_BRANCH26.into()))],
            &[defined("_a", 1, 0)],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        let err = format!("{:#}", module.resolve_and_relocate(&mut globals).unwrap_err());
        assert!(err.contains("SUBTRACTOR"), "{err}");
    }

    #[test]
    fn test_subtractor_unsigned_pair_computes_difference() {
        let image = build_object(
            macho::CPU_TYPE_ARM64,
            &[
                TestSection::new("__data", vec![0; 8])
                    .reloc(0, reloc_word1(0, false, 3, true, macho::ARM64_RELOC_SUBTRACTOR.into()))
                    .reloc(0, reloc_word1(1, false, 3, true, macho::ARM64_RELOC_UNSIGNED.into())),
                TestSection::new("__const", vec![0; 16]),
            ],
            &[defined("_base", 1, 0), defined("_target", 2, 8 + 8)],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        module.resolve_and_relocate(&mut globals).unwrap();

        let base = module.symbols[0].addr.unwrap();
        let target = module.symbols[1].addr.unwrap();
        let stored = module.peek(module.sections[0].addr, 8).unwrap();
        assert_eq!(stored, target.wrapping_sub(base));
    }

    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn host_init(
        argc: c_int,
        argv: *const *const c_char,
        _envp: *const *const c_char,
    ) {
        assert!(argc >= 1);
        assert!(!argv.is_null());
        INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_initializers_run_with_process_arguments() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__mod_init_func", vec![0; 8])
                .flags(macho::S_MOD_INIT_FUNC_POINTERS)
                .reloc(0, reloc_word1(0, false, 3, true, macho::X86_64_RELOC_UNSIGNED.into()))],
            &[undefined("_host_init")],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        globals.insert("host", "_host_init", host_init as usize as u64, false);
        let mut module = load_module("t.o", image, &mut globals).unwrap();
        module.resolve_and_relocate(&mut globals).unwrap();

        let before = INIT_CALLS.load(Ordering::SeqCst);
        module.run_initializers().unwrap();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_release_retracts_published_symbols() {
        let image = build_object(
            macho::CPU_TYPE_X86_64,
            &[TestSection::new("__data", vec![0; 8])],
            &[defined("_gone", 1, 0)],
            &[],
        );
        let mut globals = GlobalSymbols::new();
        let module = load_module("t.o", image, &mut globals).unwrap();
        assert!(globals.lookup_loaded("_gone").is_some());
        module.release(&mut globals);
        assert!(globals.lookup_loaded("_gone").is_none());
    }
}
