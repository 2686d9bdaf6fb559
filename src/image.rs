//! Object image parsing.
//!
//! Walks a 64-bit Mach-O image's load-command list exactly once, locating the
//! segment, symbol-table and dynamic-symbol-table commands, and builds a flat
//! symbol index over the raw symbol entries. All metadata the later pipeline
//! stages need is copied out of the image here; section contents and
//! relocation entries stay in the image and are read on demand through
//! bounds-checked accessors.

use anyhow::{anyhow, bail, ensure, Context, Result};
use object::endian::LittleEndian as LE;
use object::macho;
use object::macho::{DysymtabCommand, Nlist64, Section64, SegmentCommand64, SymtabCommand};
use object::pod;

const HEADER_SIZE: usize = 32;

/// Owned copy of one section header's interesting fields.
#[derive(Debug, Clone)]
pub struct SectionMeta {
    pub sectname: String,
    pub segname: String,
    /// Virtual address the producing toolchain assigned within the image.
    pub addr: u64,
    pub size: u64,
    /// File offset of the section contents; zero for zero-fill sections.
    pub offset: u32,
    /// Alignment as a power-of-two exponent.
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    /// First index into the indirect symbol table, for pointer sections.
    pub reserved1: u32,
}

impl SectionMeta {
    pub fn section_type(&self) -> u32 {
        self.flags & macho::SECTION_TYPE
    }

    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.section_type(),
            macho::S_ZEROFILL | macho::S_GB_ZEROFILL
        )
    }

    pub fn is_pure_instructions(&self) -> bool {
        self.flags & macho::SECTION_ATTRIBUTES_USR == macho::S_ATTR_PURE_INSTRUCTIONS
    }

    pub fn alignment(&self) -> u64 {
        1u64 << self.align
    }
}

/// One entry of the flat symbol index: the raw symbol record's fields plus
/// the two addresses the loader fills in, kept separate from the parsed
/// record instead of being written back over it.
#[derive(Debug, Clone)]
pub struct ModuleSymbol {
    pub name: String,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
    /// Run-time address; set once the owning section (or common storage) has
    /// been placed.
    pub addr: Option<u64>,
    /// Offset-table slot address, when the relocation model needs one.
    pub got_addr: Option<u64>,
}

impl ModuleSymbol {
    pub fn is_stab(&self) -> bool {
        self.n_type & macho::N_STAB != 0
    }

    pub fn is_external(&self) -> bool {
        self.n_type & macho::N_EXT != 0
    }

    pub fn is_undefined(&self) -> bool {
        self.n_type & macho::N_TYPE == macho::N_UNDF
    }

    pub fn is_section_defined(&self) -> bool {
        self.n_type & macho::N_TYPE == macho::N_SECT
    }

    pub fn is_weak(&self) -> bool {
        self.n_desc & macho::N_WEAK_DEF != 0
    }

    /// Tentative definition: undefined but external and carrying its storage
    /// size in `n_value`.
    pub fn is_common(&self) -> bool {
        self.is_external() && self.is_undefined() && self.n_value != 0
    }
}

/// Locations of the symbol-table pieces inside the image.
#[derive(Debug, Clone, Copy)]
pub struct SymtabInfo {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// Everything the pipeline needs to know about the image's structure.
#[derive(Debug)]
pub struct FormatInfo {
    pub cputype: u32,
    /// Section headers of the single segment command, in file order.
    pub sections: Vec<SectionMeta>,
    pub symtab: Option<SymtabInfo>,
    /// Indirect symbol index array from the dynamic symbol table command.
    pub indirect: Vec<u32>,
}

/// Validates the format magic and word size.
pub fn verify_image(image: &[u8], name: &str) -> Result<()> {
    let magic =
        read_u32(image, 0).with_context(|| format!("{name}: image too small for a header"))?;
    if magic != macho::MH_MAGIC_64 {
        bail!(
            "could not load image {name}: bad magic!\n  expected {:08x} (64bit), got {:08x}{}",
            macho::MH_MAGIC_64,
            magic,
            if magic == macho::MH_MAGIC {
                " (32bit)."
            } else {
                "."
            }
        );
    }
    Ok(())
}

/// Walks the load commands and builds the symbol index. Fails if the image
/// carries no segment command; there would be nothing to load.
pub fn parse_image(image: &[u8], name: &str) -> Result<(FormatInfo, Vec<ModuleSymbol>)> {
    ensure!(
        image.len() >= HEADER_SIZE,
        "{name}: image too small for a header"
    );
    let cputype = read_u32(image, 4)?;
    let ncmds = read_u32(image, 16)?;

    let mut seg_offset: Option<usize> = None;
    let mut symtab: Option<SymtabInfo> = None;
    let mut dysym: Option<(u32, u32)> = None;

    let mut offset = HEADER_SIZE;
    for _ in 0..ncmds {
        let cmd = read_u32(image, offset)?;
        let cmdsize = read_u32(image, offset + 4)? as usize;
        ensure!(
            cmdsize >= 8 && offset.checked_add(cmdsize).is_some_and(|end| end <= image.len()),
            "{name}: malformed load command at offset {offset}"
        );
        match cmd {
            macho::LC_SEGMENT_64 => seg_offset = Some(offset),
            macho::LC_SYMTAB => {
                let st: &SymtabCommand<LE> = struct_at(image, offset, name)?;
                symtab = Some(SymtabInfo {
                    symoff: st.symoff.get(LE),
                    nsyms: st.nsyms.get(LE),
                    stroff: st.stroff.get(LE),
                    strsize: st.strsize.get(LE),
                });
            }
            macho::LC_DYSYMTAB => {
                let dc: &DysymtabCommand<LE> = struct_at(image, offset, name)?;
                dysym = Some((dc.indirectsymoff.get(LE), dc.nindirectsyms.get(LE)));
            }
            _ => {}
        }
        offset += cmdsize;
    }

    let seg_offset = seg_offset.ok_or_else(|| anyhow!("{name}: no segment load command"))?;
    let seg: &SegmentCommand64<LE> = struct_at(image, seg_offset, name)?;
    let nsects = seg.nsects.get(LE) as usize;
    let raw_sections: &[Section64<LE>] = slice_at(
        image,
        seg_offset + std::mem::size_of::<SegmentCommand64<LE>>(),
        nsects,
        name,
    )?;
    let sections = raw_sections
        .iter()
        .map(|s| SectionMeta {
            sectname: fixed_str(&s.sectname),
            segname: fixed_str(&s.segname),
            addr: s.addr.get(LE),
            size: s.size.get(LE),
            offset: s.offset.get(LE),
            align: s.align.get(LE),
            reloff: s.reloff.get(LE),
            nreloc: s.nreloc.get(LE),
            flags: s.flags.get(LE),
            reserved1: s.reserved1.get(LE),
        })
        .collect();

    let mut symbols = Vec::new();
    if let Some(st) = symtab {
        let nlists: &[Nlist64<LE>] = slice_at(image, st.symoff as usize, st.nsyms as usize, name)?;
        let strtab = bytes_at(image, st.stroff as usize, st.strsize as usize, name)?;
        for nl in nlists {
            let n_strx = nl.n_strx.get(LE) as usize;
            let name = if n_strx == 0 {
                String::new()
            } else {
                cstr_in(strtab, n_strx)?
            };
            symbols.push(ModuleSymbol {
                name,
                n_type: nl.n_type,
                n_sect: nl.n_sect,
                n_desc: nl.n_desc.get(LE),
                n_value: nl.n_value.get(LE),
                addr: None,
                got_addr: None,
            });
        }
    }

    let mut indirect = Vec::new();
    if let Some((isymoff, nisyms)) = dysym {
        indirect.reserve(nisyms as usize);
        for i in 0..nisyms as usize {
            indirect.push(read_u32(image, isymoff as usize + i * 4).with_context(|| {
                format!("{name}: indirect symbol table truncated at entry {i}")
            })?);
        }
    }

    Ok((
        FormatInfo {
            cputype,
            sections,
            symtab,
            indirect,
        },
        symbols,
    ))
}

/// A decoded relocation entry.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    /// Offset of the relocation site within its section.
    pub r_address: u32,
    /// Symbol index, or 1-based section ordinal when `r_extern` is unset.
    pub r_symbolnum: u32,
    pub r_pcrel: bool,
    /// Site width as a power-of-two exponent (0..=3).
    pub r_length: u8,
    pub r_extern: bool,
    pub r_type: u32,
}

/// Unpacks the two raw relocation words. Pure, so the bit layout is
/// testable on its own.
pub fn decode_relocation(word0: u32, word1: u32) -> Result<RelocEntry> {
    ensure!(
        word0 & macho::R_SCATTERED == 0,
        "scattered relocation entries are not part of the 64-bit format"
    );
    Ok(RelocEntry {
        r_address: word0,
        r_symbolnum: word1 & 0x00ff_ffff,
        r_pcrel: word1 & (1 << 24) != 0,
        r_length: ((word1 >> 25) & 0x3) as u8,
        r_extern: word1 & (1 << 27) != 0,
        r_type: word1 >> 28,
    })
}

/// Reads a section's relocation list from the image.
pub fn relocations(image: &[u8], meta: &SectionMeta, name: &str) -> Result<Vec<RelocEntry>> {
    let mut entries = Vec::with_capacity(meta.nreloc as usize);
    for i in 0..meta.nreloc as usize {
        let off = meta.reloff as usize + i * 8;
        let word0 = read_u32(image, off)
            .with_context(|| format!("{name}: relocation list of {} truncated", meta.sectname))?;
        let word1 = read_u32(image, off + 4)
            .with_context(|| format!("{name}: relocation list of {} truncated", meta.sectname))?;
        entries.push(
            decode_relocation(word0, word1)
                .with_context(|| format!("{name}: in section {}", meta.sectname))?,
        );
    }
    Ok(entries)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow!("read of 4 bytes at offset {offset} out of bounds"))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn bytes_at<'a>(data: &'a [u8], offset: usize, len: usize, name: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| anyhow!("{name}: {len} bytes at offset {offset} out of bounds"))
}

fn struct_at<'a, T: pod::Pod>(data: &'a [u8], offset: usize, name: &str) -> Result<&'a T> {
    let bytes = data
        .get(offset..)
        .ok_or_else(|| anyhow!("{name}: structure at offset {offset} out of bounds"))?;
    pod::from_bytes(bytes)
        .map(|(value, _)| value)
        .map_err(|()| anyhow!("{name}: structure at offset {offset} out of bounds"))
}

fn slice_at<'a, T: pod::Pod>(
    data: &'a [u8],
    offset: usize,
    count: usize,
    name: &str,
) -> Result<&'a [T]> {
    let bytes = data
        .get(offset..)
        .ok_or_else(|| anyhow!("{name}: table at offset {offset} out of bounds"))?;
    pod::slice_from_bytes(bytes, count)
        .map(|(slice, _)| slice)
        .map_err(|()| anyhow!("{name}: table of {count} entries at offset {offset} out of bounds"))
}

/// Decodes a fixed 16-byte name field.
fn fixed_str(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn cstr_in(strtab: &[u8], offset: usize) -> Result<String> {
    let tail = strtab
        .get(offset..)
        .ok_or_else(|| anyhow!("symbol name offset {offset} beyond the string table"))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("unterminated symbol name at offset {offset}"))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}
