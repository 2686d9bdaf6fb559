//! Run-time layout of a loaded module.
//!
//! Sections from the image are grouped by permission class into page-rounded
//! segments (or mapped one-by-one on the constrained profile); this module
//! holds the structures describing where everything ended up.

use object::macho;

use crate::image::SectionMeta;
use crate::mmap::MemoryMap;

/// Permission-relevant classification of a section, decided by its reserved
/// name. Unrecognized names default to writable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    CodeOrRoData,
    WritableData,
    Other,
}

pub fn classify_section(sectname: &str) -> SectionKind {
    match sectname {
        "__text" => SectionKind::CodeOrRoData,
        "__const" | "__data" | "__bss" | "__common" | "__mod_init_func" => {
            SectionKind::WritableData
        }
        _ => SectionKind::Other,
    }
}

/// Aggregation class used when packing sections into segments. Gigabyte
/// zero-fill sections may only share a segment with their own kind, so they
/// get a class of their own, placed after everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    Text,
    Data,
    Zerofill,
}

pub const SEGMENT_CLASSES: [SegmentClass; 3] =
    [SegmentClass::Text, SegmentClass::Data, SegmentClass::Zerofill];

pub fn segment_class(meta: &SectionMeta) -> SegmentClass {
    if meta.section_type() == macho::S_GB_ZEROFILL {
        SegmentClass::Zerofill
    } else if classify_section(&meta.sectname) == SectionKind::CodeOrRoData {
        SegmentClass::Text
    } else {
        SegmentClass::Data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentProt {
    ReadExec,
    ReadWrite,
}

/// A page-rounded region holding sections of one permission class, laid out
/// in file order.
#[derive(Debug)]
pub struct Segment {
    pub start: u64,
    pub size: u64,
    pub prot: SegmentProt,
    /// Indices of the sections placed in this segment, in file order.
    pub sections: Vec<usize>,
}

/// A branch trampoline: an absolute target word followed by a two-instruction
/// indirect jump, placed in the owning section's scratch space. One per
/// distinct target address.
#[derive(Debug, Clone, Copy)]
pub struct Stub {
    pub target: u64,
    /// Address of the trampoline code (the target word sits 8 bytes below).
    pub addr: u64,
}

/// One loaded section.
#[derive(Debug)]
pub struct Section {
    /// Run-time start address; zero for sections that occupy no memory.
    pub addr: u64,
    pub size: u64,
    pub kind: SectionKind,
    /// Backing mapping when the section was mapped on its own (constrained
    /// profile); sections inside a segment have no mapping of their own.
    pub alloc: Option<MemoryMap>,
    /// Trampoline scratch directly after the section bytes.
    pub stub_base: u64,
    pub stub_size: u64,
    pub stubs: Vec<Stub>,
}

impl Section {
    pub fn empty(kind: SectionKind) -> Section {
        Section {
            addr: 0,
            size: 0,
            kind,
            alloc: None,
            stub_base: 0,
            stub_size: 0,
            stubs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(sectname: &str, flags: u32) -> SectionMeta {
        SectionMeta {
            sectname: sectname.to_string(),
            segname: String::new(),
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
        }
    }

    #[test]
    fn test_classifier_uses_reserved_names() {
        assert_eq!(classify_section("__text"), SectionKind::CodeOrRoData);
        assert_eq!(classify_section("__data"), SectionKind::WritableData);
        assert_eq!(classify_section("__mod_init_func"), SectionKind::WritableData);
        assert_eq!(classify_section("__strange"), SectionKind::Other);
    }

    #[test]
    fn test_segment_classes() {
        assert_eq!(segment_class(&meta("__text", 0)), SegmentClass::Text);
        assert_eq!(segment_class(&meta("__data", 0)), SegmentClass::Data);
        assert_eq!(segment_class(&meta("__strange", 0)), SegmentClass::Data);
        assert_eq!(
            segment_class(&meta("__huge", macho::S_GB_ZEROFILL)),
            SegmentClass::Zerofill
        );
    }
}
