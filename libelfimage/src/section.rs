//! The section descriptor family. Descriptors carry everything that is
//! known about a section before layout runs; assigned indices, offsets and
//! addresses live in the layout plan, not here.

use crate::elf::PAGE_SIZE;
use object::elf;
use std::borrow::Cow;

/// Names one of the image's sections. Symbols and dynamic tags refer to
/// sections through this id and the layout plan resolves it to an assigned
/// section index and file offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionId {
    Dynsym,
    Dynstr,
    Hash,
    Rodata,
    Text,
    Bss,
    Dynamic,
    Symtab,
    Strtab,
    Shstrtab,
    /// A caller-registered raw section, by registration order.
    Raw(usize),
}

/// Template for a section header.
#[derive(Clone, Debug)]
pub(crate) struct Section {
    pub(crate) name: Cow<'static, str>,
    pub(crate) sh_type: u32,
    pub(crate) flags: u64,
    pub(crate) link: Option<SectionId>,
    pub(crate) info: u32,
    pub(crate) addralign: u64,
    /// Fixed entry size. Left at zero for tables whose entry size depends on
    /// the ELF class; layout fills those in.
    pub(crate) entsize: u64,
}

impl Section {
    pub(crate) fn new(
        name: impl Into<Cow<'static, str>>,
        sh_type: u32,
        flags: u64,
        link: Option<SectionId>,
        info: u32,
        addralign: u64,
        entsize: u64,
    ) -> Section {
        Section {
            name: name.into(),
            sh_type,
            flags,
            link,
            info,
            addralign,
            entsize,
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.flags & u64::from(elf::SHF_ALLOC) != 0
    }
}

/// `.rodata`, `.text` or `.bss`: content is produced externally, so the
/// descriptor only records its size and the payload's own offset for it.
pub struct CodeSection {
    pub(crate) section: Section,
    size: u64,
    relative_offset: u64,
}

impl CodeSection {
    pub(crate) fn new(
        name: &'static str,
        sh_type: u32,
        flags: u64,
        size: u64,
        relative_offset: u64,
    ) -> CodeSection {
        CodeSection {
            section: Section::new(name, sh_type, flags, None, 0, PAGE_SIZE, 0),
            size,
            relative_offset,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of this content within the payload blob. Recorded for callers;
    /// file layout does not depend on it.
    pub fn relative_offset(&self) -> u64 {
        self.relative_offset
    }
}

/// A section whose bytes the caller supplies directly (debug info, unwind
/// tables). Registered with the builder by reference and must outlive it.
pub struct RawSection {
    pub(crate) section: Section,
    data: Vec<u8>,
}

impl RawSection {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        sh_type: u32,
        flags: u64,
        link: Option<SectionId>,
        info: u32,
        addralign: u64,
        entsize: u64,
    ) -> RawSection {
        RawSection {
            section: Section::new(name, sh_type, flags, link, info, addralign, entsize),
            data: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.section.name
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.section.is_alloc()
    }
}
