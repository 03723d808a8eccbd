//! The orchestrator. An [`ElfImageBuilder`] owns the section descriptors for
//! one output image, pre-registers the anchor symbols and mandatory dynamic
//! tags, and drives the two phases: [`init`](ElfImageBuilder::init) computes
//! the layout plan, [`write`](ElfImageBuilder::write) emits the file.
//!
//! `.text` holds relative references into `.rodata` (and, when present,
//! `.bss`), so those sections travel together instead of following the
//! traditional segment grouping. The resulting file order is:
//!
//! file header, program headers, `.dynsym`, `.dynstr`, `.hash`, any
//! SHF_ALLOC raw sections (`.eh_frame`/`.eh_frame_hdr`), `.rodata`, `.text`,
//! `.dynamic` (sharing `.bss`'s file offset when `.bss` exists), `.symtab`
//! and `.strtab` when debug symbols were requested, the remaining raw
//! sections, `.shstrtab`, and finally the section-header table.
//!
//! The runtime finds the payload through `.dynsym`: `oatdata` spans
//! `.rodata`, `oatexec` spans `.text`, `oatlastword` marks the last word of
//! code, and `oatbss`/`oatbsslastword` do the same for `.bss` when it is
//! non-empty.

use crate::arch::arch_info;
use crate::arch::ArchInfo;
use crate::arch::InstructionSet;
use crate::dynamic::DynamicTable;
use crate::elf::ElfTypes;
use crate::elf_writer;
use crate::error::Result;
use crate::file_writer::Output;
use crate::layout;
use crate::layout::Layout;
use crate::layout::LayoutInputs;
use crate::section::CodeSection;
use crate::section::RawSection;
use crate::section::Section;
use crate::section::SectionId;
use crate::symtab::SymbolTable;
use anyhow::bail;
use object::elf;
use std::marker::PhantomData;
use std::mem::size_of;

/// The compiler's side of the handshake: it streams the `.rodata` and
/// `.text` bytes itself once told where they land.
pub trait CodePayload {
    /// Receives the final file offset of `.rodata`, before `write` runs.
    /// The payload may use it to compute absolute addresses in the image.
    fn set_code_offset(&mut self, offset: u64);

    /// Emits the `.rodata` bytes immediately followed by the `.text` bytes.
    /// The total must equal the sum of the sizes the builder was constructed
    /// with.
    fn write(&mut self, out: &mut dyn Output) -> Result;
}

/// Placement of one payload-provided content range.
#[derive(Clone, Copy, Debug, Default)]
pub struct Extent {
    /// Offset of this content within the payload blob.
    pub relative_offset: u64,
    pub size: u64,
}

impl Extent {
    pub fn new(relative_offset: u64, size: u64) -> Extent {
        Extent {
            relative_offset,
            size,
        }
    }
}

pub struct ElfImageBuilder<'a, E: ElfTypes, O: Output> {
    payload: &'a mut dyn CodePayload,
    out: &'a mut O,
    isa: InstructionSet,
    /// `None` when the instruction set could not be mapped; `init` then
    /// fails.
    arch: Option<ArchInfo>,
    include_debug_symbols: bool,
    debug_logging: bool,
    rodata: CodeSection,
    text: CodeSection,
    bss: CodeSection,
    dynsym: SymbolTable,
    symtab: SymbolTable,
    hash: Section,
    dynamic: DynamicTable,
    shstrtab: Section,
    raw_sections: Vec<&'a RawSection>,
    layout: Option<Layout>,
    marker: PhantomData<E>,
}

pub type ElfImageBuilder32<'a, O> = ElfImageBuilder<'a, crate::elf::Elf32, O>;
pub type ElfImageBuilder64<'a, O> = ElfImageBuilder<'a, crate::elf::Elf64, O>;

impl<'a, E: ElfTypes, O: Output> ElfImageBuilder<'a, E, O> {
    /// A `bss` size of zero drops the `.bss` section, its program header and
    /// its anchor symbols. `include_debug_symbols` admits `.symtab`/`.strtab`
    /// if any symbols are actually added before `init`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payload: &'a mut dyn CodePayload,
        out: &'a mut O,
        isa: InstructionSet,
        rodata: Extent,
        text: Extent,
        bss: Extent,
        include_debug_symbols: bool,
        debug_logging: bool,
    ) -> Self {
        let mut dynsym = SymbolTable::new(
            ".dynsym",
            elf::SHT_DYNSYM,
            ".dynstr",
            SectionId::Dynstr,
            true,
        );
        let symtab = SymbolTable::new(
            ".symtab",
            elf::SHT_SYMTAB,
            ".strtab",
            SectionId::Strtab,
            false,
        );
        let hash = Section::new(
            ".hash",
            elf::SHT_HASH,
            u64::from(elf::SHF_ALLOC),
            Some(SectionId::Dynsym),
            0,
            size_of::<u32>() as u64,
            size_of::<u32>() as u64,
        );
        let mut dynamic = DynamicTable::new(".dynamic", SectionId::Dynsym);
        let shstrtab = Section::new(".shstrtab", elf::SHT_STRTAB, 0, None, 0, 1, 1);

        let rodata = CodeSection::new(
            ".rodata",
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC),
            rodata.size,
            rodata.relative_offset,
        );
        let text = CodeSection::new(
            ".text",
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            text.size,
            text.relative_offset,
        );
        let bss = CodeSection::new(
            ".bss",
            elf::SHT_NOBITS,
            u64::from(elf::SHF_ALLOC),
            bss.size,
            bss.relative_offset,
        );

        // Mandatory tags whose values only settle during layout. DT_STRSZ,
        // DT_SONAME and DT_NULL are appended when the table is materialized.
        dynamic.add_for_section(elf::DT_HASH, 0, SectionId::Hash);
        dynamic.add_for_section(elf::DT_STRTAB, 0, SectionId::Dynstr);
        dynamic.add_for_section(elf::DT_SYMTAB, 0, SectionId::Dynsym);
        dynamic.add(elf::DT_SYMENT, size_of::<E::Sym>() as u64);

        // Anchor symbols the runtime looks up to locate the payload.
        dynsym.add_symbol(
            "oatdata",
            SectionId::Rodata,
            0,
            true,
            rodata.size(),
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            0,
        );
        dynsym.add_symbol(
            "oatexec",
            SectionId::Text,
            0,
            true,
            text.size(),
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            0,
        );
        dynsym.add_symbol(
            "oatlastword",
            SectionId::Text,
            text.size() - 4,
            true,
            4,
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            0,
        );
        if bss.size() != 0 {
            dynsym.add_symbol(
                "oatbss",
                SectionId::Bss,
                0,
                true,
                bss.size(),
                elf::STB_GLOBAL,
                elf::STT_OBJECT,
                0,
            );
            dynsym.add_symbol(
                "oatbsslastword",
                SectionId::Bss,
                bss.size() - 4,
                true,
                4,
                elf::STB_GLOBAL,
                elf::STT_OBJECT,
                0,
            );
        }

        ElfImageBuilder {
            payload,
            out,
            isa,
            arch: arch_info(isa).ok(),
            include_debug_symbols,
            debug_logging,
            rodata,
            text,
            bss,
            dynsym,
            symtab,
            hash,
            dynamic,
            shstrtab,
            raw_sections: Vec::new(),
            layout: None,
            marker: PhantomData,
        }
    }

    pub fn text(&self) -> &CodeSection {
        &self.text
    }

    /// Debug symbols go here; they are only emitted when the builder was
    /// constructed with `include_debug_symbols`.
    pub fn symtab_mut(&mut self) -> &mut SymbolTable {
        &mut self.symtab
    }

    /// Extra dynamic entries beyond the mandatory set.
    pub fn dynamic_mut(&mut self) -> &mut DynamicTable {
        &mut self.dynamic
    }

    /// Registers a caller-owned section (debug info, unwind tables). The
    /// buffer is not copied; it is read during `write`. Must be called
    /// before `init`.
    pub fn register_raw_section(&mut self, section: &'a RawSection) {
        self.raw_sections.push(section);
    }

    pub fn find_raw_section(&self, name: &str) -> Option<&'a RawSection> {
        self.raw_sections
            .iter()
            .copied()
            .find(|raw| raw.name() == name)
    }

    /// Computes the layout plan. Everything must be registered by now; the
    /// plan is final once this returns.
    pub fn init(&mut self) -> Result {
        let Some(arch) = self.arch else {
            bail!(
                "cannot lay out an image for unknown instruction set {:?}",
                self.isa
            );
        };
        let include_symtab = self.include_debug_symbols && self.symtab.symbol_count() > 0;
        let layout = {
            let inputs = LayoutInputs {
                arch,
                rodata: &self.rodata,
                text: &self.text,
                bss: &self.bss,
                dynsym: &self.dynsym,
                symtab: &self.symtab,
                hash_section: &self.hash,
                dynamic: &self.dynamic,
                shstrtab_section: &self.shstrtab,
                raw_sections: &self.raw_sections,
                include_symtab,
                output_path: self.out.path(),
                debug_logging: self.debug_logging,
            };
            layout::compute::<E>(&inputs)?
        };
        self.layout = Some(layout);
        Ok(())
    }

    /// Streams the image. On failure the sink holds a partial file that the
    /// caller should discard.
    pub fn write(&mut self) -> Result {
        let Some(layout) = self.layout.as_ref() else {
            bail!("init() must succeed before write()");
        };
        elf_writer::write::<E>(
            layout,
            &self.dynsym,
            &self.symtab,
            &self.dynamic,
            &self.raw_sections,
            &mut *self.payload,
            &mut *self.out,
        )
    }
}
