//! The Init phase: assigns section indices in a fixed order, derives the
//! string/hash tables whose sizes feed the layout, walks the fixed content
//! order assigning file offsets and virtual addresses, and settles the
//! program headers and ELF header fields. The resulting plan is immutable;
//! the write phase only reads it.
//!
//! Section *index* order and file *content* order are not the same thing.
//! Indices run `.dynsym .dynstr .hash .rodata .text [.bss] .dynamic
//! [.symtab .strtab] <raw sections> .shstrtab`, while content places the
//! SHF_ALLOC raw sections (unwind tables) between `.hash` and `.rodata` so
//! that everything mapped read-only sits in one run before the executable
//! pages.

use crate::arch::ArchInfo;
use crate::dynamic::DynamicTable;
use crate::elf::align_up;
use crate::elf::ElfTypes;
use crate::elf::FileHeaderValues;
use crate::elf::ProgramHeaderValues;
use crate::elf::SectionHeaderValues;
use crate::elf::PAGE_SIZE;
use crate::error::Result;
use crate::section::CodeSection;
use crate::section::RawSection;
use crate::section::Section;
use crate::section::SectionId;
use crate::symtab::SymbolTable;
use itertools::Itertools;
use object::elf;
use std::mem::size_of;
use std::path::Path;

/// Program header slots reserved in the file, whether or not the `.bss`
/// entry is written.
pub(crate) const PH_NUM: usize = 7;

pub(crate) struct LayoutInputs<'a> {
    pub(crate) arch: ArchInfo,
    pub(crate) rodata: &'a CodeSection,
    pub(crate) text: &'a CodeSection,
    pub(crate) bss: &'a CodeSection,
    pub(crate) dynsym: &'a SymbolTable,
    pub(crate) symtab: &'a SymbolTable,
    pub(crate) hash_section: &'a Section,
    pub(crate) dynamic: &'a DynamicTable,
    pub(crate) shstrtab_section: &'a Section,
    pub(crate) raw_sections: &'a [&'a RawSection],
    pub(crate) include_symtab: bool,
    pub(crate) output_path: &'a Path,
    pub(crate) debug_logging: bool,
}

pub(crate) struct PlannedSection {
    /// `None` only for the null section at index 0.
    pub(crate) id: Option<SectionId>,
    pub(crate) header: SectionHeaderValues,
}

/// Everything the write phase needs, fully resolved.
pub(crate) struct Layout {
    /// In section-index order; `[0]` is the null section.
    pub(crate) sections: Vec<PlannedSection>,
    /// Only the entries that are written; `.bss`'s slot is skipped when the
    /// section is empty.
    pub(crate) program_headers: Vec<ProgramHeaderValues>,
    pub(crate) file_header: FileHeaderValues,
    pub(crate) dynstr: Vec<u8>,
    pub(crate) soname_offset: u32,
    pub(crate) hash: Vec<u32>,
    pub(crate) shstrtab: Vec<u8>,
    pub(crate) strtab: Vec<u8>,
    pub(crate) dynsym_name_offsets: Vec<u32>,
    pub(crate) symtab_name_offsets: Vec<u32>,
    pub(crate) include_symtab: bool,
}

impl Layout {
    pub(crate) fn section(&self, id: SectionId) -> &SectionHeaderValues {
        header_of(&self.sections, id)
    }

    pub(crate) fn index_of(&self, id: SectionId) -> u32 {
        index_of(&self.sections, id)
    }
}

fn index_of(sections: &[PlannedSection], id: SectionId) -> u32 {
    sections
        .iter()
        .position(|s| s.id == Some(id))
        .expect("section not in layout") as u32
}

fn header_of(sections: &[PlannedSection], id: SectionId) -> &SectionHeaderValues {
    &sections[index_of(sections, id) as usize].header
}

fn header_mut(sections: &mut [PlannedSection], id: SectionId) -> &mut SectionHeaderValues {
    let index = index_of(sections, id) as usize;
    &mut sections[index].header
}

/// Appends one section to the index order, recording its name in
/// `.shstrtab` and remembering its link target for the resolution pass.
fn push_section(
    sections: &mut Vec<PlannedSection>,
    shstrtab: &mut Vec<u8>,
    links: &mut Vec<(usize, SectionId)>,
    id: SectionId,
    section: &Section,
    size: u64,
    entsize: u64,
) {
    let name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(section.name.as_bytes());
    shstrtab.push(0);
    if let Some(link) = section.link {
        links.push((sections.len(), link));
    }
    sections.push(PlannedSection {
        id: Some(id),
        header: SectionHeaderValues {
            name,
            ty: section.sh_type,
            flags: section.flags,
            addr: 0,
            offset: 0,
            size,
            link: 0,
            info: section.info,
            addralign: section.addralign,
            entsize,
        },
    });
}

/// Assigns the next file offset in content order. SHF_ALLOC sections are
/// mapped 1:1, so they take their offset as their address too.
fn place(sections: &mut [PlannedSection], id: SectionId, cursor: &mut u64) -> (u64, u64) {
    let header = header_mut(sections, id);
    header.offset = align_up(*cursor, header.addralign);
    if header.flags & u64::from(elf::SHF_ALLOC) != 0 {
        header.addr = header.offset;
    }
    *cursor = header.offset + header.size;
    (header.offset, header.size)
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<E: ElfTypes>(inputs: &LayoutInputs) -> Result<Layout> {
    let sym_size = size_of::<E::Sym>() as u64;
    let dyn_size = size_of::<E::Dyn>() as u64;

    // Derive the tables whose byte sizes the layout depends on. The SONAME
    // goes into .dynstr right after the symbol names.
    let (mut dynstr, dynsym_name_offsets) = inputs.dynsym.generate_strtab();
    let soname_offset = dynstr.len() as u32;
    let file_name = inputs
        .output_path
        .file_name()
        .unwrap_or_else(|| inputs.output_path.as_os_str());
    dynstr.extend_from_slice(file_name.to_string_lossy().as_bytes());
    dynstr.push(0);

    let hash = inputs.dynsym.generate_hash();

    let (strtab, symtab_name_offsets) = if inputs.include_symtab {
        inputs.symtab.generate_strtab()
    } else {
        (Vec::new(), Vec::new())
    };

    if inputs.debug_logging {
        tracing::debug!(
            dynstr_size = dynstr.len(),
            dynsym_entries = inputs.dynsym.num_entries(),
            hash_words = hash.len(),
            "dynamic tables sized"
        );
    }

    // Section index assignment.
    let mut shstrtab = vec![0u8];
    let mut sections = vec![PlannedSection {
        id: None,
        header: SectionHeaderValues::default(),
    }];
    let mut links = Vec::new();

    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Dynsym,
        &inputs.dynsym.section,
        inputs.dynsym.num_entries() * sym_size,
        sym_size,
    );
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Dynstr,
        &inputs.dynsym.strtab,
        dynstr.len() as u64,
        inputs.dynsym.strtab.entsize,
    );
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Hash,
        inputs.hash_section,
        hash.len() as u64 * size_of::<u32>() as u64,
        inputs.hash_section.entsize,
    );
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Rodata,
        &inputs.rodata.section,
        inputs.rodata.size(),
        0,
    );
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Text,
        &inputs.text.section,
        inputs.text.size(),
        0,
    );
    if inputs.bss.size() != 0 {
        push_section(
            &mut sections,
            &mut shstrtab,
            &mut links,
            SectionId::Bss,
            &inputs.bss.section,
            inputs.bss.size(),
            0,
        );
    }
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Dynamic,
        &inputs.dynamic.section,
        inputs.dynamic.num_entries() * dyn_size,
        dyn_size,
    );
    if inputs.include_symtab {
        push_section(
            &mut sections,
            &mut shstrtab,
            &mut links,
            SectionId::Symtab,
            &inputs.symtab.section,
            inputs.symtab.num_entries() * sym_size,
            sym_size,
        );
        push_section(
            &mut sections,
            &mut shstrtab,
            &mut links,
            SectionId::Strtab,
            &inputs.symtab.strtab,
            strtab.len() as u64,
            1,
        );
    }
    for (i, raw) in inputs.raw_sections.iter().enumerate() {
        push_section(
            &mut sections,
            &mut shstrtab,
            &mut links,
            SectionId::Raw(i),
            &raw.section,
            raw.data().len() as u64,
            raw.section.entsize,
        );
    }
    push_section(
        &mut sections,
        &mut shstrtab,
        &mut links,
        SectionId::Shstrtab,
        inputs.shstrtab_section,
        0,
        inputs.shstrtab_section.entsize,
    );
    // .shstrtab's own name was the last addition, so its size is now final.
    let shstrtab_index = sections.len() - 1;
    sections[shstrtab_index].header.size = shstrtab.len() as u64;

    for &(slot, target) in &links {
        sections[slot].header.link = index_of(&sections, target);
    }

    // File offsets, in content order. Seven program header slots are always
    // reserved ahead of the first section.
    let base = (size_of::<E::Ehdr>() + size_of::<E::Phdr>() * PH_NUM) as u64;
    let mut cursor = base;
    place(&mut sections, SectionId::Dynsym, &mut cursor);
    place(&mut sections, SectionId::Dynstr, &mut cursor);
    place(&mut sections, SectionId::Hash, &mut cursor);

    // Unwind data is placed with the rest of the read-only segment, ahead of
    // .rodata: .eh_frame holds references into .text that get patched
    // between Init and Write, and .rodata must directly precede .text.
    let alloc_raws = inputs
        .raw_sections
        .iter()
        .enumerate()
        .filter(|(_, raw)| raw.is_alloc())
        .map(|(i, _)| i)
        .collect_vec();
    for i in alloc_raws {
        place(&mut sections, SectionId::Raw(i), &mut cursor);
    }

    let (rodata_offset, rodata_size) = place(&mut sections, SectionId::Rodata, &mut cursor);
    let rodata_end = rodata_offset + rodata_size;
    assert_eq!(
        rodata_end % PAGE_SIZE,
        0,
        ".rodata must end on a page boundary so .text can follow with no gap"
    );
    let (text_offset, text_size) = place(&mut sections, SectionId::Text, &mut cursor);
    let text_end = text_offset + text_size;

    // .bss owns no file bytes, so .dynamic reuses its file offset while its
    // mapped address lands past the .bss memory image.
    let bss_offset = align_up(text_end, PAGE_SIZE);
    let bss_size = inputs.bss.size();
    if bss_size != 0 {
        let header = header_mut(&mut sections, SectionId::Bss);
        header.offset = bss_offset;
        header.addr = bss_offset;
    }
    {
        let header = header_mut(&mut sections, SectionId::Dynamic);
        debug_assert_eq!(bss_offset % header.addralign, 0);
        header.offset = bss_offset;
        header.addr = align_up(bss_offset + bss_size, header.addralign);
        cursor = header.offset + header.size;
    }

    if inputs.include_symtab {
        place(&mut sections, SectionId::Symtab, &mut cursor);
        place(&mut sections, SectionId::Strtab, &mut cursor);
    }
    let non_alloc_raws = inputs
        .raw_sections
        .iter()
        .enumerate()
        .filter(|(_, raw)| !raw.is_alloc())
        .map(|(i, _)| i)
        .collect_vec();
    for i in non_alloc_raws {
        place(&mut sections, SectionId::Raw(i), &mut cursor);
    }
    place(&mut sections, SectionId::Shstrtab, &mut cursor);
    let shoff = align_up(cursor, E::WORD_SIZE);

    // If unwind data is present, the loader finds it through
    // PT_GNU_EH_FRAME; the header must directly follow its frame data.
    let find_raw = |name: &str| inputs.raw_sections.iter().position(|r| r.name() == name);
    let eh_frame_hdr_pos = find_raw(".eh_frame_hdr");
    if let Some(hdr_pos) = eh_frame_hdr_pos {
        let frame_pos = find_raw(".eh_frame").expect(".eh_frame_hdr registered without .eh_frame");
        let frame = header_of(&sections, SectionId::Raw(frame_pos));
        let hdr = header_of(&sections, SectionId::Raw(hdr_pos));
        assert!(frame.offset <= hdr.offset);
        assert_eq!(
            frame.offset + frame.size,
            hdr.offset,
            ".eh_frame and .eh_frame_hdr must be contiguous"
        );
    }

    if inputs.debug_logging {
        for planned in &sections[1..] {
            tracing::debug!(
                id = ?planned.id,
                offset = planned.header.offset,
                addr = planned.header.addr,
                size = planned.header.size,
                "section placed"
            );
        }
    }

    // Program headers.
    let phdr_offset = size_of::<E::Ehdr>() as u64;
    let phdr_size = size_of::<E::Phdr>() as u64;
    let mut program_headers = Vec::with_capacity(PH_NUM);
    program_headers.push(ProgramHeaderValues {
        ty: elf::PT_PHDR,
        flags: elf::PF_R,
        offset: phdr_offset,
        vaddr: phdr_offset,
        filesz: phdr_size * PH_NUM as u64,
        memsz: phdr_size * PH_NUM as u64,
        align: size_of::<u32>() as u64,
    });
    let rodata_align = header_of(&sections, SectionId::Rodata).addralign;
    program_headers.push(ProgramHeaderValues {
        ty: elf::PT_LOAD,
        flags: elf::PF_R,
        offset: 0,
        vaddr: 0,
        filesz: rodata_end,
        memsz: rodata_end,
        align: rodata_align,
    });
    let text_align = header_of(&sections, SectionId::Text).addralign;
    program_headers.push(ProgramHeaderValues {
        ty: elf::PT_LOAD,
        flags: elf::PF_R | elf::PF_X,
        offset: text_offset,
        vaddr: text_offset,
        filesz: text_size,
        memsz: text_size,
        align: text_align,
    });
    if bss_size != 0 {
        let bss = header_of(&sections, SectionId::Bss);
        program_headers.push(ProgramHeaderValues {
            ty: elf::PT_LOAD,
            flags: elf::PF_R | elf::PF_W,
            offset: bss.offset,
            vaddr: bss.addr,
            filesz: 0,
            memsz: bss.size,
            align: bss.addralign,
        });
    }
    let dynamic = header_of(&sections, SectionId::Dynamic);
    for ty in [elf::PT_LOAD, elf::PT_DYNAMIC] {
        program_headers.push(ProgramHeaderValues {
            ty,
            flags: elf::PF_R | elf::PF_W,
            offset: dynamic.offset,
            vaddr: dynamic.addr,
            filesz: dynamic.size,
            memsz: dynamic.size,
            align: dynamic.addralign,
        });
    }
    match eh_frame_hdr_pos {
        Some(pos) => {
            let hdr = header_of(&sections, SectionId::Raw(pos));
            program_headers.push(ProgramHeaderValues {
                ty: elf::PT_GNU_EH_FRAME,
                flags: elf::PF_R,
                offset: hdr.offset,
                vaddr: hdr.addr,
                filesz: hdr.size,
                memsz: hdr.size,
                align: hdr.addralign,
            });
        }
        None => program_headers.push(ProgramHeaderValues {
            ty: elf::PT_NULL,
            flags: elf::PF_R,
            ..ProgramHeaderValues::default()
        }),
    }

    let file_header = FileHeaderValues {
        machine: inputs.arch.machine,
        flags: inputs.arch.flags,
        phoff: phdr_offset,
        shoff,
        phnum: program_headers.len() as u16,
        shnum: sections.len() as u16,
        shstrndx: shstrtab_index as u16,
    };

    Ok(Layout {
        sections,
        program_headers,
        file_header,
        dynstr,
        soname_offset,
        hash,
        shstrtab,
        strtab,
        dynsym_name_offsets,
        symtab_name_offsets,
        include_symtab: inputs.include_symtab,
    })
}
