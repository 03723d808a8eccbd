//! The Write phase: materializes the byte vectors the plan only sized
//! (symbol arrays, dynamic vector, hash words), assembles the file-piece
//! list and hands it to the piece writer. The code payload is invoked
//! exactly once, at the `.rodata` offset, and covers `.text` in the same
//! contiguous write.

use crate::builder::CodePayload;
use crate::dynamic::DynamicTable;
use crate::elf::ElfTypes;
use crate::error::Result;
use crate::file_writer::write_pieces;
use crate::file_writer::FilePiece;
use crate::file_writer::Output;
use crate::layout::Layout;
use crate::section::RawSection;
use crate::section::SectionId;
use crate::symtab::SymbolTable;
use object::pod::bytes_of;
use object::pod::bytes_of_slice;
use std::borrow::Cow;

#[tracing::instrument(skip_all, name = "Write output file")]
#[allow(clippy::too_many_arguments)]
pub(crate) fn write<E: ElfTypes>(
    layout: &Layout,
    dynsym: &SymbolTable,
    symtab: &SymbolTable,
    dynamic: &DynamicTable,
    raw_sections: &[&RawSection],
    payload: &mut dyn CodePayload,
    out: &mut dyn Output,
) -> Result {
    let mut pieces = Vec::new();

    let ehdr = E::file_header(layout.file_header);
    pieces.push(FilePiece::Memory {
        name: "file header".into(),
        offset: 0,
        data: bytes_of(&ehdr).to_vec().into(),
    });

    let phdrs: Vec<E::Phdr> = layout
        .program_headers
        .iter()
        .map(|values| E::program_header(*values))
        .collect();
    pieces.push(FilePiece::Memory {
        name: "program headers".into(),
        offset: layout.file_header.phoff,
        data: bytes_of_slice(&phdrs).to_vec().into(),
    });

    let resolve = |id: SectionId| {
        let header = layout.section(id);
        (layout.index_of(id) as u16, header.offset)
    };

    let dynsym_entries = dynsym.generate_symbols::<E>(&layout.dynsym_name_offsets, resolve);
    let dynsym_bytes = bytes_of_slice(&dynsym_entries);
    assert_eq!(
        dynsym_bytes.len() as u64,
        layout.section(SectionId::Dynsym).size
    );
    pieces.push(FilePiece::Memory {
        name: ".dynsym".into(),
        offset: layout.section(SectionId::Dynsym).offset,
        data: dynsym_bytes.to_vec().into(),
    });

    pieces.push(FilePiece::Memory {
        name: ".dynstr".into(),
        offset: layout.section(SectionId::Dynstr).offset,
        data: Cow::Borrowed(&layout.dynstr),
    });

    let hash_bytes: Vec<u8> = layout
        .hash
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    pieces.push(FilePiece::Memory {
        name: ".hash".into(),
        offset: layout.section(SectionId::Hash).offset,
        data: hash_bytes.into(),
    });

    let dyn_entries = dynamic.materialize::<E>(
        layout.dynstr.len() as u64,
        u64::from(layout.soname_offset),
        |id| layout.section(id).addr,
    );
    let dyn_bytes = bytes_of_slice(&dyn_entries);
    assert_eq!(
        dyn_bytes.len() as u64,
        layout.section(SectionId::Dynamic).size
    );
    pieces.push(FilePiece::Memory {
        name: ".dynamic".into(),
        offset: layout.section(SectionId::Dynamic).offset,
        data: dyn_bytes.to_vec().into(),
    });

    let rodata = layout.section(SectionId::Rodata);
    let text = layout.section(SectionId::Text);
    pieces.push(FilePiece::Payload {
        offset: rodata.offset,
        size: rodata.size + text.size,
    });
    // The payload writes .text together with .rodata; this empty piece keeps
    // .text in the list should the two ever be streamed separately.
    pieces.push(FilePiece::Memory {
        name: ".text".into(),
        offset: text.offset,
        data: Cow::Borrowed(&[]),
    });

    if layout.include_symtab {
        let symtab_entries = symtab.generate_symbols::<E>(&layout.symtab_name_offsets, resolve);
        let symtab_bytes = bytes_of_slice(&symtab_entries);
        assert_eq!(
            symtab_bytes.len() as u64,
            layout.section(SectionId::Symtab).size
        );
        pieces.push(FilePiece::Memory {
            name: ".symtab".into(),
            offset: layout.section(SectionId::Symtab).offset,
            data: symtab_bytes.to_vec().into(),
        });
        pieces.push(FilePiece::Memory {
            name: ".strtab".into(),
            offset: layout.section(SectionId::Strtab).offset,
            data: Cow::Borrowed(&layout.strtab),
        });
    }

    for (i, raw) in raw_sections.iter().enumerate() {
        pieces.push(FilePiece::Memory {
            name: raw.name().into(),
            offset: layout.section(SectionId::Raw(i)).offset,
            data: Cow::Borrowed(raw.data()),
        });
    }

    pieces.push(FilePiece::Memory {
        name: ".shstrtab".into(),
        offset: layout.section(SectionId::Shstrtab).offset,
        data: Cow::Borrowed(&layout.shstrtab),
    });

    let shdrs: Vec<E::Shdr> = layout
        .sections
        .iter()
        .map(|planned| E::section_header(planned.header))
        .collect();
    pieces.push(FilePiece::Memory {
        name: "section headers".into(),
        offset: layout.file_header.shoff,
        data: bytes_of_slice(&shdrs).to_vec().into(),
    });

    write_pieces(out, payload, pieces)
}
