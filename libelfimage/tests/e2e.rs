//! End-to-end tests: build an image into an in-memory sink, then read it
//! back the way a consumer would. Layout properties are checked against raw
//! header parsing with the `object` crate, symbol lookups against its
//! high-level read API.

use libelfimage::{
    CodePayload, Elf32, Elf64, ElfImageBuilder, Extent, FileOutput, InstructionSet, Output,
    RawSection, Result, SectionId,
};
use object::elf;
use object::read::elf::{FileHeader as _, SectionHeader as _};
use object::{LittleEndian, Object, ObjectSymbol};
use std::path::{Path, PathBuf};

const E: LittleEndian = LittleEndian;

/// Stands in for the compiler: emits a deterministic pattern for `.rodata`
/// and `.text` in one contiguous write.
struct TestPayload {
    rodata: Vec<u8>,
    text: Vec<u8>,
    code_offset: Option<u64>,
}

impl TestPayload {
    fn new(rodata_size: u64, text_size: u64) -> TestPayload {
        TestPayload {
            rodata: pattern(rodata_size, 251),
            text: pattern(text_size, 239),
            code_offset: None,
        }
    }
}

fn pattern(len: u64, modulus: u64) -> Vec<u8> {
    (0..len).map(|i| (i % modulus) as u8).collect()
}

impl CodePayload for TestPayload {
    fn set_code_offset(&mut self, offset: u64) {
        self.code_offset = Some(offset);
    }

    fn write(&mut self, out: &mut dyn Output) -> Result {
        out.write_all(&self.rodata)?;
        out.write_all(&self.text)?;
        Ok(())
    }
}

/// In-memory sink; gaps left by forward seeks read back as zeros, like the
/// holes in a freshly-created file.
struct VecOutput {
    path: PathBuf,
    data: Vec<u8>,
    pos: usize,
}

impl VecOutput {
    fn new(path: &str) -> VecOutput {
        VecOutput {
            path: PathBuf::from(path),
            data: Vec::new(),
            pos: 0,
        }
    }
}

impl Output for VecOutput {
    fn seek(&mut self, offset: u64) -> Result {
        self.pos = offset as usize;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result {
        let end = self.pos + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn build_image64(
    isa: InstructionSet,
    rodata_size: u64,
    text_size: u64,
    bss_size: u64,
    raw_sections: &[&RawSection],
    debug_symbols: &[(&str, u64, u64)],
) -> (Vec<u8>, u64) {
    let mut payload = TestPayload::new(rodata_size, text_size);
    let mut out = VecOutput::new("/tmp/libtest.so");
    {
        let mut builder = ElfImageBuilder::<Elf64, _>::new(
            &mut payload,
            &mut out,
            isa,
            Extent::new(0, rodata_size),
            Extent::new(rodata_size, text_size),
            Extent::new(rodata_size + text_size, bss_size),
            !debug_symbols.is_empty(),
            false,
        );
        for raw in raw_sections {
            builder.register_raw_section(raw);
        }
        for &(name, addr, size) in debug_symbols {
            builder.symtab_mut().add_symbol(
                name,
                SectionId::Text,
                addr,
                true,
                size,
                elf::STB_GLOBAL,
                elf::STT_FUNC,
                0,
            );
        }
        builder.init().expect("init");
        builder.write().expect("write");
    }
    (out.data, payload.code_offset.expect("payload was never told its offset"))
}

/// Reads a `(tag, value)` list out of the `.dynamic` image without caring
/// about host alignment.
fn dynamic_entries(data: &[u8]) -> Vec<(u64, u64)> {
    data.chunks_exact(16)
        .map(|chunk| {
            (
                u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
            )
        })
        .collect()
}

/// Minimal raw view of one `Sym64`.
fn symbols64(data: &[u8]) -> Vec<(u32, u64, u64)> {
    data.chunks_exact(24)
        .map(|chunk| {
            (
                u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
                u64::from_le_bytes(chunk[16..24].try_into().unwrap()),
            )
        })
        .collect()
}

fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &byte in name.as_bytes() {
        h = (h << 4).wrapping_add(u32::from(byte));
        let g = h & 0xf000_0000;
        h ^= g;
        h ^= g >> 24;
    }
    h
}

fn cstr_at(table: &[u8], offset: usize) -> &[u8] {
    let rest = &table[offset..];
    &rest[..rest.iter().position(|&b| b == 0).unwrap()]
}

#[test]
fn minimal_arm64_image() {
    let (data, code_offset) = build_image64(InstructionSet::Arm64, 4096, 4096, 0, &[], &[]);
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();

    assert_eq!(header.e_ident.magic, elf::ELFMAG);
    assert_eq!(header.e_ident.class, elf::ELFCLASS64);
    assert_eq!(header.e_ident.data, elf::ELFDATA2LSB);
    assert_eq!(header.e_type.get(E), elf::ET_DYN);
    assert_eq!(header.e_machine.get(E), elf::EM_AARCH64);
    assert_eq!(header.e_flags.get(E), 0);
    assert_eq!(header.e_entry.get(E), 0);
    assert_eq!(header.e_phnum.get(E), 6);

    let sections = header.sections(E, data).unwrap();
    let (_, rodata) = sections.section_by_name(E, b".rodata").unwrap();
    let (_, text) = sections.section_by_name(E, b".text").unwrap();
    assert_eq!(code_offset, rodata.sh_offset.get(E));

    // Four entries: the implicit undefined symbol plus the three anchors.
    let (_, dynsym) = sections.section_by_name(E, b".dynsym").unwrap();
    let syms = symbols64(dynsym.data(E, data).unwrap());
    assert_eq!(syms.len(), 4);
    assert_eq!(syms[0], (0, 0, 0));

    let file = object::File::parse(data).unwrap();
    let by_name = |name: &str| {
        file.dynamic_symbols()
            .find(|sym| sym.name().ok() == Some(name))
            .unwrap_or_else(|| panic!("no dynamic symbol {name}"))
    };
    let oatdata = by_name("oatdata");
    assert_eq!(oatdata.address(), rodata.sh_addr.get(E));
    assert_eq!(oatdata.size(), 4096);
    let oatexec = by_name("oatexec");
    assert_eq!(oatexec.address(), text.sh_addr.get(E));
    let oatlastword = by_name("oatlastword");
    assert_eq!(oatlastword.address(), text.sh_addr.get(E) + 4096 - 4);
    assert_eq!(oatlastword.size(), 4);
    assert!(file.dynamic_symbols().all(|sym| sym.name().ok() != Some("oatbss")));

    // DT_SONAME points at the sink path's basename in .dynstr.
    let (_, dynamic) = sections.section_by_name(E, b".dynamic").unwrap();
    let entries = dynamic_entries(dynamic.data(E, data).unwrap());
    let (_, dynstr) = sections.section_by_name(E, b".dynstr").unwrap();
    let strings = dynstr.data(E, data).unwrap();
    let soname = entries
        .iter()
        .find(|&&(tag, _)| tag == u64::from(elf::DT_SONAME))
        .unwrap()
        .1;
    assert_eq!(cstr_at(strings, soname as usize), b"libtest.so");
    assert_eq!(*entries.last().unwrap(), (u64::from(elf::DT_NULL), 0));
    let strsz = entries
        .iter()
        .find(|&&(tag, _)| tag == u64::from(elf::DT_STRSZ))
        .unwrap()
        .1;
    assert_eq!(strsz, strings.len() as u64);

    // The payload pattern landed where the headers say it did.
    let rodata_offset = rodata.sh_offset.get(E) as usize;
    assert_eq!(&data[rodata_offset..rodata_offset + 4096], pattern(4096, 251));
    let text_offset = text.sh_offset.get(E) as usize;
    assert_eq!(&data[text_offset..text_offset + 4096], pattern(4096, 239));
}

#[test]
fn image_bounds_and_mapping_invariants() {
    let (data, _) = build_image64(InstructionSet::X86_64, 4096, 8192, 0, &[], &[]);
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();
    let sections = header.sections(E, data).unwrap();

    let (_, rodata) = sections.section_by_name(E, b".rodata").unwrap();
    let (_, text) = sections.section_by_name(E, b".text").unwrap();
    let phdr_end =
        header.e_phoff.get(E) + u64::from(header.e_phnum.get(E)) * u64::from(header.e_phentsize.get(E));
    assert!(phdr_end <= rodata.sh_offset.get(E));
    let rodata_end = rodata.sh_offset.get(E) + rodata.sh_size.get(E);
    assert_eq!(rodata_end % 0x1000, 0);
    assert_eq!(rodata_end, text.sh_offset.get(E));
    assert!(text.sh_offset.get(E) + text.sh_size.get(E) <= data.len() as u64);

    for (i, section) in sections.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let align = section.sh_addralign.get(E).max(1);
        assert_eq!(section.sh_offset.get(E) % align, 0);
        if section.sh_flags.get(E) & u64::from(elf::SHF_ALLOC) != 0 {
            assert_eq!(section.sh_addr.get(E), section.sh_offset.get(E));
        } else {
            assert_eq!(section.sh_addr.get(E), 0);
        }
    }
}

#[test]
fn anchor_symbols_are_reachable_through_the_hash_table() {
    let (data, _) = build_image64(InstructionSet::Arm64, 4096, 4096, 4096, &[], &[]);
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();
    let sections = header.sections(E, data).unwrap();

    let (_, hash_section) = sections.section_by_name(E, b".hash").unwrap();
    let words: Vec<u32> = hash_section
        .data(E, data)
        .unwrap()
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let nbuckets = words[0];
    let nchain = words[1];
    // Undefined symbol plus five anchors.
    assert_eq!(nchain, 6);
    let buckets = &words[2..2 + nbuckets as usize];
    let chain = &words[2 + nbuckets as usize..];

    let (_, dynsym) = sections.section_by_name(E, b".dynsym").unwrap();
    let syms = symbols64(dynsym.data(E, data).unwrap());
    let (_, dynstr) = sections.section_by_name(E, b".dynstr").unwrap();
    let strings = dynstr.data(E, data).unwrap();

    for name in ["oatdata", "oatexec", "oatlastword", "oatbss", "oatbsslastword"] {
        let mut index = buckets[(elf_hash(name) % nbuckets) as usize];
        let mut steps = 0;
        loop {
            assert_ne!(index, 0, "lookup of {name} fell off the chain");
            assert!(steps < nchain, "chain loop while looking up {name}");
            if cstr_at(strings, syms[index as usize].0 as usize) == name.as_bytes() {
                break;
            }
            index = chain[index as usize];
            steps += 1;
        }
    }
}

#[test]
fn bss_gets_its_own_load_segment() {
    let (data, _) = build_image64(InstructionSet::X86_64, 4096, 8192, 4096, &[], &[]);
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();

    assert_eq!(header.e_machine.get(E), elf::EM_X86_64);
    assert_eq!(header.e_phnum.get(E), 7);

    let phdrs = header.program_headers(E, data).unwrap();
    assert_eq!(phdrs[0].p_type.get(E), elf::PT_PHDR);
    let bss_load = phdrs
        .iter()
        .find(|p| p.p_type.get(E) == elf::PT_LOAD && p.p_filesz.get(E) == 0)
        .expect("no NOBITS load segment");
    assert_eq!(bss_load.p_memsz.get(E), 4096);
    assert_eq!(bss_load.p_flags.get(E), elf::PF_R | elf::PF_W);

    let sections = header.sections(E, data).unwrap();
    let (_, bss) = sections.section_by_name(E, b".bss").unwrap();
    assert_eq!(bss.sh_type.get(E), elf::SHT_NOBITS);
    assert_eq!(bss_load.p_vaddr.get(E), bss.sh_addr.get(E));

    // .dynamic shares .bss's file offset but is mapped past its memory
    // image, so the two R+W segments do not collide.
    let (_, dynamic) = sections.section_by_name(E, b".dynamic").unwrap();
    assert_eq!(dynamic.sh_offset.get(E), bss.sh_offset.get(E));
    assert_eq!(dynamic.sh_addr.get(E), bss.sh_addr.get(E) + 4096);
    let dyn_load = phdrs
        .iter()
        .find(|p| p.p_type.get(E) == elf::PT_DYNAMIC)
        .unwrap();
    assert_eq!(dyn_load.p_offset.get(E), dynamic.sh_offset.get(E));
    assert_eq!(dyn_load.p_vaddr.get(E), dynamic.sh_addr.get(E));

    let file = object::File::parse(data).unwrap();
    let oatbss = file
        .dynamic_symbols()
        .find(|sym| sym.name().ok() == Some("oatbss"))
        .unwrap();
    assert_eq!(oatbss.address(), bss.sh_addr.get(E));
    assert_eq!(oatbss.size(), 4096);
    let oatbsslastword = file
        .dynamic_symbols()
        .find(|sym| sym.name().ok() == Some("oatbsslastword"))
        .unwrap();
    assert_eq!(oatbsslastword.address(), bss.sh_addr.get(E) + 4096 - 4);
}

#[test]
fn arm_image_with_unwind_sections() {
    let mut eh_frame = RawSection::new(
        ".eh_frame",
        elf::SHT_PROGBITS,
        u64::from(elf::SHF_ALLOC),
        None,
        0,
        4,
        0,
    );
    eh_frame.set_data(pattern(200, 121));
    let mut eh_frame_hdr = RawSection::new(
        ".eh_frame_hdr",
        elf::SHT_PROGBITS,
        u64::from(elf::SHF_ALLOC),
        None,
        0,
        4,
        0,
    );
    eh_frame_hdr.set_data(pattern(24, 7));

    let mut payload = TestPayload::new(4096, 4096);
    let mut out = VecOutput::new("/tmp/libarm.so");
    {
        let mut builder = ElfImageBuilder::<Elf32, _>::new(
            &mut payload,
            &mut out,
            InstructionSet::Arm,
            Extent::new(0, 4096),
            Extent::new(4096, 4096),
            Extent::new(8192, 0),
            false,
            false,
        );
        builder.register_raw_section(&eh_frame);
        builder.register_raw_section(&eh_frame_hdr);
        assert!(builder.find_raw_section(".eh_frame_hdr").is_some());
        assert!(builder.find_raw_section(".debug_info").is_none());
        builder.init().expect("init");
        builder.write().expect("write");
    }
    let data = out.data.as_slice();

    let header = elf::FileHeader32::<LittleEndian>::parse(data).unwrap();
    assert_eq!(header.e_ident.class, elf::ELFCLASS32);
    assert_eq!(header.e_machine.get(E), elf::EM_ARM);
    assert_eq!(header.e_flags.get(E), elf::EF_ARM_EABI_VER5);

    let sections = header.sections(E, data).unwrap();
    let (_, frame) = sections.section_by_name(E, b".eh_frame").unwrap();
    let (_, frame_hdr) = sections.section_by_name(E, b".eh_frame_hdr").unwrap();
    let (_, rodata) = sections.section_by_name(E, b".rodata").unwrap();
    assert_eq!(
        frame.sh_offset.get(E) + 200,
        frame_hdr.sh_offset.get(E),
        "unwind data and its header must be back to back"
    );
    assert!(frame_hdr.sh_offset.get(E) + 24 <= rodata.sh_offset.get(E));
    assert_eq!(frame.data(E, data).unwrap(), pattern(200, 121));
    assert_eq!(frame_hdr.data(E, data).unwrap(), pattern(24, 7));

    let phdrs = header.program_headers(E, data).unwrap();
    assert_eq!(phdrs.len(), 6);
    let eh = phdrs
        .iter()
        .find(|p| p.p_type.get(E) == elf::PT_GNU_EH_FRAME)
        .expect("no PT_GNU_EH_FRAME");
    assert_eq!(u64::from(eh.p_offset.get(E)), u64::from(frame_hdr.sh_offset.get(E)));
    assert_eq!(eh.p_filesz.get(E), 24);
}

#[test]
fn debug_symbols_round_trip() {
    let (data, _) = build_image64(
        InstructionSet::Arm64,
        4096,
        4096,
        0,
        &[],
        &[("entry", 0x10, 12), ("helper", 0x40, 8)],
    );
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();
    let sections = header.sections(E, data).unwrap();

    let (_, symtab) = sections.section_by_name(E, b".symtab").unwrap();
    let syms = symbols64(symtab.data(E, data).unwrap());
    assert_eq!(syms.len(), 3);
    assert_eq!(syms[0], (0, 0, 0));

    let (_, strtab) = sections.section_by_name(E, b".strtab").unwrap();
    let strings = strtab.data(E, data).unwrap();
    assert!(strings.starts_with(b"\0entry\0helper\0"));

    // Debug sections live past the mapped image, after .dynamic.
    let (_, dynamic) = sections.section_by_name(E, b".dynamic").unwrap();
    assert!(symtab.sh_offset.get(E) >= dynamic.sh_offset.get(E) + dynamic.sh_size.get(E));
    assert!(strtab.sh_offset.get(E) > symtab.sh_offset.get(E));
    assert_eq!(symtab.sh_addr.get(E), 0);
    assert_eq!(strtab.sh_addr.get(E), 0);

    let (_, text) = sections.section_by_name(E, b".text").unwrap();
    let file = object::File::parse(data).unwrap();
    let entry = file
        .symbols()
        .find(|sym| sym.name().ok() == Some("entry"))
        .expect("no symtab entry for `entry`");
    assert_eq!(entry.address(), text.sh_offset.get(E) + 0x10);
    assert_eq!(entry.size(), 12);
}

#[test]
fn identical_inputs_produce_identical_bytes() {
    let (first, _) = build_image64(InstructionSet::X86_64, 4096, 8192, 4096, &[], &[]);
    let (second, _) = build_image64(InstructionSet::X86_64, 4096, 8192, 4096, &[], &[]);
    assert_eq!(first, second);
}

#[test]
fn unknown_isa_fails_at_init() {
    let mut payload = TestPayload::new(4096, 4096);
    let mut out = VecOutput::new("/tmp/libnone.so");
    let mut builder = ElfImageBuilder::<Elf64, _>::new(
        &mut payload,
        &mut out,
        InstructionSet::None,
        Extent::new(0, 4096),
        Extent::new(4096, 4096),
        Extent::new(8192, 0),
        false,
        false,
    );
    assert!(builder.init().is_err());
    assert!(builder.write().is_err());
}

#[test]
fn writes_a_parseable_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("libdisk.so");
    let mut payload = TestPayload::new(4096, 4096);
    let mut out = FileOutput::create(&path).unwrap();
    {
        let mut builder = ElfImageBuilder::<Elf64, _>::new(
            &mut payload,
            &mut out,
            InstructionSet::Arm64,
            Extent::new(0, 4096),
            Extent::new(4096, 4096),
            Extent::new(8192, 0),
            false,
            false,
        );
        builder.init().expect("init");
        builder.write().expect("write");
    }
    drop(out);

    let data = std::fs::read(&path).unwrap();
    let data = data.as_slice();
    let header = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();
    assert_eq!(header.e_machine.get(E), elf::EM_AARCH64);

    let sections = header.sections(E, data).unwrap();
    let (_, dynamic) = sections.section_by_name(E, b".dynamic").unwrap();
    let entries = dynamic_entries(dynamic.data(E, data).unwrap());
    let (_, dynstr) = sections.section_by_name(E, b".dynstr").unwrap();
    let strings = dynstr.data(E, data).unwrap();
    let soname = entries
        .iter()
        .find(|&&(tag, _)| tag == u64::from(elf::DT_SONAME))
        .unwrap()
        .1;
    assert_eq!(cstr_at(strings, soname as usize), b"libdisk.so");
}
