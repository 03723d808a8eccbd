//! Parameterization over the two ELF classes. Everything above this module
//! works with class-independent field values; the `ElfTypes` implementations
//! narrow them into the concrete `object::elf` records at emission time.

use object::elf;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64;
use std::mem::size_of;

/// Alignment of `.rodata`, `.text`, `.bss` and `.dynamic`, and the boundary
/// between LOAD segments of different permissions.
pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Values for an ELF file header. Identity bytes, object type and entry
/// point are fixed for every image we produce, so only the variable fields
/// appear here.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeaderValues {
    pub machine: u16,
    pub flags: u32,
    pub phoff: u64,
    pub shoff: u64,
    pub phnum: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Values for one program header. `p_paddr` always mirrors `p_vaddr`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgramHeaderValues {
    pub ty: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Class-independent image of a section header.
#[derive(Clone, Copy, Debug, Default)]
pub struct SectionHeaderValues {
    pub name: u32,
    pub ty: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

/// Values for one symbol table entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymbolValues {
    pub name: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

/// The record types and constructors for one ELF class.
pub trait ElfTypes: 'static {
    const CLASS: u8;
    /// Natural word size of the class; the section-header table offset is
    /// rounded up to this.
    const WORD_SIZE: u64;

    type Ehdr: object::Pod;
    type Phdr: object::Pod;
    type Shdr: object::Pod;
    type Sym: object::Pod;
    type Dyn: object::Pod;

    fn file_header(v: FileHeaderValues) -> Self::Ehdr;
    fn program_header(v: ProgramHeaderValues) -> Self::Phdr;
    fn section_header(v: SectionHeaderValues) -> Self::Shdr;
    fn symbol(v: SymbolValues) -> Self::Sym;
    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn;
}

pub struct Elf32;
pub struct Elf64;

fn ident(class: u8) -> elf::Ident {
    elf::Ident {
        magic: elf::ELFMAG,
        class,
        data: elf::ELFDATA2LSB,
        version: elf::EV_CURRENT,
        os_abi: elf::ELFOSABI_LINUX,
        abi_version: 0,
        padding: [0; 7],
    }
}

impl ElfTypes for Elf32 {
    const CLASS: u8 = elf::ELFCLASS32;
    const WORD_SIZE: u64 = 4;

    type Ehdr = elf::FileHeader32<LittleEndian>;
    type Phdr = elf::ProgramHeader32<LittleEndian>;
    type Shdr = elf::SectionHeader32<LittleEndian>;
    type Sym = elf::Sym32<LittleEndian>;
    type Dyn = elf::Dyn32<LittleEndian>;

    fn file_header(v: FileHeaderValues) -> Self::Ehdr {
        let e = LittleEndian;
        elf::FileHeader32 {
            e_ident: ident(Self::CLASS),
            e_type: U16::new(e, elf::ET_DYN),
            e_machine: U16::new(e, v.machine),
            e_version: U32::new(e, u32::from(elf::EV_CURRENT)),
            e_entry: U32::new(e, 0),
            e_phoff: U32::new(e, v.phoff as u32),
            e_shoff: U32::new(e, v.shoff as u32),
            e_flags: U32::new(e, v.flags),
            e_ehsize: U16::new(e, size_of::<Self::Ehdr>() as u16),
            e_phentsize: U16::new(e, size_of::<Self::Phdr>() as u16),
            e_phnum: U16::new(e, v.phnum),
            e_shentsize: U16::new(e, size_of::<Self::Shdr>() as u16),
            e_shnum: U16::new(e, v.shnum),
            e_shstrndx: U16::new(e, v.shstrndx),
        }
    }

    fn program_header(v: ProgramHeaderValues) -> Self::Phdr {
        let e = LittleEndian;
        elf::ProgramHeader32 {
            p_type: U32::new(e, v.ty),
            p_offset: U32::new(e, v.offset as u32),
            p_vaddr: U32::new(e, v.vaddr as u32),
            p_paddr: U32::new(e, v.vaddr as u32),
            p_filesz: U32::new(e, v.filesz as u32),
            p_memsz: U32::new(e, v.memsz as u32),
            p_flags: U32::new(e, v.flags),
            p_align: U32::new(e, v.align as u32),
        }
    }

    fn section_header(v: SectionHeaderValues) -> Self::Shdr {
        let e = LittleEndian;
        elf::SectionHeader32 {
            sh_name: U32::new(e, v.name),
            sh_type: U32::new(e, v.ty),
            sh_flags: U32::new(e, v.flags as u32),
            sh_addr: U32::new(e, v.addr as u32),
            sh_offset: U32::new(e, v.offset as u32),
            sh_size: U32::new(e, v.size as u32),
            sh_link: U32::new(e, v.link),
            sh_info: U32::new(e, v.info),
            sh_addralign: U32::new(e, v.addralign as u32),
            sh_entsize: U32::new(e, v.entsize as u32),
        }
    }

    fn symbol(v: SymbolValues) -> Self::Sym {
        let e = LittleEndian;
        elf::Sym32 {
            st_name: U32::new(e, v.name),
            st_value: U32::new(e, v.value as u32),
            st_size: U32::new(e, v.size as u32),
            st_info: v.info,
            st_other: v.other,
            st_shndx: U16::new(e, v.shndx),
        }
    }

    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn {
        let e = LittleEndian;
        elf::Dyn32 {
            d_tag: U32::new(e, tag),
            d_val: U32::new(e, value as u32),
        }
    }
}

impl ElfTypes for Elf64 {
    const CLASS: u8 = elf::ELFCLASS64;
    const WORD_SIZE: u64 = 8;

    type Ehdr = elf::FileHeader64<LittleEndian>;
    type Phdr = elf::ProgramHeader64<LittleEndian>;
    type Shdr = elf::SectionHeader64<LittleEndian>;
    type Sym = elf::Sym64<LittleEndian>;
    type Dyn = elf::Dyn64<LittleEndian>;

    fn file_header(v: FileHeaderValues) -> Self::Ehdr {
        let e = LittleEndian;
        elf::FileHeader64 {
            e_ident: ident(Self::CLASS),
            e_type: U16::new(e, elf::ET_DYN),
            e_machine: U16::new(e, v.machine),
            e_version: U32::new(e, u32::from(elf::EV_CURRENT)),
            e_entry: U64::new(e, 0),
            e_phoff: U64::new(e, v.phoff),
            e_shoff: U64::new(e, v.shoff),
            e_flags: U32::new(e, v.flags),
            e_ehsize: U16::new(e, size_of::<Self::Ehdr>() as u16),
            e_phentsize: U16::new(e, size_of::<Self::Phdr>() as u16),
            e_phnum: U16::new(e, v.phnum),
            e_shentsize: U16::new(e, size_of::<Self::Shdr>() as u16),
            e_shnum: U16::new(e, v.shnum),
            e_shstrndx: U16::new(e, v.shstrndx),
        }
    }

    fn program_header(v: ProgramHeaderValues) -> Self::Phdr {
        let e = LittleEndian;
        elf::ProgramHeader64 {
            p_type: U32::new(e, v.ty),
            p_flags: U32::new(e, v.flags),
            p_offset: U64::new(e, v.offset),
            p_vaddr: U64::new(e, v.vaddr),
            p_paddr: U64::new(e, v.vaddr),
            p_filesz: U64::new(e, v.filesz),
            p_memsz: U64::new(e, v.memsz),
            p_align: U64::new(e, v.align),
        }
    }

    fn section_header(v: SectionHeaderValues) -> Self::Shdr {
        let e = LittleEndian;
        elf::SectionHeader64 {
            sh_name: U32::new(e, v.name),
            sh_type: U32::new(e, v.ty),
            sh_flags: U64::new(e, v.flags),
            sh_addr: U64::new(e, v.addr),
            sh_offset: U64::new(e, v.offset),
            sh_size: U64::new(e, v.size),
            sh_link: U32::new(e, v.link),
            sh_info: U32::new(e, v.info),
            sh_addralign: U64::new(e, v.addralign),
            sh_entsize: U64::new(e, v.entsize),
        }
    }

    fn symbol(v: SymbolValues) -> Self::Sym {
        let e = LittleEndian;
        elf::Sym64 {
            st_name: U32::new(e, v.name),
            st_info: v.info,
            st_other: v.other,
            st_shndx: U16::new(e, v.shndx),
            st_value: U64::new(e, v.value),
            st_size: U64::new(e, v.size),
        }
    }

    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn {
        let e = LittleEndian;
        elf::Dyn64 {
            d_tag: U64::new(e, u64::from(tag)),
            d_val: U64::new(e, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_the_format() {
        assert_eq!(size_of::<<Elf32 as ElfTypes>::Ehdr>(), 52);
        assert_eq!(size_of::<<Elf32 as ElfTypes>::Phdr>(), 32);
        assert_eq!(size_of::<<Elf32 as ElfTypes>::Shdr>(), 40);
        assert_eq!(size_of::<<Elf32 as ElfTypes>::Sym>(), 16);
        assert_eq!(size_of::<<Elf32 as ElfTypes>::Dyn>(), 8);

        assert_eq!(size_of::<<Elf64 as ElfTypes>::Ehdr>(), 64);
        assert_eq!(size_of::<<Elf64 as ElfTypes>::Phdr>(), 56);
        assert_eq!(size_of::<<Elf64 as ElfTypes>::Shdr>(), 64);
        assert_eq!(size_of::<<Elf64 as ElfTypes>::Sym>(), 24);
        assert_eq!(size_of::<<Elf64 as ElfTypes>::Dyn>(), 16);
    }

    #[test]
    fn align_up_is_identity_on_aligned_values() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(17, 4), 20);
        assert_eq!(align_up(17, 1), 17);
    }
}
