//! Symbol accumulation and the derived tables: the string table, the SysV
//! hash table and the `Sym` array itself. The same builder backs `.dynsym`
//! (allocated, hashed) and `.symtab` (debug only, never hashed).

use crate::elf::align_up;
use crate::elf::ElfTypes;
use crate::elf::SymbolValues;
use crate::section::Section;
use crate::section::SectionId;
use object::elf;
use std::mem::size_of;

/// The hash function dynamic linkers apply to `.hash` lookups.
pub(crate) fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &byte in name.as_bytes() {
        h = (h << 4).wrapping_add(u32::from(byte));
        let g = h & 0xf000_0000;
        h ^= g;
        h ^= g >> 24;
    }
    h
}

fn st_info(binding: u8, sym_type: u8) -> u8 {
    (binding << 4) | (sym_type & 0xf)
}

#[derive(Clone, Debug)]
struct Symbol {
    name: String,
    section: SectionId,
    addr: u64,
    size: u64,
    /// When set, the emitted value is `addr` plus the owning section's
    /// assigned file offset.
    is_relative: bool,
    info: u8,
    other: u8,
}

/// Builder for one symbol table and its paired string table.
pub struct SymbolTable {
    pub(crate) section: Section,
    pub(crate) strtab: Section,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub(crate) fn new(
        name: &'static str,
        sh_type: u32,
        str_name: &'static str,
        str_id: SectionId,
        alloc: bool,
    ) -> SymbolTable {
        let flags = if alloc { u64::from(elf::SHF_ALLOC) } else { 0 };
        SymbolTable {
            section: Section::new(
                name,
                sh_type,
                flags,
                Some(str_id),
                0,
                size_of::<u32>() as u64,
                0,
            ),
            strtab: Section::new(str_name, elf::SHT_STRTAB, flags, None, 0, 1, 1),
            symbols: Vec::new(),
        }
    }

    /// Appends a symbol. Names are not checked for uniqueness; the caller
    /// must not add the same name twice to one table.
    #[allow(clippy::too_many_arguments)]
    pub fn add_symbol(
        &mut self,
        name: impl Into<String>,
        section: SectionId,
        addr: u64,
        is_relative: bool,
        size: u64,
        binding: u8,
        sym_type: u8,
        other: u8,
    ) {
        self.symbols.push(Symbol {
            name: name.into(),
            section,
            addr,
            size,
            is_relative,
            info: st_info(binding, sym_type),
            other,
        });
    }

    pub(crate) fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Entry count of the emitted table, including the undefined symbol.
    pub(crate) fn num_entries(&self) -> u64 {
        self.symbols.len() as u64 + 1
    }

    /// Produces the string-table bytes (leading NUL, then each name
    /// NUL-terminated) and the per-symbol name offsets in insertion order.
    pub(crate) fn generate_strtab(&self) -> (Vec<u8>, Vec<u32>) {
        let mut tab = vec![0u8];
        let mut offsets = Vec::with_capacity(self.symbols.len());
        for sym in &self.symbols {
            offsets.push(tab.len() as u32);
            tab.extend_from_slice(sym.name.as_bytes());
            tab.push(0);
        }
        (tab, offsets)
    }

    /// Produces the `.hash` payload: `[nbuckets, nchain, bucket[..], chain[..]]`.
    ///
    /// Lookup starts at `bucket[elf_hash(name) % nbuckets]` and follows
    /// `chain[]` until it hits a symbol with the wanted name or chain slot
    /// zero. Every symbol index appears in exactly one bucket head or chain
    /// slot, so the walk below that appends a new index to the end of its
    /// chain cannot loop.
    pub(crate) fn generate_hash(&self) -> Vec<u32> {
        let nsyms = self.symbols.len();
        let nchain = nsyms as u32 + 1;
        let nbuckets: u32 = if nsyms < 8 {
            2
        } else if nsyms < 32 {
            4
        } else if nsyms < 256 {
            16
        } else {
            // About 32 ids per bucket.
            align_up(nsyms as u64 / 32, 2) as u32
        };

        let bucket_base = 2usize;
        let chain_base = bucket_base + nbuckets as usize;
        let mut hash = vec![0u32; chain_base + nchain as usize];
        hash[0] = nbuckets;
        hash[1] = nchain;

        for (i, sym) in self.symbols.iter().enumerate() {
            // The undefined symbol occupies index 0.
            let index = i as u32 + 1;
            let bucket = bucket_base + (elf_hash(&sym.name) % nbuckets) as usize;
            if hash[bucket] == 0 {
                hash[bucket] = index;
            } else {
                let mut slot = hash[bucket];
                loop {
                    assert!(slot < nchain);
                    let link = chain_base + slot as usize;
                    if hash[link] == 0 {
                        hash[link] = index;
                        break;
                    }
                    slot = hash[link];
                }
                // A non-empty chain slot at our own index would mean two
                // symbols were given the same index, which cannot happen.
                assert_eq!(hash[chain_base + index as usize], 0);
            }
        }
        hash
    }

    /// Produces the `Sym` array. `resolve` maps a section id to its assigned
    /// section index and file offset.
    pub(crate) fn generate_symbols<E: ElfTypes>(
        &self,
        name_offsets: &[u32],
        resolve: impl Fn(SectionId) -> (u16, u64),
    ) -> Vec<E::Sym> {
        let mut out = Vec::with_capacity(self.symbols.len() + 1);
        out.push(E::symbol(SymbolValues {
            shndx: elf::SHN_UNDEF,
            ..SymbolValues::default()
        }));
        for (sym, &name) in self.symbols.iter().zip(name_offsets) {
            let (shndx, section_offset) = resolve(sym.section);
            let value = if sym.is_relative {
                sym.addr + section_offset
            } else {
                sym.addr
            };
            out.push(E::symbol(SymbolValues {
                name,
                value,
                size: sym.size,
                info: sym.info,
                other: sym.other,
                shndx,
            }));
        }
        out
    }
}
