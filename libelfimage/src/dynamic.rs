//! Accumulates `.dynamic` entries. Values that depend on final layout
//! (section addresses, `DT_STRSZ`, `DT_SONAME`) are filled in when the table
//! is materialized; the terminating `DT_NULL` is always owned by the builder.

use crate::elf::ElfTypes;
use crate::elf::PAGE_SIZE;
use crate::section::Section;
use crate::section::SectionId;
use object::elf;

#[derive(Clone, Copy, Debug)]
struct DynamicEntry {
    tag: u32,
    value: u64,
    /// When set, `value` is an offset relative to this section's virtual
    /// address.
    section: Option<SectionId>,
}

pub struct DynamicTable {
    pub(crate) section: Section,
    entries: Vec<DynamicEntry>,
}

impl DynamicTable {
    pub(crate) fn new(name: &'static str, link: SectionId) -> DynamicTable {
        DynamicTable {
            section: Section::new(
                name,
                elf::SHT_DYNAMIC,
                u64::from(elf::SHF_ALLOC),
                Some(link),
                0,
                PAGE_SIZE,
                0,
            ),
            entries: Vec::new(),
        }
    }

    /// Appends an absolute-valued entry. `DT_NULL` is silently dropped; the
    /// terminator is appended by `materialize`.
    pub fn add(&mut self, tag: u32, value: u64) {
        if tag == elf::DT_NULL {
            return;
        }
        self.entries.push(DynamicEntry {
            tag,
            value,
            section: None,
        });
    }

    /// Appends an entry whose value is `offset` into `section`'s mapped
    /// image.
    pub fn add_for_section(&mut self, tag: u32, offset: u64, section: SectionId) {
        if tag == elf::DT_NULL {
            return;
        }
        self.entries.push(DynamicEntry {
            tag,
            value: offset,
            section: Some(section),
        });
    }

    /// Entry count of the emitted table: everything added plus `DT_STRSZ`,
    /// `DT_SONAME` and `DT_NULL`.
    pub(crate) fn num_entries(&self) -> u64 {
        self.entries.len() as u64 + 3
    }

    /// Builds the final vector. `resolve_addr` maps a section id to its
    /// assigned virtual address.
    pub(crate) fn materialize<E: ElfTypes>(
        &self,
        strsz: u64,
        soname_offset: u64,
        resolve_addr: impl Fn(SectionId) -> u64,
    ) -> Vec<E::Dyn> {
        let mut out: Vec<E::Dyn> = self
            .entries
            .iter()
            .map(|entry| {
                let value = match entry.section {
                    Some(id) => entry.value + resolve_addr(id),
                    None => entry.value,
                };
                E::dyn_entry(entry.tag, value)
            })
            .collect();
        out.push(E::dyn_entry(elf::DT_STRSZ, strsz));
        out.push(E::dyn_entry(elf::DT_SONAME, soname_offset));
        out.push(E::dyn_entry(elf::DT_NULL, 0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Elf64;
    use object::LittleEndian;

    #[test]
    fn null_entries_are_dropped() {
        let mut table = DynamicTable::new(".dynamic", SectionId::Dynsym);
        table.add(elf::DT_NULL, 7);
        table.add_for_section(elf::DT_NULL, 7, SectionId::Hash);
        assert_eq!(table.num_entries(), 3);
    }

    #[test]
    fn materialize_appends_terminators_in_order() {
        let mut table = DynamicTable::new(".dynamic", SectionId::Dynsym);
        table.add_for_section(elf::DT_HASH, 0, SectionId::Hash);
        table.add(elf::DT_SYMENT, 24);
        let entries = table.materialize::<Elf64>(0x40, 0x39, |id| {
            assert_eq!(id, SectionId::Hash);
            0x1000
        });
        let e = LittleEndian;
        let tags: Vec<u64> = entries.iter().map(|d| d.d_tag.get(e)).collect();
        assert_eq!(
            tags,
            vec![
                u64::from(elf::DT_HASH),
                u64::from(elf::DT_SYMENT),
                u64::from(elf::DT_STRSZ),
                u64::from(elf::DT_SONAME),
                u64::from(elf::DT_NULL),
            ]
        );
        assert_eq!(entries[0].d_val.get(e), 0x1000);
        assert_eq!(entries[1].d_val.get(e), 24);
        assert_eq!(entries[2].d_val.get(e), 0x40);
        assert_eq!(entries[3].d_val.get(e), 0x39);
        assert_eq!(entries[4].d_val.get(e), 0);
        assert_eq!(entries.len() as u64, table.num_entries());
    }
}
