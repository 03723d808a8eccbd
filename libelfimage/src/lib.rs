//! Writes the ELF shared-object container for an ahead-of-time compiled
//! code image: a little-endian ET_DYN file whose `.rodata` and `.text`
//! carry an opaque compiler-produced blob, addressable by a dynamic linker
//! through the `oatdata`/`oatexec`/`oatlastword` anchor symbols.
//!
//! The crate is organized around one pass over the work:
//!
//! - `section`: descriptors for everything that ends up in the section
//!   table, identified by [`SectionId`].
//! - `symtab` / `dynamic`: accumulate symbols and dynamic tags, and derive
//!   the string/hash/record tables from them.
//! - `layout`: the Init phase; assigns indices, offsets and addresses and
//!   settles every header field into an immutable plan.
//! - `elf_writer` / `file_writer`: the Write phase; materializes the plan
//!   into file pieces and streams them through an [`Output`] sink in
//!   ascending-offset order, calling the [`CodePayload`] back exactly once
//!   for `.rodata`+`.text`.
//!
//! [`ElfImageBuilder`] ties the phases together and is generic over the ELF
//! class ([`Elf32`]/[`Elf64`]); output is byte-for-byte reproducible for
//! identical inputs.

mod arch;
mod builder;
mod dynamic;
mod elf;
mod elf_writer;
mod error;
mod file_writer;
mod layout;
mod section;
mod symtab;

pub use arch::InstructionSet;
pub use builder::CodePayload;
pub use builder::ElfImageBuilder;
pub use builder::ElfImageBuilder32;
pub use builder::ElfImageBuilder64;
pub use builder::Extent;
pub use dynamic::DynamicTable;
pub use elf::Elf32;
pub use elf::Elf64;
pub use elf::ElfTypes;
pub use elf::FileHeaderValues;
pub use elf::ProgramHeaderValues;
pub use elf::SectionHeaderValues;
pub use elf::SymbolValues;
pub use error::Result;
pub use file_writer::FileOutput;
pub use file_writer::Output;
pub use section::CodeSection;
pub use section::RawSection;
pub use section::SectionId;
pub use symtab::SymbolTable;
