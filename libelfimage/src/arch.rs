use crate::error::Result;
use anyhow::bail;
use object::elf;

/// Instruction sets the compiler can target.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionSet {
    None,
    Arm,
    Thumb2,
    Arm64,
    X86,
    X86_64,
    Mips,
    Mips64,
}

/// ELF identity of one instruction set.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ArchInfo {
    pub(crate) machine: u16,
    pub(crate) flags: u32,
}

// Not named by `object::elf`.
const EF_MIPS_ABI_O32: u32 = 0x0000_1000;

pub(crate) fn arch_info(isa: InstructionSet) -> Result<ArchInfo> {
    let info = match isa {
        // Thumb2 code lives in an ordinary ARM image; interworking is
        // handled by the code itself, not the container.
        InstructionSet::Arm | InstructionSet::Thumb2 => ArchInfo {
            machine: elf::EM_ARM,
            flags: elf::EF_ARM_EABI_VER5,
        },
        InstructionSet::Arm64 => ArchInfo {
            machine: elf::EM_AARCH64,
            flags: 0,
        },
        InstructionSet::X86 => ArchInfo {
            machine: elf::EM_386,
            flags: 0,
        },
        InstructionSet::X86_64 => ArchInfo {
            machine: elf::EM_X86_64,
            flags: 0,
        },
        InstructionSet::Mips => ArchInfo {
            machine: elf::EM_MIPS,
            flags: elf::EF_MIPS_NOREORDER
                | elf::EF_MIPS_PIC
                | elf::EF_MIPS_CPIC
                | EF_MIPS_ABI_O32
                | elf::EF_MIPS_ARCH_32R2,
        },
        InstructionSet::Mips64 => ArchInfo {
            machine: elf::EM_MIPS,
            flags: elf::EF_MIPS_NOREORDER
                | elf::EF_MIPS_PIC
                | elf::EF_MIPS_CPIC
                | elf::EF_MIPS_ARCH_64R6,
        },
        InstructionSet::None => bail!("unknown instruction set: {isa:?}"),
    };
    Ok(info)
}
