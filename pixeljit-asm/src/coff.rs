//! COFF object output.
//!
//! The generated routine is serialised as a minimal AMD64 COFF object:
//! file header, a single `.text` section holding the code, and a symbol
//! table exporting exactly one external function symbol. No relocations
//! are emitted - the code buffer is self-contained.

use std::path::Path;

use crate::asm::Assembler;
use crate::error::AsmError;

/// `IMAGE_FILE_MACHINE_AMD64`
const MACHINE_AMD64: u16 = 0x8664;

const FILE_HEADER_SIZE: u32 = 20;
const SECTION_HEADER_SIZE: u32 = 40;
const SYMBOL_SIZE: u32 = 18;

bitflags::bitflags! {
    /// Section characteristics of the `.text` section.
    struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const ALIGN_16BYTES = 0x0050_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
    }
}

/// External symbol, `IMAGE_SYM_CLASS_EXTERNAL`.
const SYM_CLASS_EXTERNAL: u8 = 2;
/// Function type, `IMAGE_SYM_DTYPE_FUNCTION << 4`.
const SYM_TYPE_FUNCTION: u16 = 0x20;

impl Assembler {
    /// Serialise the finished code as a relocatable COFF object whose
    /// sole exported symbol is `symbol`, pointing at offset zero of the
    /// `.text` section.
    pub fn write_object(&self, path: &Path, symbol: &str) -> Result<(), AsmError> {
        let code = self.code()?;
        let mut obj = Vec::with_capacity(code.len() + 128);

        let symtab_offset = FILE_HEADER_SIZE + SECTION_HEADER_SIZE + code.len() as u32;

        // file header
        obj.extend_from_slice(&MACHINE_AMD64.to_le_bytes());
        obj.extend_from_slice(&1u16.to_le_bytes()); // section count
        obj.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        obj.extend_from_slice(&symtab_offset.to_le_bytes());
        obj.extend_from_slice(&1u32.to_le_bytes()); // symbol count
        obj.extend_from_slice(&0u16.to_le_bytes()); // optional header size
        obj.extend_from_slice(&0u16.to_le_bytes()); // characteristics

        // .text section header
        obj.extend_from_slice(b".text\0\0\0");
        obj.extend_from_slice(&0u32.to_le_bytes()); // virtual size
        obj.extend_from_slice(&0u32.to_le_bytes()); // virtual address
        obj.extend_from_slice(&(code.len() as u32).to_le_bytes());
        obj.extend_from_slice(&(FILE_HEADER_SIZE + SECTION_HEADER_SIZE).to_le_bytes());
        obj.extend_from_slice(&0u32.to_le_bytes()); // relocation table
        obj.extend_from_slice(&0u32.to_le_bytes()); // line numbers
        obj.extend_from_slice(&0u16.to_le_bytes()); // relocation count
        obj.extend_from_slice(&0u16.to_le_bytes()); // line number count
        let flags =
            SectionFlags::CNT_CODE | SectionFlags::ALIGN_16BYTES | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ;
        obj.extend_from_slice(&flags.bits().to_le_bytes());

        obj.extend_from_slice(code);

        // symbol table: one external function at .text+0
        let mut strtab: Vec<u8> = Vec::new();
        if symbol.len() <= 8 {
            let mut name = [0u8; 8];
            name[..symbol.len()].copy_from_slice(symbol.as_bytes());
            obj.extend_from_slice(&name);
        } else {
            // long names live in the string table; the first four bytes
            // of the record are zero, the next four the table offset
            obj.extend_from_slice(&0u32.to_le_bytes());
            obj.extend_from_slice(&(4 + strtab.len() as u32).to_le_bytes());
            strtab.extend_from_slice(symbol.as_bytes());
            strtab.push(0);
        }
        obj.extend_from_slice(&0u32.to_le_bytes()); // value: section offset 0
        obj.extend_from_slice(&1i16.to_le_bytes()); // section number (1-based)
        obj.extend_from_slice(&SYM_TYPE_FUNCTION.to_le_bytes());
        obj.push(SYM_CLASS_EXTERNAL);
        obj.push(0); // auxiliary symbol count

        // string table, prefixed with its own length
        obj.extend_from_slice(&(4 + strtab.len() as u32).to_le_bytes());
        obj.extend_from_slice(&strtab);

        std::fs::write(path, obj)?;
        Ok(())
    }
}
