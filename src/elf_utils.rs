//! ELF executable loading
//!
//! Reads a statically linked 64-bit little-endian ELF executable and
//! builds the memory image the core executes from. The image base is
//! program header 0's virtual address and the entry point comes from
//! the ELF header; the .text and .data contents are copied in at
//! their section offsets, .bss contributes only its (zeroed) extent,
//! and a stack reserve is appended above the highest section.

use elf::endian::AnyEndian;
use elf::section::SectionHeader;
use elf::ElfBytes;
use thiserror::Error;

use crate::memory::{MemoryImage, STACK_RESERVE};

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("could not read executable: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse executable: {0}")]
    Parse(#[from] elf::ParseError),
    #[error("executable has no program headers")]
    MissingProgramHeader,
    #[error("executable has no .text section")]
    MissingTextSection,
    #[error("unexpected compression in section {0}")]
    CompressedSection(&'static str),
    #[error("section {0} loads below the image base")]
    SectionBelowBase(&'static str),
}

fn round_up_to_word(value: u64) -> u64 {
    (value + 3) & !3
}

fn section_offset(
    header: &SectionHeader,
    program_start: u64,
    name: &'static str,
) -> Result<u64, ElfError> {
    header
        .sh_addr
        .checked_sub(program_start)
        .ok_or(ElfError::SectionBelowBase(name))
}

fn section_bytes<'a>(
    file: &'a ElfBytes<AnyEndian>,
    header: &SectionHeader,
    name: &'static str,
) -> Result<&'a [u8], ElfError> {
    let (bytes, compression) = file.section_data(header)?;
    if compression.is_some() {
        return Err(ElfError::CompressedSection(name));
    }
    Ok(bytes)
}

/// Read an ELF executable from disk and build the memory image to
/// run it from
pub fn load_elf(elf_file_path: &str) -> Result<MemoryImage, ElfError> {
    let file_data = std::fs::read(elf_file_path)?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(file_data.as_slice())?;

    let entry = file.ehdr.e_entry;
    let segments = file.segments().ok_or(ElfError::MissingProgramHeader)?;
    let program_start = segments
        .get(0)
        .map_err(|_| ElfError::MissingProgramHeader)?
        .p_vaddr;

    let text = file
        .section_header_by_name(".text")?
        .ok_or(ElfError::MissingTextSection)?;
    let data = file.section_header_by_name(".data")?;
    let bss = file.section_header_by_name(".bss")?;

    let text_offset = section_offset(&text, program_start, ".text")?;
    let data_offset = match &data {
        Some(header) => Some(section_offset(header, program_start, ".data")?),
        None => None,
    };
    let bss_offset = match &bss {
        Some(header) => Some(section_offset(header, program_start, ".bss")?),
        None => None,
    };

    // The buffer covers everything up to the furthest section end,
    // plus room for the stack
    let mut nbytes = 0;
    for (header, offset) in [
        (Some(&text), Some(text_offset)),
        (data.as_ref(), data_offset),
        (bss.as_ref(), bss_offset),
    ] {
        if let (Some(header), Some(offset)) = (header, offset) {
            nbytes = nbytes.max(offset + round_up_to_word(header.sh_size));
        }
    }
    nbytes += STACK_RESERVE;

    let mut image = MemoryImage::new(program_start, entry, nbytes);
    image.text_offset = Some(text_offset);
    image.data_offset = data_offset;
    image.bss_offset = bss_offset;

    image.fill(text_offset, section_bytes(&file, &text, ".text")?);
    if let (Some(header), Some(offset)) = (&data, data_offset) {
        image.fill(offset, section_bytes(&file, header, ".data")?);
    }

    Ok(image)
}
