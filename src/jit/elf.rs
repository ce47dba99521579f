//! Minimal ELF32 writer: frames the instruction stream as an SPE
//! executable.
//!
//! One big-endian ELF header, one PT_LOAD segment mapping the whole
//! image at local-store address 0, entry at the bootloader start offset.

use std::io::{self, Write};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_SPU: u16 = 23;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_R: u32 = 4;

const EHDR_SIZE: u16 = 52;
const PHDR_SIZE: u16 = 32;
/// Segment file offset, padded so it stays congruent to the load
/// address modulo the alignment.
const SEGMENT_OFFSET: u32 = 96;
const SEGMENT_ALIGN: u32 = 16;

#[derive(Clone, Copy)]
struct Elf32Ehdr {
    e_entry: u32,
}

impl Elf32Ehdr {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[4] = ELFCLASS32;
        ident[5] = ELFDATA2MSB;
        ident[6] = EV_CURRENT;
        w.write_all(&ident)?;
        w.write_all(&ET_EXEC.to_be_bytes())?;
        w.write_all(&EM_SPU.to_be_bytes())?;
        w.write_all(&(EV_CURRENT as u32).to_be_bytes())?;
        w.write_all(&self.e_entry.to_be_bytes())?;
        w.write_all(&(EHDR_SIZE as u32).to_be_bytes())?; // e_phoff
        w.write_all(&0u32.to_be_bytes())?; // e_shoff
        w.write_all(&0u32.to_be_bytes())?; // e_flags
        w.write_all(&EHDR_SIZE.to_be_bytes())?;
        w.write_all(&PHDR_SIZE.to_be_bytes())?;
        w.write_all(&1u16.to_be_bytes())?; // e_phnum
        w.write_all(&0u16.to_be_bytes())?; // e_shentsize
        w.write_all(&0u16.to_be_bytes())?; // e_shnum
        w.write_all(&0u16.to_be_bytes())?; // e_shstrndx
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Elf32Phdr {
    p_filesz: u32,
}

impl Elf32Phdr {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&PT_LOAD.to_be_bytes())?;
        w.write_all(&SEGMENT_OFFSET.to_be_bytes())?;
        w.write_all(&0u32.to_be_bytes())?; // p_vaddr
        w.write_all(&0u32.to_be_bytes())?; // p_paddr
        w.write_all(&self.p_filesz.to_be_bytes())?;
        w.write_all(&self.p_filesz.to_be_bytes())?; // p_memsz
        w.write_all(&(PF_R | PF_X).to_be_bytes())?;
        w.write_all(&SEGMENT_ALIGN.to_be_bytes())?;
        Ok(())
    }
}

/// Frame `image` as an ELF executable entered at `entry`.
pub fn write<W: Write>(w: &mut W, image: &[u8], entry: u32) -> io::Result<()> {
    Elf32Ehdr { e_entry: entry }.write_to(w)?;
    Elf32Phdr {
        p_filesz: image.len() as u32,
    }
    .write_to(w)?;
    let pad = SEGMENT_OFFSET - EHDR_SIZE as u32 - PHDR_SIZE as u32;
    w.write_all(&vec![0u8; pad as usize])?;
    w.write_all(image)
}
