//! Static ELF executable writer.
//!
//! Produces a 64-bit little-endian executable with two page-aligned
//! PT_LOAD segments (text and data) and program headers ahead of the
//! section contents. The image's code is fully self-relative, so no
//! relocations or dynamic metadata are required.

use crate::backend::image::Image;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

const BASE_VADDR: u64 = 0x400000;
const PAGE_SIZE: u64 = 4096;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn pad_to(&mut self, offset: u64) {
        self.out.resize(offset as usize, 0);
    }
}

/// Serialize the image into an ELF executable byte vector. The image's
/// RIP-relative data references are resolved against the final segment
/// addresses as a side effect.
pub fn write_executable(image: &mut Image) -> Vec<u8> {
    let text_offset = PAGE_SIZE;
    let text_vaddr = BASE_VADDR + text_offset;
    let data_offset = align_up(text_offset + image.program_data.len() as u64, PAGE_SIZE);
    let data_vaddr = BASE_VADDR + data_offset;
    let entry = text_vaddr + image.entry_point as u64;

    image.link(text_vaddr, data_vaddr);

    let mut w = Writer { out: Vec::new() };

    // ELF header.
    w.out.extend_from_slice(&ELF_MAGIC);
    w.u8(ELFCLASS64);
    w.u8(ELFDATA2LSB);
    w.u8(1); // EV_CURRENT
    w.out.resize(16, 0); // padding to e_type
    w.u16(ET_EXEC);
    w.u16(EM_X86_64);
    w.u32(1); // e_version
    w.u64(entry);
    w.u64(EHDR_SIZE as u64); // e_phoff
    w.u64(0); // e_shoff: no section headers
    w.u32(0); // e_flags
    w.u16(EHDR_SIZE as u16);
    w.u16(PHDR_SIZE as u16);
    w.u16(2); // e_phnum
    w.u16(0); // e_shentsize
    w.u16(0); // e_shnum
    w.u16(0); // e_shstrndx

    // Text segment: headers plus program data, readable and executable.
    w.u32(PT_LOAD);
    w.u32(PF_R | PF_X);
    w.u64(0);
    w.u64(BASE_VADDR);
    w.u64(BASE_VADDR);
    let text_total = text_offset + image.program_data.len() as u64;
    w.u64(text_total);
    w.u64(text_total);
    w.u64(PAGE_SIZE);

    // Data segment, readable and writable.
    w.u32(PT_LOAD);
    w.u32(PF_R | PF_W);
    w.u64(data_offset);
    w.u64(data_vaddr);
    w.u64(data_vaddr);
    w.u64(image.initialized_data.len() as u64);
    w.u64(image.initialized_data.len() as u64);
    w.u64(PAGE_SIZE);

    w.pad_to(text_offset);
    w.out.extend_from_slice(&image.program_data);
    w.pad_to(data_offset);
    w.out.extend_from_slice(&image.initialized_data);

    w.out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> Image {
        Image {
            program_data: vec![0xC3; 16],
            initialized_data: vec![1, 2, 3, 4],
            entry_point: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_fields() {
        let mut image = test_image();
        let bytes = write_executable(&mut image);
        assert_eq!(&bytes[0..4], &ELF_MAGIC);
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(bytes[5], ELFDATA2LSB);
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), ET_EXEC);
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), EM_X86_64);
        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(entry, BASE_VADDR + PAGE_SIZE);
        // Two program headers immediately after the ELF header.
        assert_eq!(u16::from_le_bytes([bytes[56], bytes[57]]), 2);
    }

    #[test]
    fn test_segment_contents_are_page_aligned() {
        let mut image = test_image();
        let bytes = write_executable(&mut image);
        assert_eq!(bytes[PAGE_SIZE as usize], 0xC3);
        let data_offset = align_up(PAGE_SIZE + 16, PAGE_SIZE) as usize;
        assert_eq!(&bytes[data_offset..data_offset + 4], &[1, 2, 3, 4]);
    }
}
