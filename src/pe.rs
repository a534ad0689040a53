//! PE/COFF layout helpers: header offsets, checksums, section extraction and
//! section replacement through objcopy.
use crate::run::{self, RunError};
use goblin::pe::PE;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PE_POINTER_OFFSET: usize = 0x3c;
const COFF_HEADER_SIZE: usize = 20;
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;
const CERTIFICATE_TABLE_INDEX: usize = 4;

#[derive(Error, Debug)]
pub enum PeError {
    #[error("malformed PE image: {0}")]
    Malformed(String),
    #[error("section {0} not found")]
    MissingSection(String),
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PeError> = core::result::Result<T, E>;

fn u16_at(bytes: &[u8], off: usize) -> Result<u16> {
    bytes
        .get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| PeError::Malformed(format!("truncated at {off:#x}")))
}

fn u32_at(bytes: &[u8], off: usize) -> Result<u32> {
    bytes
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| PeError::Malformed(format!("truncated at {off:#x}")))
}

/// File offsets of the fields Authenticode has to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOffsets {
    pub checksum: usize,
    pub certificate_table: usize,
}

impl HeaderOffsets {
    pub fn of(bytes: &[u8]) -> Result<Self> {
        let pe = u32_at(bytes, PE_POINTER_OFFSET)? as usize;
        if bytes.get(pe..pe + 4) != Some(b"PE\0\0".as_slice()) {
            return Err(PeError::Malformed("missing PE signature".into()));
        }
        let optional = pe + 4 + COFF_HEADER_SIZE;
        let directories = match u16_at(bytes, optional)? {
            PE32_MAGIC => optional + 96,
            PE32PLUS_MAGIC => optional + 112,
            m => return Err(PeError::Malformed(format!("unknown optional header magic {m:#x}"))),
        };
        // NumberOfRvaAndSizes sits right before the directories
        let count = u32_at(bytes, directories - 4)? as usize;
        if count <= CERTIFICATE_TABLE_INDEX {
            return Err(PeError::Malformed("no certificate table directory".into()));
        }
        Ok(Self {
            checksum: optional + 64,
            certificate_table: directories + CERTIFICATE_TABLE_INDEX * 8,
        })
    }

    /// (file offset, size) of the attribute certificate table.
    pub fn certificate_table_entry(&self, bytes: &[u8]) -> Result<(u32, u32)> {
        Ok((
            u32_at(bytes, self.certificate_table)?,
            u32_at(bytes, self.certificate_table + 4)?,
        ))
    }

    pub fn set_certificate_table_entry(&self, bytes: &mut [u8], offset: u32, size: u32) {
        let at = self.certificate_table;
        bytes[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        bytes[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
    }

    /// Recompute and store the image checksum.
    pub fn update_checksum(&self, bytes: &mut [u8]) {
        let sum = checksum(bytes, self.checksum);
        bytes[self.checksum..self.checksum + 4].copy_from_slice(&sum.to_le_bytes());
    }
}

/// The PE image checksum: a folded 16-bit one's complement style sum of the file
/// with the checksum field treated as zero, plus the file length.
pub fn checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let off = i * 2;
        if off == checksum_offset || off == checksum_offset + 2 {
            continue;
        }
        let word = match chunk {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            [lo] => *lo as u16,
            _ => 0,
        };
        sum += word as u64;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum = (sum & 0xffff) + (sum >> 16);
    (sum as u32).wrapping_add(bytes.len() as u32)
}

/// Raw contents of a named section, trimmed to its virtual size when that is smaller.
pub fn section_data(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let pe = PE::parse(bytes)?;
    let section = pe
        .sections
        .iter()
        .find(|s| s.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| PeError::MissingSection(name.to_string()))?;
    let start = section.pointer_to_raw_data as usize;
    let mut len = section.size_of_raw_data as usize;
    if section.virtual_size != 0 && (section.virtual_size as usize) < len {
        len = section.virtual_size as usize;
    }
    bytes
        .get(start..start + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| PeError::Malformed(format!("section {name} exceeds file")))
}

pub fn read_section(path: &Path, name: &str) -> Result<Vec<u8>> {
    section_data(&std::fs::read(path)?, name)
}

/// A section to (re)place with objcopy.
#[derive(Debug, Clone, Default)]
pub struct SectionInput {
    pub name: String,
    pub vma: u64,
    pub alignment: u64,
    pub path: Option<PathBuf>,
}

impl SectionInput {
    pub fn new(name: &str, vma: u64, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            vma,
            alignment: 0,
            path: Some(path.to_path_buf()),
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(path) = &self.path {
            args.push(format!("--remove-section={}", self.name));
            args.push(format!("--add-section={}={}", self.name, path.display()));
        }
        if self.vma != 0 {
            args.push(format!("--change-section-vma={}={:#x}", self.name, self.vma));
        }
        if self.alignment != 0 {
            args.push(format!(
                "--set-section-alignment={}={}",
                self.name, self.alignment
            ));
        }
        args
    }
}

/// Replace sections of `input`, writing the result to `output`.
pub fn set_sections(input: &Path, output: &Path, sections: &[SectionInput]) -> Result<()> {
    let mut args: Vec<String> = vec![];
    if sections.iter().any(|s| s.name.len() > 8) {
        args.push("--long-section-names=enable".to_string());
    }
    args.extend(sections.iter().flat_map(SectionInput::args));
    args.push(input.display().to_string());
    args.push(output.display().to_string());
    run::run(&mut run::cmd("objcopy", &args))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A minimal but well-formed PE32+ EFI application.

    const FILE_ALIGN: usize = 0x200;
    const SECTION_ALIGN: usize = 0x1000;

    fn align(v: usize, a: usize) -> usize {
        (v + a - 1) / a * a
    }

    pub fn synthetic_pe(sections: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let pe_off = 0x80;
        let opt_size = 240;
        let headers_end = pe_off + 4 + 20 + opt_size + 40 * sections.len();
        let size_of_headers = align(headers_end, FILE_ALIGN);

        let mut raw = vec![];
        let mut file_off = size_of_headers;
        let mut vaddr = SECTION_ALIGN;
        for (_, data) in sections {
            let raw_size = align(data.len().max(1), FILE_ALIGN);
            raw.push((file_off, raw_size, vaddr, data.len()));
            file_off += raw_size;
            vaddr += align(data.len().max(1), SECTION_ALIGN);
        }
        let size_of_image = vaddr;

        let mut b = vec![0u8; file_off];
        b[0..2].copy_from_slice(b"MZ");
        b[0x3c..0x40].copy_from_slice(&(pe_off as u32).to_le_bytes());
        b[pe_off..pe_off + 4].copy_from_slice(b"PE\0\0");
        let coff = pe_off + 4;
        b[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes());
        b[coff + 2..coff + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        b[coff + 16..coff + 18].copy_from_slice(&(opt_size as u16).to_le_bytes());
        b[coff + 18..coff + 20].copy_from_slice(&0x0206u16.to_le_bytes());

        let opt = coff + 20;
        b[opt..opt + 2].copy_from_slice(&0x20bu16.to_le_bytes());
        b[opt + 16..opt + 20].copy_from_slice(&(SECTION_ALIGN as u32).to_le_bytes()); // entry
        b[opt + 20..opt + 24].copy_from_slice(&(SECTION_ALIGN as u32).to_le_bytes()); // base of code
        b[opt + 32..opt + 36].copy_from_slice(&(SECTION_ALIGN as u32).to_le_bytes());
        b[opt + 36..opt + 40].copy_from_slice(&(FILE_ALIGN as u32).to_le_bytes());
        b[opt + 56..opt + 60].copy_from_slice(&(size_of_image as u32).to_le_bytes());
        b[opt + 60..opt + 64].copy_from_slice(&(size_of_headers as u32).to_le_bytes());
        b[opt + 68..opt + 70].copy_from_slice(&10u16.to_le_bytes()); // EFI application
        b[opt + 72..opt + 80].copy_from_slice(&0x10_0000u64.to_le_bytes());
        b[opt + 80..opt + 88].copy_from_slice(&0x1000u64.to_le_bytes());
        b[opt + 88..opt + 96].copy_from_slice(&0x10_0000u64.to_le_bytes());
        b[opt + 96..opt + 104].copy_from_slice(&0x1000u64.to_le_bytes());
        b[opt + 108..opt + 112].copy_from_slice(&16u32.to_le_bytes());

        // names longer than 8 bytes live in the COFF string table as "/offset"
        let mut strings = vec![];
        let mut sh = opt + opt_size;
        for ((name, data), (off, raw_size, va, len)) in sections.iter().zip(raw) {
            let mut n = [0u8; 8];
            if name.len() > 8 {
                let short = format!("/{}", 4 + strings.len());
                n[..short.len()].copy_from_slice(short.as_bytes());
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
            } else {
                n[..name.len()].copy_from_slice(name.as_bytes());
            }
            b[sh..sh + 8].copy_from_slice(&n);
            b[sh + 8..sh + 12].copy_from_slice(&(len as u32).to_le_bytes());
            b[sh + 12..sh + 16].copy_from_slice(&(va as u32).to_le_bytes());
            b[sh + 16..sh + 20].copy_from_slice(&(raw_size as u32).to_le_bytes());
            b[sh + 20..sh + 24].copy_from_slice(&(off as u32).to_le_bytes());
            b[sh + 36..sh + 40].copy_from_slice(&0x4000_0040u32.to_le_bytes());
            b[off..off + data.len()].copy_from_slice(data);
            sh += 40;
        }
        if !strings.is_empty() {
            let table = b.len() as u32;
            b[coff + 8..coff + 12].copy_from_slice(&table.to_le_bytes());
            b.extend_from_slice(&(4 + strings.len() as u32).to_le_bytes());
            b.extend_from_slice(&strings);
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::synthetic_pe;
    use super::*;
    use eyre::Result;

    #[test]
    fn offsets_of_pe32plus() -> Result<()> {
        let pe = synthetic_pe(&[(".text", vec![0xc3])]);
        let offsets = HeaderOffsets::of(&pe)?;
        assert_eq!(offsets.checksum, 0x80 + 24 + 64);
        assert_eq!(offsets.certificate_table, 0x80 + 24 + 112 + 32);
        assert_eq!(offsets.certificate_table_entry(&pe)?, (0, 0));
        Ok(())
    }

    #[test]
    fn not_a_pe() {
        assert!(HeaderOffsets::of(&[0u8; 512]).is_err());
    }

    #[test]
    fn checksum_ignores_its_own_field() -> Result<()> {
        let mut pe = synthetic_pe(&[(".data", vec![1, 2, 3])]);
        let offsets = HeaderOffsets::of(&pe)?;
        let before = checksum(&pe, offsets.checksum);
        offsets.update_checksum(&mut pe);
        assert_eq!(checksum(&pe, offsets.checksum), before);
        assert_ne!(before, 0);
        Ok(())
    }

    #[test]
    fn checksum_of_small_buffer() {
        // words 0x0201 + 0x0403, checksum field at 8 is out of range
        assert_eq!(checksum(&[1, 2, 3, 4], 8), 0x0201 + 0x0403 + 4);
        // folding carries
        assert_eq!(checksum(&[0xff, 0xff, 0x02, 0x00], 8), 0x0002 + 4);
    }

    #[test]
    fn reads_sections() -> Result<()> {
        let pe = synthetic_pe(&[
            (".text", vec![0xc3]),
            (".cmdline", b"console=ttyS0".to_vec()),
            (".vendor_cert", vec![7; 32]),
        ]);
        assert_eq!(section_data(&pe, ".cmdline")?, b"console=ttyS0");
        assert_eq!(section_data(&pe, ".vendor_cert")?, vec![7; 32]);
        assert!(matches!(
            section_data(&pe, ".initrd"),
            Err(PeError::MissingSection(_))
        ));
        Ok(())
    }
}
