//! Rebuilding a unified kernel image around a keyset's trust root.
use super::Result;
use crate::crypto::authenticode::sign_efi_file;
use crate::keyset::Keyset;
use crate::paths::{self, IoContext};
use crate::pe::{self, PeError, SectionInput};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;

pub const CMDLINE_VMA: u64 = 0x30000;
pub const SBAT_VMA: u64 = 0x50000;
pub const SBAT_ALIGNMENT: u64 = 512;
pub const LINUX_VMA: u64 = 0x100_0000;
pub const INITRD_VMA: u64 = 0x300_0000;

const NEWC_MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";
const MODE_DIR: u32 = 0o040_755;
const MODE_FILE: u32 = 0o100_644;
const MODE_EXEC: u32 = 0o100_755;

/// An in-memory `newc` cpio archive, all entries owned by root.
#[derive(Debug, Default)]
pub struct Cpio {
    buf: Vec<u8>,
    ino: u32,
}

fn pad4(buf: &mut Vec<u8>) {
    buf.resize((buf.len() + 3) & !3, 0);
}

impl Cpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, name: &str, mode: u32, nlink: u32, data: &[u8]) {
        self.ino += 1;
        let fields = [
            self.ino,
            mode,
            0,
            0,
            nlink,
            0,
            data.len() as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ];
        self.buf.extend_from_slice(NEWC_MAGIC.as_bytes());
        for field in fields {
            self.buf.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        pad4(&mut self.buf);
        self.buf.extend_from_slice(data);
        pad4(&mut self.buf);
    }

    pub fn dir(&mut self, name: &str) {
        self.entry(name, MODE_DIR, 2, &[]);
    }

    pub fn file(&mut self, name: &str, data: &[u8], executable: bool) {
        let mode = if executable { MODE_EXEC } else { MODE_FILE };
        self.entry(name, mode, 1, data);
    }

    /// Add the directory `src` and everything under it as `name`.
    pub fn tree(&mut self, src: &Path, name: &str) -> Result<()> {
        self.dir(name);
        let mut entries = std::fs::read_dir(src)
            .at(src)?
            .collect::<std::io::Result<Vec<_>>>()
            .at(src)?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let child = format!("{name}/{}", entry.file_name().to_string_lossy());
            if entry.file_type().at(&path)?.is_dir() {
                self.tree(&path, &child)?;
            } else {
                self.file(&child, &paths::read(&path)?, false);
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.ino = 0;
        self.entry(TRAILER, 0, 1, &[]);
        self.buf
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// The gzipped cpio appended to the bootkit initrd: the keyset's manifest CA,
/// its PCR7 policy data and, for testing, a replacement `mosctl`.
pub fn trust_cpio(keyset: &Keyset, mosctl: Option<&Path>) -> Result<Vec<u8>> {
    let mut cpio = Cpio::new();
    cpio.file(
        "manifestCA.pem",
        &paths::read(&keyset.keydir("manifest-ca").join("cert.pem"))?,
        false,
    );
    cpio.tree(&keyset.keydir("pcr7data"), "pcr7data")?;
    if let Some(mosctl) = mosctl {
        log::info!("inserting {} as mosctl", mosctl.display());
        cpio.dir("usr");
        cpio.dir("usr/bin");
        cpio.file("usr/bin/mosctl", &paths::read(mosctl)?, true);
    }
    gzip(&cpio.finish())
}

fn optional_section(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    match pe::section_data(bytes, name) {
        Ok(data) => Ok(data),
        Err(PeError::MissingSection(_)) => Ok(vec![]),
        Err(e) => Err(e.into()),
    }
}

/// Rebuild the UKI `kernel` with the keyset's trust cpio appended to its
/// initrd, and sign the result into `out` with `uki-production`.
pub fn build_uki(keyset: &Keyset, kernel: &Path, out: &Path, mosctl: Option<&Path>) -> Result<()> {
    let bytes = paths::read(kernel)?;
    let linux = pe::section_data(&bytes, ".linux")?;
    let mut initrd = pe::section_data(&bytes, ".initrd")?;
    let cmdline = optional_section(&bytes, ".cmdline")?;
    let sbat = optional_section(&bytes, ".sbat")?;
    initrd.extend_from_slice(&trust_cpio(keyset, mosctl)?);

    let scratch = tempfile::tempdir()?;
    let write = |name: &str, data: &[u8]| -> Result<std::path::PathBuf> {
        let path = scratch.path().join(name);
        paths::write_mode(&path, data, 0o644)?;
        Ok(path)
    };
    let sections = [
        SectionInput::new(".cmdline", CMDLINE_VMA, &write("cmdline", &cmdline)?),
        SectionInput::new(".sbat", SBAT_VMA, &write("sbat", &sbat)?).with_alignment(SBAT_ALIGNMENT),
        SectionInput::new(".linux", LINUX_VMA, &write("linux", &linux)?),
        SectionInput::new(".initrd", INITRD_VMA, &write("initrd", &initrd)?),
    ];
    let unsigned = scratch.path().join("kernel.efi");
    pe::set_sections(kernel, &unsigned, &sections)?;

    let signer = keyset.keydir("uki-production");
    sign_efi_file(
        &unsigned,
        out,
        &signer.join("privkey.pem"),
        &signer.join("cert.pem"),
    )?;
    log::info!("built {} for keyset {}", out.display(), keyset.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use flate2::read::GzDecoder;
    use std::io::Read;

    /// (name, mode, data) of each entry, stopping at the trailer.
    fn entries(mut buf: &[u8]) -> Result<Vec<(String, u32, Vec<u8>)>> {
        let mut out = vec![];
        let mut offset = 0;
        loop {
            assert_eq!(&buf[..6], NEWC_MAGIC.as_bytes());
            let field = |i: usize| -> Result<usize> {
                let s = std::str::from_utf8(&buf[6 + i * 8..14 + i * 8])?;
                Ok(usize::from_str_radix(s, 16)?)
            };
            let (mode, size, namesize) = (field(1)?, field(6)?, field(11)?);
            let name = std::str::from_utf8(&buf[110..110 + namesize - 1])?.to_string();
            let data_start = (offset + 110 + namesize + 3) / 4 * 4 - offset;
            let data = buf[data_start..data_start + size].to_vec();
            if name == TRAILER {
                return Ok(out);
            }
            out.push((name, mode as u32, data));
            let next = (offset + data_start + size + 3) / 4 * 4 - offset;
            offset += next;
            buf = &buf[next..];
        }
    }

    #[test]
    fn newc_layout() -> Result<()> {
        let mut cpio = Cpio::new();
        cpio.file("manifestCA.pem", b"pem", false);
        cpio.dir("usr");
        cpio.file("usr/mosctl", b"#!/bin/sh\n", true);
        let buf = cpio.finish();
        assert_eq!(buf.len() % 4, 0);
        assert_eq!(
            entries(&buf)?,
            vec![
                ("manifestCA.pem".into(), MODE_FILE, b"pem".to_vec()),
                ("usr".into(), MODE_DIR, vec![]),
                ("usr/mosctl".into(), MODE_EXEC, b"#!/bin/sh\n".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn tree_and_gzip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("pcr7data");
        std::fs::create_dir_all(src.join("policy-1/abcd"))?;
        std::fs::write(src.join("policy-1/abcd/tpm_luks.policy.signed"), b"sig")?;
        std::fs::write(src.join("info.json"), b"{}")?;
        let mut cpio = Cpio::new();
        cpio.tree(&src, "pcr7data")?;
        let raw = cpio.finish();

        let mut unpacked = vec![];
        GzDecoder::new(&gzip(&raw)?[..]).read_to_end(&mut unpacked)?;
        assert_eq!(unpacked, raw);
        let names: Vec<_> = entries(&raw)?.into_iter().map(|e| e.0).collect();
        assert_eq!(
            names,
            vec![
                "pcr7data",
                "pcr7data/info.json",
                "pcr7data/policy-1",
                "pcr7data/policy-1/abcd",
                "pcr7data/policy-1/abcd/tpm_luks.policy.signed",
            ]
        );
        Ok(())
    }
}
