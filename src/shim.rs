//! Editing the vendor certificate databases compiled into shim.
use crate::efi::{EfiError, SignatureDatabase};
use crate::pe::{self, PeError, SectionInput};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const VENDOR_CERT_SECTION: &str = ".vendor_cert";
pub const VENDOR_CERT_VMA: u64 = 0xb4000;
const CERT_TABLE_SIZE: u32 = 16;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("failed to replace {VENDOR_CERT_SECTION}: {0}")]
    SectionReplace(#[source] PeError),
    #[error("malformed {VENDOR_CERT_SECTION} section: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Efi(#[from] EfiError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ShimError> = core::result::Result<T, E>;

/// shim's `cert_table`: sizes and offsets of the allow and deny databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertTable {
    pub auth_size: u32,
    pub deauth_size: u32,
    pub auth_offset: u32,
    pub deauth_offset: u32,
}

impl CertTable {
    pub fn new(db_size: usize, dbx_size: usize) -> Self {
        Self {
            auth_size: db_size as u32,
            deauth_size: dbx_size as u32,
            auth_offset: CERT_TABLE_SIZE,
            deauth_offset: CERT_TABLE_SIZE + db_size as u32,
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.auth_size.to_ne_bytes());
        out[4..8].copy_from_slice(&self.deauth_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.auth_offset.to_ne_bytes());
        out[12..16].copy_from_slice(&self.deauth_offset.to_ne_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let field = |i: usize| -> Result<u32> {
            bytes
                .get(i * 4..i * 4 + 4)
                .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or(ShimError::Malformed("truncated cert_table"))
        };
        Ok(Self {
            auth_size: field(0)?,
            deauth_size: field(1)?,
            auth_offset: field(2)?,
            deauth_offset: field(3)?,
        })
    }
}

/// The full `.vendor_cert` section contents for `db` and `dbx`.
pub fn vendor_db_section(db: &SignatureDatabase, dbx: &SignatureDatabase) -> Vec<u8> {
    let (db, dbx) = (db.to_bytes(), dbx.to_bytes());
    let mut out = CertTable::new(db.len(), dbx.len()).to_bytes().to_vec();
    out.extend_from_slice(&db);
    out.extend_from_slice(&dbx);
    out
}

/// Replace the vendor databases of the shim at `shim` in place. The file is
/// only replaced once objcopy has produced a complete output.
pub fn set_vendor_db(shim: &Path, db: &SignatureDatabase, dbx: &SignatureDatabase) -> Result<()> {
    let mut section = tempfile::NamedTempFile::new()?;
    section.write_all(&vendor_db_section(db, dbx))?;
    section.flush()?;

    let dir = shim.parent().unwrap_or_else(|| Path::new("."));
    let output = tempfile::NamedTempFile::new_in(dir)?;
    pe::set_sections(
        shim,
        output.path(),
        &[SectionInput::new(VENDOR_CERT_SECTION, VENDOR_CERT_VMA, section.path())],
    )
    .map_err(ShimError::SectionReplace)?;
    output.persist(shim).map_err(|e| e.error)?;
    log::debug!("updated vendor db of {}", shim.display());
    Ok(())
}

/// Reads back the (db, dbx) pair from a shim binary.
pub fn read_vendor_db(shim: &Path) -> Result<(SignatureDatabase, SignatureDatabase)> {
    let section = pe::read_section(shim, VENDOR_CERT_SECTION)?;
    let table = CertTable::parse(&section)?;
    let slice = |off: u32, len: u32| {
        section
            .get(off as usize..off as usize + len as usize)
            .ok_or(ShimError::Malformed("database outside section"))
    };
    Ok((
        SignatureDatabase::parse(slice(table.auth_offset, table.auth_size)?)?,
        SignatureDatabase::parse(slice(table.deauth_offset, table.deauth_size)?)?,
    ))
}
