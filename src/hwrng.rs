//! Passphrases from the hardware RNG, and seeding the kernel pool from it.
use crate::paths::{self, PathError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

pub const HWRNG: &str = "/dev/hwrng";
pub const POOLSIZE: &str = "/proc/sys/kernel/random/poolsize";
const PASSPHRASE_PREFIX: &str = "trust-";

/// Characters in the TPM admin password; some TPMs reject longer ones.
pub const ADMIN_PASSPHRASE_LEN: usize = 32;
pub const LUKS_PASSPHRASE_LEN: usize = 40;

#[derive(Error, Debug)]
pub enum HwrngError {
    #[error("{HWRNG}: {0}")]
    Read(std::io::Error),
    #[error("invalid pool size {0:?}")]
    PoolSize(String),
    #[error("passphrase must be longer than {}", PASSPHRASE_PREFIX.len())]
    TooShort,
    #[error("failed to seed /dev/urandom: {0}")]
    Seed(std::io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = HwrngError> = core::result::Result<T, E>;

pub fn read_from(source: &mut impl Read, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    source.read_exact(&mut buf).map_err(HwrngError::Read)?;
    Ok(buf)
}

pub fn hwrng_read(size: usize) -> Result<Vec<u8>> {
    let mut f = File::open(HWRNG).map_err(HwrngError::Read)?;
    read_from(&mut f, size)
}

/// `trust-` followed by hex of random bytes, `nchars` long.
pub fn passphrase_from(source: &mut impl Read, nchars: usize) -> Result<String> {
    if nchars <= PASSPHRASE_PREFIX.len() {
        return Err(HwrngError::TooShort);
    }
    // two characters per byte
    let random = read_from(source, (nchars - PASSPHRASE_PREFIX.len()) / 2 + 1)?;
    let mut s = format!("{PASSPHRASE_PREFIX}{}", hex::encode(random));
    s.truncate(nchars);
    Ok(s)
}

pub fn gen_passphrase(nchars: usize) -> Result<String> {
    let mut f = File::open(HWRNG).map_err(HwrngError::Read)?;
    passphrase_from(&mut f, nchars)
}

/// Bytes in the kernel entropy pool, from the pool size in bits.
pub fn pool_size(path: &Path) -> Result<usize> {
    let text = paths::read_to_string(path)?;
    text.trim()
        .parse::<usize>()
        .map(|bits| bits / 8)
        .map_err(|_| HwrngError::PoolSize(text.trim().to_string()))
}

/// Feed a pool's worth of hardware randomness into `/dev/urandom`.
pub fn hwrng_seed() -> Result<()> {
    let size = pool_size(Path::new(POOLSIZE))?;
    let random = hwrng_read(size)?;
    let mut urandom = OpenOptions::new()
        .write(true)
        .open("/dev/urandom")
        .map_err(HwrngError::Seed)?;
    urandom.write_all(&random).map_err(HwrngError::Seed)?;
    log::debug!("seeded /dev/urandom with {size} bytes from {HWRNG}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Cursor;

    #[test]
    fn passphrase_shape() -> Result<()> {
        let mut src = Cursor::new(vec![0xab; 64]);
        let pass = passphrase_from(&mut src, 40)?;
        assert_eq!(pass.len(), 40);
        assert!(pass.starts_with("trust-abab"));
        // (40 - 6) / 2 + 1 bytes consumed
        assert_eq!(src.position(), 18);

        let mut src = Cursor::new(vec![0x01; 64]);
        assert_eq!(passphrase_from(&mut src, 32)?.len(), 32);
        Ok(())
    }

    #[test]
    fn short_source_fails() {
        let mut src = Cursor::new(vec![0u8; 3]);
        assert!(matches!(
            passphrase_from(&mut src, 40),
            Err(HwrngError::Read(_))
        ));
        assert!(matches!(
            passphrase_from(&mut Cursor::new(vec![0u8; 8]), 6),
            Err(HwrngError::TooShort)
        ));
    }

    #[test]
    fn pool_size_in_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("poolsize");
        std::fs::write(&path, "4096\n")?;
        assert_eq!(pool_size(&path)?, 512);
        std::fs::write(&path, "lots")?;
        assert!(matches!(pool_size(&path), Err(HwrngError::PoolSize(_))));
        Ok(())
    }
}
