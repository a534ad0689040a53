use super::{CryptoError, Result};
use crate::paths;
use der::pem::LineEnding;
use der::{Decode, DecodePem, Encode, EncodePem};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use x509_cert::Certificate;

pub const KEY_BITS: usize = 2048;
pub const PRIVATE_KEY_MODE: u32 = 0o600;
pub const CERT_MODE: u32 = 0o640;
pub const PUBLIC_KEY_MODE: u32 = 0o644;

pub fn generate_key() -> Result<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    key.validate()
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    Ok(key)
}

/// Reads a PKCS#8 private key, falling back to PKCS#1 for older keys.
pub fn read_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = paths::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| CryptoError::Parse {
            what: "private key",
            reason: format!("{}: {e}", path.display()),
        })
}

pub fn private_key_pem(key: &RsaPrivateKey) -> Result<String> {
    Ok(key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Encode(e.to_string()))?
        .to_string())
}

/// Writes a PKCS#8 private key readable only by its owner. Never overwrites.
pub fn write_private_key(path: &Path, key: &RsaPrivateKey) -> Result<()> {
    Ok(paths::write_new(
        path,
        private_key_pem(key)?.as_bytes(),
        PRIVATE_KEY_MODE,
    )?)
}

pub fn read_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = paths::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| CryptoError::Parse {
        what: "public key",
        reason: format!("{}: {e}", path.display()),
    })
}

pub fn write_public_key(path: &Path, key: &RsaPublicKey) -> Result<()> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Encode(e.to_string()))?;
    Ok(paths::write_mode(path, pem.as_bytes(), PUBLIC_KEY_MODE)?)
}

pub fn parse_cert(pem: &[u8]) -> Result<Certificate> {
    Certificate::from_pem(pem).map_err(|e| CryptoError::Parse {
        what: "certificate",
        reason: e.to_string(),
    })
}

pub fn read_cert(path: &Path) -> Result<Certificate> {
    parse_cert(&paths::read(path)?).map_err(|e| match e {
        CryptoError::Parse { what, reason } => CryptoError::Parse {
            what,
            reason: format!("{}: {reason}", path.display()),
        },
        e => e,
    })
}

/// The DER bytes of a PEM certificate on disk, exactly as encoded in the file.
pub fn read_cert_der(path: &Path) -> Result<Vec<u8>> {
    let pem = paths::read(path)?;
    let parse_err = |reason: String| CryptoError::Parse {
        what: "certificate",
        reason: format!("{}: {reason}", path.display()),
    };
    let (label, der) = der::pem::decode_vec(&pem).map_err(|e| parse_err(e.to_string()))?;
    if label != "CERTIFICATE" {
        return Err(parse_err(format!("unexpected PEM label {label}")));
    }
    Certificate::from_der(&der).map_err(|e| parse_err(e.to_string()))?;
    Ok(der)
}

pub fn cert_pem(cert: &Certificate) -> Result<String> {
    Ok(cert.to_pem(LineEnding::LF)?)
}

pub fn write_cert(path: &Path, cert: &Certificate) -> Result<()> {
    Ok(paths::write_new(path, cert_pem(cert)?.as_bytes(), CERT_MODE)?)
}

/// The RSA public key carried in a certificate.
pub fn cert_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
    RsaPublicKey::from_public_key_der(&spki).map_err(|e| CryptoError::Parse {
        what: "certificate public key",
        reason: e.to_string(),
    })
}
