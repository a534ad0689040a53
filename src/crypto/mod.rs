//! Key, certificate and signature primitives.
use crate::paths::PathError;
use thiserror::Error;

pub mod authenticode;
pub mod cert;
pub mod pem;
pub mod sign;

pub use cert::{issue, CertTemplate, Subject};
pub use pem::{
    generate_key, read_cert, read_private_key, read_public_key, write_cert, write_private_key,
    write_public_key,
};
pub use sign::{sign_file, verify_cert_chain, verify_manifest, CA_SEARCH_PATHS};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
    #[error("signature verification failed")]
    Signature,
    #[error("certificate does not chain to any of the candidate CAs: {0}")]
    Chain(String),
    #[error("invalid PE/COFF image: {0}")]
    Pe(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = CryptoError> = core::result::Result<T, E>;

impl From<der::Error> for CryptoError {
    fn from(e: der::Error) -> Self {
        CryptoError::Encode(e.to_string())
    }
}

impl From<x509_cert::builder::Error> for CryptoError {
    fn from(e: x509_cert::builder::Error) -> Self {
        CryptoError::Sign(e.to_string())
    }
}
