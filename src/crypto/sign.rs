//! PKCS#1 v1.5 file signatures and manifest verification.
use super::pem::{cert_public_key, read_cert, read_private_key};
use super::{CryptoError, Result};
use crate::paths;
use der::Encode;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use x509_cert::Certificate;

/// Host locations searched for the manifest CA before the caller's path.
pub const CA_SEARCH_PATHS: [&str; 4] = [
    "/factory/secure/manifestCA.pem",
    "/factory/secure/layerCA.pem",
    "/manifestCA.pem",
    "/layerCA.pem",
];

pub const SIGNATURE_MODE: u32 = 0o644;

/// PKCS#1 v1.5 signature over SHA-256 of `data`.
pub fn sign_bytes(data: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let signer = SigningKey::<Sha256>::new(key.clone());
    let signature = signer
        .try_sign(data)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;
    Ok(signature.to_vec())
}

pub fn verify_bytes(data: &[u8], signature: &[u8], key: &RsaPublicKey) -> Result<()> {
    let signature = Signature::try_from(signature).map_err(|_| CryptoError::Signature)?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .map_err(|_| CryptoError::Signature)
}

/// Sign the contents of `source` with the PKCS#8 key at `key_path`, writing the raw
/// signature to `signed`. `signed` may be `source` itself.
pub fn sign_file(source: &Path, signed: &Path, key_path: &Path) -> Result<()> {
    let key = read_private_key(key_path)?;
    let data = paths::read(source)?;
    let signature = sign_bytes(&data, &key)?;
    paths::write_mode(signed, &signature, SIGNATURE_MODE)?;
    log::debug!("signed {} into {}", source.display(), signed.display());
    Ok(())
}

/// Checks that `cert` was issued by `ca` and is currently valid.
pub fn verify_issued_by(cert: &Certificate, ca: &Certificate) -> Result<()> {
    let tbs = &cert.tbs_certificate;
    if tbs.issuer != ca.tbs_certificate.subject {
        return Err(CryptoError::Chain("issuer does not match CA subject".into()));
    }
    let now = SystemTime::now();
    if now < tbs.validity.not_before.to_system_time() || now > tbs.validity.not_after.to_system_time()
    {
        return Err(CryptoError::Chain("certificate is not currently valid".into()));
    }
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| CryptoError::Chain("certificate signature is not octet aligned".into()))?;
    verify_bytes(&tbs.to_der()?, signature, &cert_public_key(ca)?)
        .map_err(|_| CryptoError::Chain("bad signature from CA".into()))
}

/// Fixed host CA paths followed by the caller-supplied one.
pub fn candidate_cas(ca_path: Option<&Path>) -> Vec<PathBuf> {
    CA_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .chain(ca_path.map(Path::to_path_buf))
        .collect()
}

/// Returns the first readable candidate CA under which `cert` verifies.
pub fn verify_cert_chain(cert: &Certificate, candidates: &[PathBuf]) -> Result<PathBuf> {
    let mut reasons = vec![];
    for path in candidates {
        let ca = match read_cert(path) {
            Ok(ca) => ca,
            Err(_) => continue,
        };
        match verify_issued_by(cert, &ca) {
            Ok(()) => {
                log::debug!("certificate verified against {}", path.display());
                return Ok(path.clone());
            }
            Err(e) => reasons.push(format!("{}: {e}", path.display())),
        }
    }
    if reasons.is_empty() {
        reasons.push("no readable CA".to_string());
    }
    Err(CryptoError::Chain(reasons.join("; ")))
}

pub fn verify_manifest_with(
    contents: &[u8],
    sig_path: &Path,
    cert_path: &Path,
    candidates: &[PathBuf],
) -> Result<()> {
    let cert = read_cert(cert_path)?;
    verify_cert_chain(&cert, candidates)?;
    let signature = paths::read(sig_path)?;
    verify_bytes(contents, &signature, &cert_public_key(&cert)?)
}

/// Verify `contents` against the detached signature at `sig_path`, made by the leaf
/// at `cert_path`, which must chain to one of the candidate CAs.
pub fn verify_manifest(
    contents: &[u8],
    sig_path: &Path,
    cert_path: &Path,
    ca_path: &Path,
) -> Result<()> {
    verify_manifest_with(contents, sig_path, cert_path, &candidate_cas(Some(ca_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{issue, years_from_now, CertTemplate, Issuer, Subject};
    use crate::crypto::pem::{generate_key, write_cert, write_private_key};
    use eyre::Result;

    struct Pki {
        _dir: tempfile::TempDir,
        ca: PathBuf,
        cert: PathBuf,
        key: PathBuf,
        other_ca: PathBuf,
    }

    fn pki() -> Result<Pki> {
        let dir = tempfile::tempdir()?;
        let ca_key = generate_key()?;
        let ca = issue(
            &CertTemplate::ca(Subject::new("Manifest rootCA"), years_from_now(25)),
            &ca_key.to_public_key(),
            Issuer::SelfSigned(&ca_key),
        )?;
        let leaf_key = generate_key()?;
        let leaf = issue(
            &CertTemplate::code_signing(Subject::new("manifest PRODUCT:x"), years_from_now(20)),
            &leaf_key.to_public_key(),
            Issuer::Ca {
                cert: &ca,
                key: &ca_key,
            },
        )?;
        let other_key = generate_key()?;
        let other = issue(
            &CertTemplate::ca(Subject::new("Manifest rootCA"), years_from_now(25)),
            &other_key.to_public_key(),
            Issuer::SelfSigned(&other_key),
        )?;
        let p = Pki {
            ca: dir.path().join("ca.pem"),
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("privkey.pem"),
            other_ca: dir.path().join("other.pem"),
            _dir: dir,
        };
        write_cert(&p.ca, &ca)?;
        write_cert(&p.cert, &leaf)?;
        write_cert(&p.other_ca, &other)?;
        write_private_key(&p.key, &leaf_key)?;
        Ok(p)
    }

    #[test]
    fn sign_then_verify() -> Result<()> {
        let p = pki()?;
        let dir = tempfile::tempdir()?;
        let manifest = dir.path().join("install.yaml");
        let signed = dir.path().join("install.yaml.signed");
        std::fs::write(&manifest, b"version: 1\n")?;
        sign_file(&manifest, &signed, &p.key)?;

        verify_manifest_with(b"version: 1\n", &signed, &p.cert, &[p.ca.clone()])?;

        let tampered = verify_manifest_with(b"version: 2\n", &signed, &p.cert, &[p.ca.clone()]);
        assert!(matches!(tampered, Err(CryptoError::Signature)));
        Ok(())
    }

    #[test]
    fn chain_search_skips_unreadable_and_wrong_cas() -> Result<()> {
        let p = pki()?;
        let cert = read_cert(&p.cert)?;
        let found = verify_cert_chain(
            &cert,
            &[
                PathBuf::from("/nonexistent/manifestCA.pem"),
                p.other_ca.clone(),
                p.ca.clone(),
            ],
        )?;
        assert_eq!(found, p.ca);

        let err = verify_cert_chain(&cert, &[p.other_ca.clone()]);
        assert!(matches!(err, Err(CryptoError::Chain(_))));
        Ok(())
    }

    #[test]
    fn candidates_end_with_caller_path() {
        let c = candidate_cas(Some(Path::new("/tmp/ca.pem")));
        assert_eq!(c.len(), CA_SEARCH_PATHS.len() + 1);
        assert_eq!(c[0], PathBuf::from("/factory/secure/manifestCA.pem"));
        assert_eq!(c.last(), Some(&PathBuf::from("/tmp/ca.pem")));
    }
}
