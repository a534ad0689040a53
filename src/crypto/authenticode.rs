//! Authenticode signing and verification of EFI PE images.
use super::pem::{cert_public_key, read_cert, read_private_key};
use super::sign::verify_bytes;
use super::{CryptoError, Result};
use crate::paths;
use crate::pe::HeaderOffsets;
use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::ContentInfo;
use cms::signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier};
use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Reader, Sequence, SliceReader};
use rsa::pkcs1v15::SigningKey;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::path::Path;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

const SPC_INDIRECT_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.4");
const SPC_PE_IMAGE_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.15");
const SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// SpcPeImageData with no flags and an empty SpcLink file.
const PE_IMAGE_DATA_DER: [u8; 11] = [
    0x30, 0x09, 0x03, 0x01, 0x00, 0xa0, 0x04, 0xa2, 0x02, 0x80, 0x00,
];

const WIN_CERT_REVISION_2_0: u16 = 0x0200;
const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
const WIN_CERT_HEADER: usize = 8;

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SpcAttributeTypeAndOptionalValue {
    value_type: ObjectIdentifier,
    #[asn1(optional = "true")]
    value: Option<Any>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct DigestInfo {
    digest_algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SpcIndirectDataContent {
    data: SpcAttributeTypeAndOptionalValue,
    message_digest: DigestInfo,
}

fn pe_err(e: crate::pe::PeError) -> CryptoError {
    CryptoError::Pe(e.to_string())
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// SHA-256 Authenticode digest: the whole image except the checksum, the
/// certificate table directory entry and the certificate table itself.
pub fn authenticode_digest(image: &[u8]) -> Result<[u8; 32]> {
    let offsets = HeaderOffsets::of(image).map_err(pe_err)?;
    let (table, size) = offsets.certificate_table_entry(image).map_err(pe_err)?;
    let end = if size == 0 { image.len() } else { table as usize };
    if end > image.len() || offsets.certificate_table + 8 > end {
        return Err(CryptoError::Pe("certificate table out of bounds".into()));
    }
    let mut hasher = Sha256::new();
    hasher.update(&image[..offsets.checksum]);
    hasher.update(&image[offsets.checksum + 4..offsets.certificate_table]);
    hasher.update(&image[offsets.certificate_table + 8..end]);
    let padding = align8(end) - end;
    hasher.update(&[0u8; 8][..padding]);
    Ok(hasher.finalize().into())
}

fn signed_data(digest: &[u8; 32], key: &RsaPrivateKey, cert: &Certificate) -> Result<Vec<u8>> {
    let sha256 = AlgorithmIdentifierOwned {
        oid: SHA256,
        parameters: None,
    };
    let indirect = SpcIndirectDataContent {
        data: SpcAttributeTypeAndOptionalValue {
            value_type: SPC_PE_IMAGE_DATA,
            value: Some(Any::from_der(&PE_IMAGE_DATA_DER)?),
        },
        message_digest: DigestInfo {
            digest_algorithm: sha256.clone(),
            digest: OctetString::new(digest.to_vec())?,
        },
    };
    let content = EncapsulatedContentInfo {
        econtent_type: SPC_INDIRECT_DATA,
        econtent: Some(Any::from_der(&indirect.to_der()?)?),
    };
    let signer = SigningKey::<Sha256>::new(key.clone());
    let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
        issuer: cert.tbs_certificate.issuer.clone(),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    });
    let cms_err = |e: cms::builder::Error| CryptoError::Sign(e.to_string());
    let signer_info =
        SignerInfoBuilder::new(&signer, sid, sha256.clone(), &content, None).map_err(cms_err)?;
    let info = SignedDataBuilder::new(&content)
        .add_digest_algorithm(sha256)
        .map_err(cms_err)?
        .add_certificate(CertificateChoices::Certificate(cert.clone()))
        .map_err(cms_err)?
        .add_signer_info::<SigningKey<Sha256>, rsa::pkcs1v15::Signature>(signer_info)
        .map_err(cms_err)?
        .build()
        .map_err(cms_err)?;
    Ok(info.to_der()?)
}

/// Appends an Authenticode signature by `key`/`cert` to `image`. Existing
/// signatures are kept; their table must sit at the end of the file.
pub fn sign_efi(image: &[u8], key: &RsaPrivateKey, cert: &Certificate) -> Result<Vec<u8>> {
    let offsets = HeaderOffsets::of(image).map_err(pe_err)?;
    let (table, size) = offsets.certificate_table_entry(image).map_err(pe_err)?;
    let mut out = image.to_vec();
    let table = if size == 0 {
        out.resize(align8(out.len()), 0);
        out.len()
    } else {
        if table as usize + size as usize != image.len() {
            return Err(CryptoError::Pe(
                "certificate table is not at the end of the image".into(),
            ));
        }
        table as usize
    };

    let digest = authenticode_digest(&out)?;
    let der = signed_data(&digest, key, cert)?;

    let entry_len = WIN_CERT_HEADER + der.len();
    out.extend_from_slice(&(entry_len as u32).to_le_bytes());
    out.extend_from_slice(&WIN_CERT_REVISION_2_0.to_le_bytes());
    out.extend_from_slice(&WIN_CERT_TYPE_PKCS_SIGNED_DATA.to_le_bytes());
    out.extend_from_slice(&der);
    out.resize(align8(out.len()), 0);

    let table_len = (out.len() - table) as u32;
    offsets.set_certificate_table_entry(&mut out, table as u32, table_len);
    offsets.update_checksum(&mut out);
    Ok(out)
}

/// The PKCS#7 blobs of every WIN_CERTIFICATE in the image.
pub fn signatures(image: &[u8]) -> Result<Vec<&[u8]>> {
    let offsets = HeaderOffsets::of(image).map_err(pe_err)?;
    let (table, size) = offsets.certificate_table_entry(image).map_err(pe_err)?;
    let (mut at, end) = (table as usize, table as usize + size as usize);
    if end > image.len() {
        return Err(CryptoError::Pe("certificate table out of bounds".into()));
    }
    let mut blobs = vec![];
    while size != 0 && at + WIN_CERT_HEADER <= end {
        let len = u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]) as usize;
        if len < WIN_CERT_HEADER || at + len > end {
            return Err(CryptoError::Pe("malformed WIN_CERTIFICATE".into()));
        }
        let kind = u16::from_le_bytes([image[at + 6], image[at + 7]]);
        if kind == WIN_CERT_TYPE_PKCS_SIGNED_DATA {
            blobs.push(&image[at + WIN_CERT_HEADER..at + len]);
        }
        at += align8(len);
    }
    Ok(blobs)
}

fn message_digest_attr(signed: &SignedData) -> Option<Vec<u8>> {
    let attrs = signed.signer_infos.0.iter().next()?.signed_attrs.as_ref()?;
    let attr = attrs.iter().find(|a| a.oid == MESSAGE_DIGEST)?;
    let value = attr.values.iter().next()?;
    value
        .decode_as::<OctetString>()
        .ok()
        .map(|o| o.as_bytes().to_vec())
}

fn verify_blob(blob: &[u8], digest: &[u8; 32], cert: &Certificate) -> Result<bool> {
    // trailing alignment padding is allowed after the DER
    let mut reader = SliceReader::new(blob)?;
    let info: ContentInfo = reader.decode()?;
    let signed: SignedData = info.content.decode_as()?;
    let Some(econtent) = signed.encap_content_info.econtent.as_ref() else {
        return Ok(false);
    };
    let indirect: SpcIndirectDataContent = econtent.decode_as()?;
    if indirect.message_digest.digest.as_bytes() != digest.as_slice() {
        return Ok(false);
    }
    if message_digest_attr(&signed).as_deref() != Some(Sha256::digest(econtent.value()).as_slice()) {
        return Ok(false);
    }
    let key = cert_public_key(cert)?;
    for signer in signed.signer_infos.0.iter() {
        let Some(attrs) = signer.signed_attrs.as_ref() else {
            continue;
        };
        if verify_bytes(&attrs.to_der()?, signer.signature.as_bytes(), &key).is_ok() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether any signature on `image` was made by `cert` over the image's
/// current contents. Malformed signatures are errors; mismatches are `false`.
pub fn verify_efi(image: &[u8], cert: &Certificate) -> Result<bool> {
    let digest = authenticode_digest(image)?;
    for blob in signatures(image)? {
        if verify_blob(blob, &digest, cert)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Sign the EFI binary at `input` into `output` with a PEM key and certificate.
pub fn sign_efi_file(input: &Path, output: &Path, key_path: &Path, cert_path: &Path) -> Result<()> {
    let key = read_private_key(key_path)?;
    let cert = read_cert(cert_path)?;
    let signed = sign_efi(&paths::read(input)?, &key, &cert)?;
    paths::write_mode(output, &signed, 0o644)?;
    log::info!("signed {} -> {}", input.display(), output.display());
    Ok(())
}

pub fn verify_efi_file(path: &Path, cert_path: &Path) -> Result<bool> {
    verify_efi(&paths::read(path)?, &read_cert(cert_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{issue, years_from_now, CertTemplate, Issuer, Subject};
    use crate::crypto::pem::generate_key;
    use crate::pe::testutil::synthetic_pe;
    use eyre::Result;

    fn signer(cn: &str) -> Result<(RsaPrivateKey, Certificate)> {
        let key = generate_key()?;
        let cert = issue(
            &CertTemplate::code_signing(Subject::new(cn), years_from_now(1)),
            &key.to_public_key(),
            Issuer::SelfSigned(&key),
        )?;
        Ok((key, cert))
    }

    #[test]
    fn sign_and_verify() -> Result<()> {
        let (key, cert) = signer("UKI")?;
        let (_, other) = signer("other")?;
        let image = synthetic_pe(&[(".text", vec![0xc3; 17])]);

        assert!(signatures(&image)?.is_empty());
        let signed = sign_efi(&image, &key, &cert)?;
        assert_eq!(signed.len() % 8, 0);
        assert_eq!(signatures(&signed)?.len(), 1);
        assert_eq!(authenticode_digest(&signed)?, authenticode_digest(&image)?);

        assert!(verify_efi(&signed, &cert)?);
        assert!(!verify_efi(&signed, &other)?);
        Ok(())
    }

    #[test]
    fn tampering_breaks_the_signature() -> Result<()> {
        let (key, cert) = signer("UKI")?;
        let image = synthetic_pe(&[(".text", vec![0xc3; 64])]);
        let mut signed = sign_efi(&image, &key, &cert)?;
        // first byte of .text
        signed[0x200] ^= 0xff;
        assert!(!verify_efi(&signed, &cert)?);
        Ok(())
    }

    #[test]
    fn second_signature_is_appended() -> Result<()> {
        let (k1, c1) = signer("first")?;
        let (k2, c2) = signer("second")?;
        let image = synthetic_pe(&[(".text", vec![0x90; 3])]);
        let signed = sign_efi(&sign_efi(&image, &k1, &c1)?, &k2, &c2)?;
        assert_eq!(signatures(&signed)?.len(), 2);
        assert!(verify_efi(&signed, &c1)?);
        assert!(verify_efi(&signed, &c2)?);
        Ok(())
    }

    #[test]
    fn unsigned_image_does_not_verify() -> Result<()> {
        let (_, cert) = signer("UKI")?;
        assert!(!verify_efi(&synthetic_pe(&[(".text", vec![0xc3])]), &cert)?);
        Ok(())
    }
}
