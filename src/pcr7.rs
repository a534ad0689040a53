//! Prediction of the PCR7 value a firmware measures when booting a keyset's
//! shim and UKI with Secure Boot enabled.
use crate::crypto::pem::read_cert_der;
use crate::efi::{
    self, EfiError, SignatureData, SignatureList, CERT_SHA256_GUID, DBX_HASH, DBX_OWNER_GUID,
    GLOBAL_VARIABLE_GUID, IMAGE_SECURITY_DATABASE_GUID, SHIM_LOCK_GUID, SHIM_VENDOR_GUID,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const SBAT_LEVEL: &[u8] = b"sbat,1,2021030218\n";

pub type Pcr = [u8; 32];

#[derive(Error, Debug)]
pub enum PcrError {
    #[error("missing certificate {0}")]
    MissingCert(PathBuf),
    #[error("failed to encode measurement: {0}")]
    Encode(String),
    #[error("unexpected pcr7data layout: {0}")]
    Layout(String),
    #[error("refusing to unlock with a {0} key")]
    NotProduction(KeyType),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

impl From<EfiError> for PcrError {
    fn from(e: EfiError) -> Self {
        PcrError::Encode(e.to_string())
    }
}

/// The three UKI signers a keyset can boot with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Production,
    Limited,
    Tpm,
}

impl KeyType {
    pub const ALL: [KeyType; 3] = [KeyType::Production, KeyType::Limited, KeyType::Tpm];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Production => "production",
            KeyType::Limited => "limited",
            KeyType::Tpm => "tpm",
        }
    }

    /// The keyset directory of this signer.
    pub fn keydir(self) -> String {
        format!("uki-{}", self.as_str())
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcr7Values {
    pub production: Pcr,
    pub limited: Pcr,
    pub tpm: Pcr,
}

impl Pcr7Values {
    pub fn get(&self, key: KeyType) -> &Pcr {
        match key {
            KeyType::Production => &self.production,
            KeyType::Limited => &self.limited,
            KeyType::Tpm => &self.tpm,
        }
    }
}

/// TCG `EFI_VARIABLE_DATA` event digest.
pub fn variable_data_digest(name: &str, guid: Uuid, data: &[u8]) -> Pcr {
    let name: Vec<u16> = name.encode_utf16().collect();
    let mut hasher = Sha256::new();
    hasher.update(guid.to_bytes_le());
    hasher.update((name.len() as u64).to_le_bytes());
    hasher.update((data.len() as u64).to_le_bytes());
    for unit in name {
        hasher.update(unit.to_le_bytes());
    }
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of the `EV_SEPARATOR` event with the normal (zero) value.
pub fn separator_digest() -> Pcr {
    Sha256::digest(0u32.to_le_bytes()).into()
}

pub fn extend(pcr: &Pcr, digest: &Pcr) -> Pcr {
    let mut hasher = Sha256::new();
    hasher.update(pcr);
    hasher.update(digest);
    hasher.finalize().into()
}

fn cert_of(keyset: &Path, keydir: &str) -> Result<Vec<u8>> {
    let path = keyset.join(keydir).join("cert.pem");
    if !path.exists() {
        return Err(PcrError::MissingCert(path));
    }
    Ok(read_cert_der(&path).map_err(|e| PcrError::Encode(e.to_string()))?)
}

/// The keydir's certificate owned by its `guid`.
fn owned_cert(keyset: &Path, keydir: &str) -> Result<SignatureData> {
    let data = cert_of(keyset, keydir)?;
    let owner = efi::read_guid(&keyset.join(keydir))?;
    Ok(SignatureData::new(owner, data))
}

fn cert_list(keyset: &Path, keydir: &str) -> Result<Vec<u8>> {
    Ok(SignatureList::x509(owned_cert(keyset, keydir)?).to_bytes())
}

fn dbx_list() -> Result<Vec<u8>> {
    let list = SignatureList::new(
        CERT_SHA256_GUID,
        vec![],
        vec![SignatureData::new(DBX_OWNER_GUID, DBX_HASH.to_vec())],
    )?;
    Ok(list.to_bytes())
}

/// Every measurement into PCR7 up to, but excluding, shim's vendor_db.
pub fn firmware_measurements(keyset: &Path) -> Result<Vec<Pcr>> {
    Ok(vec![
        variable_data_digest("SecureBoot", GLOBAL_VARIABLE_GUID, &[1]),
        variable_data_digest("PK", GLOBAL_VARIABLE_GUID, &cert_list(keyset, "uefi-pk")?),
        variable_data_digest("KEK", GLOBAL_VARIABLE_GUID, &cert_list(keyset, "uefi-kek")?),
        variable_data_digest(
            "db",
            IMAGE_SECURITY_DATABASE_GUID,
            &cert_list(keyset, "uefi-db")?,
        ),
        variable_data_digest("dbx", IMAGE_SECURITY_DATABASE_GUID, &dbx_list()?),
        separator_digest(),
        // shim verified against db
        variable_data_digest(
            "db",
            IMAGE_SECURITY_DATABASE_GUID,
            &owned_cert(keyset, "uefi-db")?.to_bytes(),
        ),
        variable_data_digest("SbatLevel", SHIM_LOCK_GUID, SBAT_LEVEL),
        variable_data_digest("MokListTrusted", SHIM_LOCK_GUID, &[1]),
    ])
}

/// The measurement shim makes when the UKI verifies against its vendor_db.
pub fn vendor_db_measurement(keyset: &Path, key: KeyType) -> Result<Pcr> {
    let sig = SignatureData::new(SHIM_VENDOR_GUID, cert_of(keyset, &key.keydir())?);
    Ok(variable_data_digest(
        "vendor_db",
        IMAGE_SECURITY_DATABASE_GUID,
        &sig.to_bytes(),
    ))
}

/// PCR7 for each UKI signer of the keyset rooted at `keyset`.
pub fn compute_pcr7(keyset: &Path) -> Result<Pcr7Values> {
    let base = firmware_measurements(keyset)?
        .iter()
        .fold([0u8; 32], |pcr, digest| extend(&pcr, digest));
    let value = |key| -> Result<Pcr> { Ok(extend(&base, &vendor_db_measurement(keyset, key)?)) };
    let values = Pcr7Values {
        production: value(KeyType::Production)?,
        limited: value(KeyType::Limited)?,
        tpm: value(KeyType::Tpm)?,
    };
    log::debug!(
        "pcr7 for {}: production {} limited {} tpm {}",
        keyset.display(),
        hex::encode(values.production),
        hex::encode(values.limited),
        hex::encode(values.tpm)
    );
    Ok(values)
}

/// Swap each pair of bytes of a PCR value and hex encode the result. This names
/// the pcr7data directory holding the value's policies.
pub fn byte_pair_swap_hex(pcr: &[u8]) -> String {
    let mut swapped = pcr.to_vec();
    for pair in swapped.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    hex::encode(swapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/pcr7")
    }

    #[test]
    fn fixture_keyset_matches_golden() -> Result<()> {
        let values = compute_pcr7(&fixtures())?;
        assert_eq!(
            hex::encode(values.production),
            "82e5561c94cc43956b48814f40dbd9452167114265c035c0c61856ecd8181ff6"
        );
        assert_eq!(
            hex::encode(values.limited),
            "05a20258a325e73a73d10a719ae135bb76b9d1aca66de85551232017d0fadbf1"
        );
        assert_eq!(
            hex::encode(values.tpm),
            "8e404bf708f91030a6e7236e37cbaadbd522849769d09e3f5d1570195b6ebca4"
        );
        Ok(())
    }

    #[test]
    fn values_are_distinct_and_nonzero() -> Result<()> {
        let v = compute_pcr7(&fixtures())?;
        assert_ne!(v.production, v.limited);
        assert_ne!(v.production, v.tpm);
        assert_ne!(v.limited, v.tpm);
        for key in KeyType::ALL {
            assert_ne!(v.get(key), &[0u8; 32]);
        }
        Ok(())
    }

    #[test]
    fn missing_uki_cert() -> Result<()> {
        let dir = tempfile::tempdir()?;
        crate::paths::copy_tree(&fixtures(), dir.path())?;
        std::fs::remove_file(dir.path().join("uki-tpm/cert.pem"))?;
        assert!(matches!(
            compute_pcr7(dir.path()),
            Err(PcrError::MissingCert(p)) if p.ends_with("uki-tpm/cert.pem")
        ));
        Ok(())
    }

    #[test]
    fn separator_and_swap() {
        assert_eq!(
            hex::encode(separator_digest()),
            "df3f619804a92fdb4057192dc43dd748ea778adc52bc498ce80524c014b81119"
        );
        assert_eq!(byte_pair_swap_hex(&[0x01, 0x02, 0xab, 0xcd]), "0201cdab");
    }

    #[test]
    fn key_type_names() -> Result<()> {
        assert_eq!(KeyType::Production.keydir(), "uki-production");
        assert_eq!(serde_json::to_string(&KeyType::Tpm)?, "\"tpm\"");
        let k: KeyType = serde_json::from_str("\"limited\"")?;
        assert_eq!(k, KeyType::Limited);
        Ok(())
    }
}
