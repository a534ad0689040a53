//! UEFI `EFI_SIGNATURE_DATA`, `EFI_SIGNATURE_LIST` and signature databases.
use crate::crypto::{pem::read_cert_der, CryptoError};
use crate::paths::{self, PathError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::{uuid, Uuid};

pub const GLOBAL_VARIABLE_GUID: Uuid = uuid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");
pub const IMAGE_SECURITY_DATABASE_GUID: Uuid = uuid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");
pub const SHIM_LOCK_GUID: Uuid = uuid!("605dab50-e046-4300-abb6-3dd810dd8b23");
pub const CERT_X509_GUID: Uuid = uuid!("a5c059a1-94e4-4aa7-87b5-ab155c2bf072");
pub const CERT_SHA256_GUID: Uuid = uuid!("c1c41626-504c-4092-aca9-41f936934328");
pub const SHIM_VENDOR_GUID: Uuid = Uuid::nil();

/// Owner of the single hash in the dbx shipped with OVMF.
pub const DBX_OWNER_GUID: Uuid = uuid!("a0baa8a3-041d-48a8-bc87-c36d121b5e3d");
pub const DBX_HASH: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

const GUID_SIZE: usize = 16;
const LIST_HEADER_SIZE: usize = GUID_SIZE + 12;

#[derive(Error, Debug)]
pub enum EfiError {
    #[error("signature list entries must all be {expected} bytes, found {found}")]
    NonHomogeneous { expected: usize, found: usize },
    #[error("malformed signature list: {0}")]
    Malformed(&'static str),
    #[error("invalid guid in {path}: {source}")]
    Guid {
        path: PathBuf,
        source: uuid::Error,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = EfiError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub owner: Uuid,
    pub data: Vec<u8>,
}

impl SignatureData {
    pub fn new(owner: Uuid, data: Vec<u8>) -> Self {
        Self { owner, data }
    }

    pub fn size(&self) -> usize {
        GUID_SIZE + self.data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.owner.to_bytes_le());
        out.extend_from_slice(&self.data);
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GUID_SIZE {
            return Err(EfiError::Malformed("signature shorter than its owner"));
        }
        let mut owner = [0u8; GUID_SIZE];
        owner.copy_from_slice(&bytes[..GUID_SIZE]);
        Ok(Self {
            owner: Uuid::from_bytes_le(owner),
            data: bytes[GUID_SIZE..].to_vec(),
        })
    }
}

/// A homogeneous list of signatures of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureList {
    sig_type: Uuid,
    header: Vec<u8>,
    signatures: Vec<SignatureData>,
}

impl SignatureList {
    pub fn new(sig_type: Uuid, header: Vec<u8>, signatures: Vec<SignatureData>) -> Result<Self> {
        if let Some(first) = signatures.first() {
            let expected = first.size();
            if let Some(odd) = signatures.iter().find(|s| s.size() != expected) {
                return Err(EfiError::NonHomogeneous {
                    expected,
                    found: odd.size(),
                });
            }
        }
        Ok(Self {
            sig_type,
            header,
            signatures,
        })
    }

    pub fn x509(cert: SignatureData) -> Self {
        Self {
            sig_type: CERT_X509_GUID,
            header: vec![],
            signatures: vec![cert],
        }
    }

    pub fn sig_type(&self) -> Uuid {
        self.sig_type
    }

    pub fn signatures(&self) -> &[SignatureData] {
        &self.signatures
    }

    fn signature_size(&self) -> usize {
        self.signatures.first().map(SignatureData::size).unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        LIST_HEADER_SIZE + self.header.len() + self.signatures.len() * self.signature_size()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.sig_type.to_bytes_le());
        out.extend_from_slice(&(self.size() as u32).to_le_bytes());
        out.extend_from_slice(&(self.header.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.signature_size() as u32).to_le_bytes());
        out.extend_from_slice(&self.header);
        for sig in &self.signatures {
            out.extend_from_slice(&sig.to_bytes());
        }
        out
    }

    /// Parses one list from the front of `bytes`, returning it and the bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < LIST_HEADER_SIZE {
            return Err(EfiError::Malformed("truncated list header"));
        }
        let u32_at = |o: usize| {
            u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as usize
        };
        let mut guid = [0u8; GUID_SIZE];
        guid.copy_from_slice(&bytes[..GUID_SIZE]);
        let list_size = u32_at(16);
        let header_size = u32_at(20);
        let sig_size = u32_at(24);
        if list_size > bytes.len() || list_size < LIST_HEADER_SIZE + header_size {
            return Err(EfiError::Malformed("list size out of range"));
        }
        let body = &bytes[LIST_HEADER_SIZE + header_size..list_size];
        if sig_size < GUID_SIZE || body.len() % sig_size != 0 {
            return Err(EfiError::Malformed("signature size does not divide list"));
        }
        let signatures = body
            .chunks(sig_size)
            .map(SignatureData::parse)
            .collect::<Result<Vec<_>>>()?;
        let list = Self {
            sig_type: Uuid::from_bytes_le(guid),
            header: bytes[LIST_HEADER_SIZE..LIST_HEADER_SIZE + header_size].to_vec(),
            signatures,
        };
        Ok((list, list_size))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureDatabase(pub Vec<SignatureList>);

impl SignatureDatabase {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(SignatureList::to_bytes).collect()
    }

    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        let mut lists = vec![];
        while !bytes.is_empty() {
            let (list, used) = SignatureList::parse(bytes)?;
            lists.push(list);
            bytes = &bytes[used..];
        }
        Ok(Self(lists))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One X.509 list per certificate, as `efisiglist` lays them out.
pub fn new_db_from_certs(certs: Vec<SignatureData>) -> SignatureDatabase {
    SignatureDatabase(certs.into_iter().map(SignatureList::x509).collect())
}

/// The DER certificate of a key directory, owned by the nil GUID.
pub fn load_keydir(dir: &Path) -> Result<SignatureData> {
    Ok(SignatureData::new(
        Uuid::nil(),
        read_cert_der(&dir.join("cert.pem"))?,
    ))
}

/// The `guid` file of a key directory.
pub fn read_guid(dir: &Path) -> Result<Uuid> {
    let path = dir.join("guid");
    let text = paths::read_to_string(&path)?;
    Uuid::parse_str(text.trim()).map_err(|source| EfiError::Guid { path, source })
}

/// A key directory's certificate owned by its own GUID.
pub fn load_keydir_owned(dir: &Path) -> Result<SignatureData> {
    let mut sig = load_keydir(dir)?;
    sig.owner = read_guid(dir)?;
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn dbx_owner_raw_bytes() {
        assert_eq!(
            hex::encode(DBX_OWNER_GUID.to_bytes_le()),
            "a3a8baa01d04a848bc87c36d121b5e3d"
        );
    }

    #[test]
    fn list_layout() -> Result<()> {
        let sig = SignatureData::new(CERT_SHA256_GUID, vec![0xaa; 4]);
        let list = SignatureList::new(CERT_X509_GUID, vec![], vec![sig.clone(), sig])?;
        let bytes = list.to_bytes();
        assert_eq!(bytes.len(), 28 + 2 * 20);
        assert_eq!(&bytes[..16], &CERT_X509_GUID.to_bytes_le());
        assert_eq!(&bytes[16..20], &68u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &20u32.to_le_bytes());
        assert_eq!(&bytes[28..44], &CERT_SHA256_GUID.to_bytes_le());
        assert_eq!(&bytes[44..48], &[0xaa; 4]);
        Ok(())
    }

    #[test]
    fn rejects_mixed_sizes() {
        let res = SignatureList::new(
            CERT_X509_GUID,
            vec![],
            vec![
                SignatureData::new(Uuid::nil(), vec![1]),
                SignatureData::new(Uuid::nil(), vec![1, 2]),
            ],
        );
        assert!(matches!(
            res,
            Err(EfiError::NonHomogeneous {
                expected: 17,
                found: 18
            })
        ));
    }

    #[test]
    fn database_parses_back() -> Result<()> {
        let db = new_db_from_certs(vec![
            SignatureData::new(SHIM_LOCK_GUID, vec![1, 2, 3]),
            SignatureData::new(Uuid::nil(), vec![9; 40]),
        ]);
        let with_header = SignatureList::new(
            CERT_SHA256_GUID,
            vec![7, 7],
            vec![SignatureData::new(DBX_OWNER_GUID, DBX_HASH.to_vec())],
        )?;
        let mut lists = db.0.clone();
        lists.push(with_header);
        let db = SignatureDatabase(lists);
        assert_eq!(SignatureDatabase::parse(&db.to_bytes())?, db);
        assert!(SignatureDatabase::parse(&db.to_bytes()[..30]).is_err());
        Ok(())
    }

    #[test]
    fn empty_database() -> Result<()> {
        assert!(SignatureDatabase::default().to_bytes().is_empty());
        assert!(SignatureDatabase::parse(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn guid_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("guid"), "605dab50-e046-4300-abb6-3dd810dd8b23\n")?;
        assert_eq!(read_guid(dir.path())?, SHIM_LOCK_GUID);
        std::fs::write(dir.path().join("guid"), "nope")?;
        assert!(matches!(read_guid(dir.path()), Err(EfiError::Guid { .. })));
        Ok(())
    }
}
