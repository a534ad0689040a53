//! EA policy digests gating the NV secrets, and the signed pcr7data tree that
//! carries them to the machine.
//!
//! Digests are computed the way a trial session would extend them, so no TPM is
//! needed to produce them.
use super::nv::{public_index_attributes, NvIndex};
use crate::crypto::pem::{cert_public_key, read_cert, write_public_key};
use crate::crypto::sign::sign_file;
use crate::crypto::CryptoError;
use crate::paths::{self, PathError};
use crate::pcr7::{byte_pair_swap_hex, KeyType, Pcr, Pcr7Values, PcrError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const TPM_CC_POLICY_NV: u32 = 0x0000_0149;
const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;
const TPM_ALG_SHA256: u16 = 0x000b;
const TPM_EO_EQ: u16 = 0x0000;
/// TPML_PCR_SELECTION for `sha256:7`.
const PCR7_SELECTION: [u8; 10] = [0, 0, 0, 1, 0x00, 0x0b, 3, 0x80, 0, 0];

pub const PCR7DATA_DIR: &str = "pcr7data";
pub const PUBKEYS_DIR: &str = "pubkeys";
pub const INFO_FILE: &str = "info.json";
pub const LUKS_POLICY_FILE: &str = "tpm_luks.policy.signed";
pub const PASSWD_POLICY_FILE: &str = "tpm_passwd.policy.signed";

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy version must be exactly 4 ascii digits, got {0:?}")]
    Version(String),
    #[error("pcr value must be 32 bytes, got {0}")]
    PcrLength(usize),
    #[error("no policy-N directory under {0}")]
    NoPolicyDir(PathBuf),
    #[error("failed to compute index name: {0}")]
    Name(#[from] tss_esapi::Error),
    #[error("malformed {path}: {source}")]
    Info {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("pcr7 belongs to a {found} key, {expected} needed")]
    KeyType { expected: KeyType, found: KeyType },
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = PolicyError> = core::result::Result<T, E>;

/// The ea-version counter, rendered as 4 ascii digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolicyVersion(u16);

impl PolicyVersion {
    pub const CURRENT: PolicyVersion = PolicyVersion(1);

    pub fn new(version: u16) -> Result<Self> {
        if version > 9999 {
            return Err(PolicyError::Version(version.to_string()));
        }
        Ok(Self(version))
    }

    pub fn number(self) -> u16 {
        self.0
    }

    /// `policy-N` under the pcr7data directory.
    pub fn dir_name(self) -> String {
        format!("policy-{}", self.0)
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for PolicyVersion {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PolicyError::Version(s.to_string()));
        }
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| PolicyError::Version(s.to_string()))
    }
}

fn as_pcr(value: &[u8]) -> Result<Pcr> {
    value
        .try_into()
        .map_err(|_| PolicyError::PcrLength(value.len()))
}

/// Extends `old` by `TPM2_PolicyPCR` over `sha256:7` holding `pcr7`.
pub fn policy_pcr(old: &Pcr, pcr7: &Pcr) -> Pcr {
    let mut hasher = Sha256::new();
    hasher.update(old);
    hasher.update(TPM_CC_POLICY_PCR.to_be_bytes());
    hasher.update(PCR7_SELECTION);
    hasher.update(Sha256::digest(pcr7));
    hasher.finalize().into()
}

/// Name of an sha256 NV index: `nameAlg || H(TPMS_NV_PUBLIC)`.
pub fn nv_name(index: u32, attributes: u32, size: u16) -> Vec<u8> {
    let mut public = Vec::with_capacity(14);
    public.extend_from_slice(&index.to_be_bytes());
    public.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
    public.extend_from_slice(&attributes.to_be_bytes());
    // empty authPolicy
    public.extend_from_slice(&0u16.to_be_bytes());
    public.extend_from_slice(&size.to_be_bytes());

    let mut name = TPM_ALG_SHA256.to_be_bytes().to_vec();
    name.extend_from_slice(&Sha256::digest(public));
    name
}

/// Extends `old` by `TPM2_PolicyNV(operand, offset 0, EQ)` against the index `name`.
pub fn policy_nv(old: &Pcr, operand: &[u8], name: &[u8]) -> Pcr {
    let mut args = Sha256::new();
    args.update(operand);
    args.update(0u16.to_be_bytes());
    args.update(TPM_EO_EQ.to_be_bytes());

    let mut hasher = Sha256::new();
    hasher.update(old);
    hasher.update(TPM_CC_POLICY_NV.to_be_bytes());
    hasher.update(args.finalize());
    hasher.update(name);
    hasher.finalize().into()
}

/// Name of the ea-version index once written.
pub fn ea_version_name() -> Result<Vec<u8>> {
    let attributes = u32::try_from(public_index_attributes()?)?;
    Ok(nv_name(NvIndex::EaVersion.value(), attributes, 4))
}

/// PCR7 must hold `prod_pcr7` and ea-version must equal `policy_version`.
pub fn gen_luks_policy(prod_pcr7: &[u8], policy_version: &str) -> Result<Pcr> {
    let version: PolicyVersion = policy_version.parse()?;
    let digest = policy_pcr(&[0; 32], &as_pcr(prod_pcr7)?);
    Ok(policy_nv(
        &digest,
        version.to_string().as_bytes(),
        &ea_version_name()?,
    ))
}

/// PCR7 must hold `tpm_pcr7`.
pub fn gen_passwd_policy(tpm_pcr7: &[u8]) -> Result<Pcr> {
    Ok(policy_pcr(&[0; 32], &as_pcr(tpm_pcr7)?))
}

/// `info.json` of a pcr7data index directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignDataInfo {
    /// Name of the keyset the PCR7 value belongs to.
    pub key: String,
    pub key_type: KeyType,
    pub est_date: String,
    pub comment: String,
}

impl SignDataInfo {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(INFO_FILE);
        let text = paths::read(&path)?;
        serde_json::from_slice(&text).map_err(|source| PolicyError::Info { path, source })
    }
}

/// Directory of a PCR7 value under a `policy-N` directory.
pub fn index_dir(policy_dir: &Path, pcr7: &[u8]) -> PathBuf {
    let index = byte_pair_swap_hex(pcr7);
    policy_dir.join(&index[..2]).join(&index[2..])
}

/// Which authorizer signs a policy, and where its artifacts live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Gates the provisioned identity and LUKS keys, signed by `tpmpol-luks`.
    Luks,
    /// Gates the admin password, signed by `tpmpol-admin`.
    Passwd,
}

impl PolicyKind {
    pub fn pubkey_prefix(self) -> &'static str {
        match self {
            PolicyKind::Luks => "luks",
            PolicyKind::Passwd => "tpmpass",
        }
    }

    pub fn signed_file(self) -> &'static str {
        match self {
            PolicyKind::Luks => LUKS_POLICY_FILE,
            PolicyKind::Passwd => PASSWD_POLICY_FILE,
        }
    }

    pub fn signer_dir(self) -> &'static str {
        match self {
            PolicyKind::Luks => "tpmpol-luks",
            PolicyKind::Passwd => "tpmpol-admin",
        }
    }

    /// The UKI signer whose PCR7 the policy is bound to.
    pub fn key_type(self) -> KeyType {
        match self {
            PolicyKind::Luks => KeyType::Production,
            PolicyKind::Passwd => KeyType::Tpm,
        }
    }

    /// Whether the policy also checks ea-version.
    pub fn checks_version(self) -> bool {
        matches!(self, PolicyKind::Luks)
    }
}

/// `<policy dir>/pubkeys/<poltype>-<keyclass>.pem`.
pub fn pubkey_path(policy_dir: &Path, kind: PolicyKind, key_class: &str) -> PathBuf {
    policy_dir
        .join(PUBKEYS_DIR)
        .join(format!("{}-{key_class}.pem", kind.pubkey_prefix()))
}

/// The pcr7data entry matching a running PCR7 value.
#[derive(Debug, Clone)]
pub struct SignData {
    pub policy_dir: PathBuf,
    pub dir: PathBuf,
    pub info: SignDataInfo,
}

impl SignData {
    /// Looks `pcr7` up in the newest policy directory of `pcr7data`.
    pub fn choose(pcr7data: &Path, pcr7: &[u8]) -> Result<Self> {
        let policy_dir = policy_dir(pcr7data)?;
        let dir = index_dir(&policy_dir, pcr7);
        if !dir.join(INFO_FILE).exists() {
            return Err(PcrError::Layout(format!(
                "no signdata for pcr7 {} under {}",
                hex::encode(pcr7),
                policy_dir.display()
            ))
            .into());
        }
        let info = SignDataInfo::read(&dir)?;
        log::debug!("pcr7 signdata at {} ({})", dir.display(), info.key_type);
        Ok(Self {
            policy_dir,
            dir,
            info,
        })
    }

    /// Refuses unless the running PCR7 belongs to the signer `kind` is bound to.
    pub fn require(&self, kind: PolicyKind) -> Result<()> {
        let found = self.info.key_type;
        match kind.key_type() {
            expected if expected == found => Ok(()),
            KeyType::Production => Err(PcrError::NotProduction(found).into()),
            expected => Err(PolicyError::KeyType { expected, found }),
        }
    }

    pub fn pubkey(&self, kind: PolicyKind) -> PathBuf {
        pubkey_path(&self.policy_dir, kind, &self.info.key)
    }

    pub fn signed_policy(&self, kind: PolicyKind) -> PathBuf {
        self.dir.join(kind.signed_file())
    }
}

/// The highest numbered `policy-N` directory under `pcr7data`.
pub fn policy_dir(pcr7data: &Path) -> Result<PathBuf> {
    paths::subdirs(pcr7data)?
        .iter()
        .filter_map(|name| {
            name.strip_prefix("policy-")
                .and_then(|n| n.parse::<u32>().ok())
        })
        .max()
        .map(|n| pcr7data.join(format!("policy-{n}")))
        .ok_or_else(|| PolicyError::NoPolicyDir(pcr7data.to_path_buf()))
}

/// Materialize `pcr7data/policy-N` of the keyset rooted at `keyset` for `values`.
pub fn add_pcr7data(
    keyset: &Path,
    keyset_name: &str,
    values: &Pcr7Values,
    version: PolicyVersion,
) -> Result<PathBuf> {
    let luks = gen_luks_policy(&values.production, &version.to_string())?;
    let passwd = gen_passwd_policy(&values.tpm)?;

    let policy_dir = keyset.join(PCR7DATA_DIR).join(version.dir_name());
    paths::create_dir_mode(&policy_dir.join(PUBKEYS_DIR), 0o750)?;
    for kind in [PolicyKind::Passwd, PolicyKind::Luks] {
        let cert = read_cert(&keyset.join(kind.signer_dir()).join("cert.pem"))?;
        write_public_key(
            &pubkey_path(&policy_dir, kind, keyset_name),
            &cert_public_key(&cert)?,
        )?;
    }

    let est_date = chrono::Local::now().format("%Y%m%d").to_string();
    for key_type in [KeyType::Limited, KeyType::Tpm, KeyType::Production] {
        let dir = index_dir(&policy_dir, values.get(key_type));
        paths::create_dir_mode(&dir, 0o750)?;
        let info = SignDataInfo {
            key: keyset_name.to_string(),
            key_type,
            est_date: est_date.clone(),
            comment: format!("mos {keyset_name}"),
        };
        let json = serde_json::to_vec(&info).map_err(|source| PolicyError::Info {
            path: dir.join(INFO_FILE),
            source,
        })?;
        paths::write_mode(&dir.join(INFO_FILE), &json, 0o644)?;

        match key_type {
            KeyType::Limited => {
                paths::write_mode(&dir.join("pcr_limited.bin"), &values.limited, 0o644)?;
                paths::write_mode(&dir.join("pcr_tpm.bin"), &values.tpm, 0o644)?;
                paths::write_mode(&dir.join("pcr_prod.bin"), &values.production, 0o644)?;
            }
            KeyType::Tpm => sign_policy(keyset, &dir, PolicyKind::Passwd, &passwd)?,
            KeyType::Production => sign_policy(keyset, &dir, PolicyKind::Luks, &luks)?,
        }
    }
    log::info!(
        "added {} signdata for keyset {keyset_name}",
        policy_dir.display()
    );
    Ok(policy_dir)
}

fn sign_policy(keyset: &Path, dir: &Path, kind: PolicyKind, digest: &Pcr) -> Result<()> {
    let file = dir.join(kind.signed_file());
    paths::write_mode(&file, digest, 0o644)?;
    sign_file(
        &file,
        &file,
        &keyset.join(kind.signer_dir()).join("privkey.pem"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{issue, years_from_now, CertTemplate, Issuer, Subject};
    use crate::crypto::pem::{generate_key, read_public_key, write_cert, write_private_key};
    use crate::crypto::sign::verify_bytes;
    use eyre::Result;

    #[test]
    fn luks_policy_golden() -> Result<()> {
        let digest = gen_luks_policy(&[0; 32], "0001")?;
        assert_eq!(
            hex::encode(digest),
            "fa44e27cc4950c2f83bec1de2f92941c080d6715db9b4795d2c9ab6614cc0baf"
        );
        assert_eq!(gen_luks_policy(&[0; 32], "0001")?, digest);
        assert_ne!(gen_luks_policy(&[0; 32], "0002")?, digest);
        Ok(())
    }

    #[test]
    fn passwd_policy_golden() -> Result<()> {
        assert_eq!(
            hex::encode(gen_passwd_policy(&[0; 32])?),
            "8b5682d81b29435d08d79278150611dc7e5923b2fefcce684a09577b40130a8b"
        );
        Ok(())
    }

    #[test]
    fn ea_version_index_name() -> Result<()> {
        assert_eq!(
            hex::encode(ea_version_name()?),
            "000b9a2a448f2272a89720c1f37eef785dea317a40ef975bb78de155234f60c66a1a"
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_inputs() {
        for bad in ["1", "00001", "00a1", ""] {
            assert!(matches!(
                gen_luks_policy(&[0; 32], bad),
                Err(PolicyError::Version(_))
            ));
        }
        assert!(matches!(
            gen_passwd_policy(&[0; 20]),
            Err(PolicyError::PcrLength(20))
        ));
    }

    #[test]
    fn version_rendering() -> Result<()> {
        assert_eq!(PolicyVersion::CURRENT.to_string(), "0001");
        assert_eq!(PolicyVersion::CURRENT.dir_name(), "policy-1");
        assert_eq!("0042".parse::<PolicyVersion>()?, PolicyVersion::new(42)?);
        Ok(())
    }

    #[test]
    fn picks_highest_policy_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["policy-1", "policy-10", "policy-2", "other"] {
            std::fs::create_dir(dir.path().join(name))?;
        }
        assert_eq!(policy_dir(dir.path())?, dir.path().join("policy-10"));
        let empty = tempfile::tempdir()?;
        assert!(matches!(
            policy_dir(empty.path()),
            Err(PolicyError::NoPolicyDir(_))
        ));
        Ok(())
    }

    fn signer(keyset: &Path, name: &str) -> Result<()> {
        let dir = keyset.join(name);
        std::fs::create_dir_all(&dir)?;
        let key = generate_key()?;
        let cert = issue(
            &CertTemplate::code_signing(Subject::new(name), years_from_now(1)),
            &key.to_public_key(),
            Issuer::SelfSigned(&key),
        )?;
        write_cert(&dir.join("cert.pem"), &cert)?;
        write_private_key(&dir.join("privkey.pem"), &key)?;
        Ok(())
    }

    #[test]
    fn pcr7data_layout() -> Result<()> {
        let keyset = tempfile::tempdir()?;
        signer(keyset.path(), "tpmpol-admin")?;
        signer(keyset.path(), "tpmpol-luks")?;
        let values = Pcr7Values {
            production: [1; 32],
            limited: [2; 32],
            tpm: [3; 32],
        };
        let dir = add_pcr7data(keyset.path(), "test", &values, PolicyVersion::CURRENT)?;
        assert_eq!(dir, keyset.path().join("pcr7data/policy-1"));
        assert_eq!(policy_dir(&keyset.path().join(PCR7DATA_DIR))?, dir);

        let limited = index_dir(&dir, &values.limited);
        assert_eq!(limited, dir.join("02").join("02".repeat(31)));
        assert_eq!(std::fs::read(limited.join("pcr_tpm.bin"))?, vec![3; 32]);
        let info = SignDataInfo::read(&limited)?;
        assert_eq!(info.key, "test");
        assert_eq!(info.key_type, KeyType::Limited);
        assert_eq!(info.est_date.len(), 8);

        let prod = index_dir(&dir, &values.production);
        assert_eq!(SignDataInfo::read(&prod)?.key_type, KeyType::Production);
        let signature = std::fs::read(prod.join(LUKS_POLICY_FILE))?;
        let pubkey = read_public_key(&pubkey_path(&dir, PolicyKind::Luks, "test"))?;
        verify_bytes(&gen_luks_policy(&values.production, "0001")?, &signature, &pubkey)?;

        let chosen = SignData::choose(&keyset.path().join(PCR7DATA_DIR), &values.production)?;
        assert_eq!(chosen.dir, prod);
        chosen.require(PolicyKind::Luks)?;
        assert_eq!(
            chosen.pubkey(PolicyKind::Luks),
            dir.join("pubkeys/luks-test.pem")
        );
        let limited = SignData::choose(&keyset.path().join(PCR7DATA_DIR), &values.limited)?;
        assert!(matches!(
            limited.require(PolicyKind::Luks),
            Err(PolicyError::Pcr(PcrError::NotProduction(KeyType::Limited)))
        ));
        assert!(matches!(
            SignData::choose(&keyset.path().join(PCR7DATA_DIR), &[9; 32]),
            Err(PolicyError::Pcr(PcrError::Layout(_)))
        ));

        let tpm = index_dir(&dir, &values.tpm);
        let signature = std::fs::read(tpm.join(PASSWD_POLICY_FILE))?;
        let pubkey = read_public_key(&pubkey_path(&dir, PolicyKind::Passwd, "test"))?;
        verify_bytes(&gen_passwd_policy(&values.tpm)?, &signature, &pubkey)?;
        Ok(())
    }
}
