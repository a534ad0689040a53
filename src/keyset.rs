//! Keysets: the CA roots, signers and per-project identities a product line
//! boots and provisions with.
//!
//! A keyset lives under `<data home>/machine/trust/keys/<name>/` with one
//! directory per key role, each holding `cert.pem`, `privkey.pem` and, for the
//! roles that end up in UEFI variables, a `guid`.
use crate::crypto::cert::{
    issue, sudi_not_after, years_from_now, CertTemplate, Issuer, Subject, EKU_CLIENT_AUTH,
    EKU_SERVER_AUTH,
};
use crate::crypto::pem::{
    generate_key, read_cert, read_private_key, write_cert, write_private_key,
};
use crate::crypto::CryptoError;
use crate::paths::{self, PathError};
use crate::pcr7::{compute_pcr7, Pcr, Pcr7Values, PcrError};
use crate::tpm::policy::{self, PolicyError, PolicyVersion};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use x509_cert::ext::pkix::KeyUsages;
use x509_cert::Certificate;

pub const DIR_MODE: u32 = 0o750;
pub const GUID_MODE: u32 = 0o640;
pub const DEFAULT_PROJECT: &str = "default";
const ORG_UNIT_PREFIX: &str = "Project Machine Project";

/// Every key directory of a keyset.
pub const KEYSET_DIRS: [&str; 12] = [
    "manifest",
    "manifest-ca",
    "pcr7data",
    "sudi-ca",
    "tpmpol-admin",
    "tpmpol-luks",
    "uefi-db",
    "uefi-kek",
    "uefi-pk",
    "uki-limited",
    "uki-production",
    "uki-tpm",
];

#[derive(Error, Debug)]
pub enum KeysetError {
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("{0} not found")]
    NotFound(PathBuf),
    #[error("invalid name {0:?}")]
    Name(String),
    #[error("unknown keyset item {0:?}")]
    Item(String),
    #[error("{path}: bad product uuid: {source}")]
    ProductUuid { path: PathBuf, source: uuid::Error },
    #[error("{path}: expected a 32 byte PCR value, got {len}")]
    PcrFile { path: PathBuf, len: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = KeysetError> = core::result::Result<T, E>;

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(KeysetError::Name(name.to_string()));
    }
    Ok(())
}

/// How one key directory of a fresh keyset is produced.
struct Role {
    dir: &'static str,
    common_name: &'static str,
    /// `None` for self-signed roots.
    signer: Option<&'static str>,
    years: u32,
    guid: bool,
}

const ROOTS: [Role; 3] = [
    Role {
        dir: "manifest-ca",
        common_name: "Manifest rootCA",
        signer: None,
        years: 25,
        guid: false,
    },
    Role {
        dir: "sudi-ca",
        common_name: "SUDI rootCA",
        signer: None,
        years: 0,
        guid: false,
    },
    Role {
        dir: "uefi-pk",
        common_name: "UEFI PK",
        signer: None,
        years: 50,
        guid: true,
    },
];

const SIGNERS: [Role; 7] = [
    Role {
        dir: "tpmpol-admin",
        common_name: "TPM EAPolicy Admin",
        signer: Some("manifest-ca"),
        years: 25,
        guid: false,
    },
    Role {
        dir: "tpmpol-luks",
        common_name: "TPM EAPolicy LUKS",
        signer: Some("manifest-ca"),
        years: 25,
        guid: false,
    },
    Role {
        dir: "uki-tpm",
        common_name: "UKI TPM",
        signer: Some("manifest-ca"),
        years: 25,
        guid: true,
    },
    Role {
        dir: "uki-limited",
        common_name: "UKI Limited",
        signer: Some("manifest-ca"),
        years: 25,
        guid: true,
    },
    Role {
        dir: "uki-production",
        common_name: "UKI Production",
        signer: Some("manifest-ca"),
        years: 25,
        guid: true,
    },
    Role {
        dir: "uefi-db",
        common_name: "UEFI DB",
        signer: Some("manifest-ca"),
        years: 25,
        guid: true,
    },
    Role {
        dir: "uefi-kek",
        common_name: "UEFI KEK",
        signer: Some("uefi-pk"),
        years: 50,
        guid: true,
    },
];

impl Role {
    fn template(&self, keyset: &str, orgs: &[String]) -> CertTemplate {
        let subject = Subject::new(self.common_name)
            .with_organizations(orgs)
            .with_unit(format!("{ORG_UNIT_PREFIX} {keyset}"));
        match self.signer {
            None if self.dir == "sudi-ca" => CertTemplate::ca(subject, sudi_not_after()),
            None => CertTemplate::ca(subject, years_from_now(self.years)),
            Some(_) => {
                let mut template = CertTemplate::code_signing(subject, years_from_now(self.years));
                if self.dir == "uefi-kek" {
                    template.ext_key_usage.clear();
                }
                template
            }
        }
    }
}

/// Generate a key and a certificate for it into `dir`. With no `ca` the
/// certificate is self-signed.
fn new_creds(
    dir: &Path,
    template: &CertTemplate,
    ca: Option<(&Certificate, &RsaPrivateKey)>,
) -> Result<()> {
    let key = generate_key()?;
    let issuer = match ca {
        Some((cert, key)) => Issuer::Ca { cert, key },
        None => Issuer::SelfSigned(&key),
    };
    let cert = issue(template, &RsaPublicKey::from(&key), issuer)?;
    write_private_key(&dir.join("privkey.pem"), &key)?;
    if let Err(e) = write_cert(&dir.join("cert.pem"), &cert) {
        std::fs::remove_file(dir.join("privkey.pem")).ok();
        return Err(e.into());
    }
    Ok(())
}

fn read_ca(dir: &Path) -> Result<(Certificate, RsaPrivateKey)> {
    Ok((
        read_cert(&dir.join("cert.pem"))?,
        read_private_key(&dir.join("privkey.pem"))?,
    ))
}

/// A selectable part of a keyset for `keyset show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeysetItem {
    Dir(String),
    Project(String),
    Sudi { project: String, serial: String },
}

impl FromStr for KeysetItem {
    type Err = KeysetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split(':').collect::<Vec<_>>()[..] {
            ["project", p] if !p.is_empty() => Ok(KeysetItem::Project(p.to_string())),
            ["sudi", p, serial] if !p.is_empty() && !serial.is_empty() => Ok(KeysetItem::Sudi {
                project: p.to_string(),
                serial: serial.to_string(),
            }),
            [dir] if KEYSET_DIRS.contains(&dir) => Ok(KeysetItem::Dir(dir.to_string())),
            _ => Err(KeysetError::Item(s.to_string())),
        }
    }
}

impl fmt::Display for KeysetItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeysetItem::Dir(d) => f.write_str(d),
            KeysetItem::Project(p) => write!(f, "project:{p}"),
            KeysetItem::Sudi { project, serial } => write!(f, "sudi:{project}:{serial}"),
        }
    }
}

/// Names of the keysets under `keys_dir`. A missing directory holds none.
pub fn list_keysets(keys_dir: &Path) -> Result<Vec<String>> {
    if !keys_dir.exists() {
        return Ok(vec![]);
    }
    Ok(paths::subdirs(keys_dir)?)
}

/// Create and populate keyset `name` under `keys_dir`. A partially written
/// keyset is removed again on failure.
pub fn init_keyset(keys_dir: &Path, name: &str, orgs: &[String]) -> Result<Keyset> {
    check_name(name)?;
    let root = keys_dir.join(name);
    if root.exists() {
        return Err(KeysetError::Exists(root));
    }
    paths::create_dir_mode(&root, DIR_MODE)?;
    let keyset = Keyset {
        name: name.to_string(),
        root,
    };
    match keyset.populate(orgs) {
        Ok(()) => {
            log::info!("created keyset {name} at {}", keyset.root.display());
            Ok(keyset)
        }
        Err(e) => {
            log::debug!("removing partial keyset {}", keyset.root.display());
            std::fs::remove_dir_all(&keyset.root).ok();
            Err(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Keyset {
    name: String,
    root: PathBuf,
}

impl Keyset {
    pub fn open(keys_dir: &Path, name: &str) -> Result<Self> {
        check_name(name)?;
        let root = keys_dir.join(name);
        if !root.is_dir() {
            return Err(KeysetError::NotFound(root));
        }
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    /// Open keyset `name` under the user's keys directory.
    pub fn open_default(name: &str) -> Result<Self> {
        Self::open(&paths::keys_dir()?, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn keydir(&self, dir: &str) -> PathBuf {
        self.root.join(dir)
    }

    pub fn bootkit(&self) -> PathBuf {
        self.root.join("bootkit")
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join("manifest").join(project)
    }

    fn existing_project(&self, project: &str) -> Result<PathBuf> {
        check_name(project)?;
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Err(KeysetError::NotFound(dir));
        }
        Ok(dir)
    }

    fn populate(&self, orgs: &[String]) -> Result<()> {
        for dir in KEYSET_DIRS {
            paths::create_dir_mode(&self.keydir(dir), DIR_MODE)?;
        }
        for role in ROOTS.iter().chain(SIGNERS.iter()) {
            let dir = self.keydir(role.dir);
            let ca = role.signer.map(|s| read_ca(&self.keydir(s))).transpose()?;
            new_creds(
                &dir,
                &role.template(&self.name, orgs),
                ca.as_ref().map(|(c, k)| (c, k)),
            )?;
            if role.guid {
                paths::write_new(
                    &dir.join("guid"),
                    Uuid::new_v4().to_string().as_bytes(),
                    GUID_MODE,
                )?;
            }
            log::debug!("generated {}", role.dir);
        }

        self.add_project(DEFAULT_PROJECT)?;

        let values = compute_pcr7(&self.root)?;
        policy::add_pcr7data(&self.root, &self.name, &values, PolicyVersion::CURRENT)?;
        Ok(())
    }

    /// Create `manifest/<project>` with a fresh product UUID and manifest
    /// signing credentials.
    pub fn add_project(&self, project: &str) -> Result<Uuid> {
        check_name(project)?;
        let dir = self.project_dir(project);
        if dir.exists() {
            return Err(KeysetError::Exists(dir));
        }
        paths::create_dir_mode(&dir.join("sudi"), DIR_MODE)?;
        match self.new_product_creds(&dir) {
            Ok(product) => {
                log::info!("added project {project} ({product}) to keyset {}", self.name);
                Ok(product)
            }
            Err(e) => {
                std::fs::remove_dir_all(&dir).ok();
                Err(e)
            }
        }
    }

    fn new_product_creds(&self, dir: &Path) -> Result<Uuid> {
        let product = Uuid::new_v4();
        let template = CertTemplate::code_signing(
            Subject::new(format!("manifest PRODUCT:{product}")),
            years_from_now(20),
        );
        let (ca_cert, ca_key) = read_ca(&self.keydir("manifest-ca"))?;
        new_creds(dir, &template, Some((&ca_cert, &ca_key)))?;
        paths::write_new(&dir.join("uuid"), product.to_string().as_bytes(), GUID_MODE)?;
        Ok(product)
    }

    pub fn list_projects(&self) -> Result<Vec<String>> {
        Ok(paths::subdirs(&self.keydir("manifest"))?)
    }

    /// The product UUID of `project`.
    pub fn product_uuid(&self, project: &str) -> Result<Uuid> {
        let path = self.existing_project(project)?.join("uuid");
        let text = paths::read_to_string(&path)?;
        Uuid::parse_str(text.trim()).map_err(|source| KeysetError::ProductUuid { path, source })
    }

    /// Issue a SUDI identity for a machine of `project`, returning its
    /// directory. The machine serial defaults to a random UUID.
    pub fn new_sudi(&self, project: &str, machine: Option<&str>) -> Result<PathBuf> {
        let product = self.product_uuid(project)?;
        let machine = match machine {
            Some(m) => {
                check_name(m)?;
                m.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let dir = self.project_dir(project).join("sudi").join(&machine);
        if dir.exists() {
            return Err(KeysetError::Exists(dir));
        }
        paths::create_dir_mode(&dir, DIR_MODE)?;

        let template = CertTemplate {
            subject: Subject::new(&machine)
                .with_serial_number(format!("PID:{product} SN:{machine}")),
            is_ca: false,
            key_usage: KeyUsages::DigitalSignature
                | KeyUsages::KeyEncipherment
                | KeyUsages::DataEncipherment,
            ext_key_usage: vec![EKU_SERVER_AUTH, EKU_CLIENT_AUTH],
            not_after: sudi_not_after(),
        };
        let issued = read_ca(&self.keydir("sudi-ca"))
            .and_then(|(cert, key)| new_creds(&dir, &template, Some((&cert, &key))));
        if let Err(e) = issued {
            std::fs::remove_dir_all(&dir).ok();
            return Err(e);
        }
        log::info!("issued SUDI {machine} for {project}");
        Ok(dir)
    }

    pub fn list_sudi(&self, project: &str) -> Result<Vec<String>> {
        Ok(paths::subdirs(
            &self.existing_project(project)?.join("sudi"),
        )?)
    }

    pub fn item_dir(&self, item: &KeysetItem) -> Result<PathBuf> {
        let dir = match item {
            KeysetItem::Dir(d) => self.keydir(d),
            KeysetItem::Project(p) => self.existing_project(p)?,
            KeysetItem::Sudi { project, serial } => {
                self.existing_project(project)?.join("sudi").join(serial)
            }
        };
        if !dir.is_dir() {
            return Err(KeysetError::NotFound(dir));
        }
        Ok(dir)
    }

    /// A printable view of the keyset or one of its items: the directory,
    /// then the certificate and any guid or uuid it carries.
    pub fn show(&self, item: Option<&KeysetItem>) -> Result<String> {
        let Some(item) = item else {
            let mut out = format!("{}\n", self.root.display());
            for dir in paths::subdirs(&self.root)? {
                out.push_str(&format!("  {dir}\n"));
            }
            return Ok(out);
        };
        let dir = self.item_dir(item)?;
        let mut out = format!("{}\n", dir.display());
        for file in ["guid", "uuid"] {
            let path = dir.join(file);
            if path.exists() {
                out.push_str(&format!("{file}: {}\n", paths::read_to_string(&path)?.trim()));
            }
        }
        let cert = dir.join("cert.pem");
        if cert.exists() {
            out.push_str(&paths::read_to_string(&cert)?);
        }
        Ok(out)
    }

    /// Predicted PCR7 values for this keyset's shim and UKI signers.
    pub fn pcr7(&self) -> Result<Pcr7Values> {
        Ok(compute_pcr7(&self.root)?)
    }

    /// Write signed policy data for PCR7 values measured elsewhere, for
    /// firmware whose measurements the predictor cannot reproduce.
    pub fn add_pcr7data_from_files(
        &self,
        tpm: &Path,
        production: &Path,
        limited: &Path,
    ) -> Result<PathBuf> {
        let values = Pcr7Values {
            production: read_pcr(production)?,
            limited: read_pcr(limited)?,
            tpm: read_pcr(tpm)?,
        };
        Ok(policy::add_pcr7data(
            &self.root,
            &self.name,
            &values,
            PolicyVersion::CURRENT,
        )?)
    }
}

fn read_pcr(path: &Path) -> Result<Pcr> {
    let bytes = paths::read(path)?;
    Pcr::try_from(bytes.as_slice()).map_err(|_| KeysetError::PcrFile {
        path: path.to_path_buf(),
        len: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{name_attribute, OID_COMMON_NAME, OID_SERIAL_NUMBER};
    use crate::crypto::sign::verify_issued_by;
    use crate::tpm::policy::{index_dir, SignDataInfo, LUKS_POLICY_FILE, PASSWD_POLICY_FILE};
    use eyre::Result;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &Path) -> Result<u32> {
        Ok(std::fs::metadata(path)?.permissions().mode() & 0o777)
    }

    #[test]
    fn parse_items() -> Result<()> {
        assert_eq!(
            "uefi-kek".parse::<KeysetItem>()?,
            KeysetItem::Dir("uefi-kek".into())
        );
        assert_eq!(
            "project:default".parse::<KeysetItem>()?,
            KeysetItem::Project("default".into())
        );
        let sudi: KeysetItem = "sudi:default:SN1".parse()?;
        assert_eq!(sudi.to_string(), "sudi:default:SN1");
        for bad in ["bootkit", "project:", "sudi:default", "sudi::x", "a:b:c:d"] {
            assert!(matches!(
                bad.parse::<KeysetItem>(),
                Err(KeysetError::Item(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn missing_keys_dir_lists_nothing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(list_keysets(&tmp.path().join("nope"))?.is_empty());
        assert!(matches!(
            Keyset::open(tmp.path(), "nope"),
            Err(KeysetError::NotFound(_))
        ));
        assert!(matches!(
            init_keyset(tmp.path(), "../up", &[]),
            Err(KeysetError::Name(_))
        ));
        Ok(())
    }

    #[test]
    fn new_keyset_layout() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let orgs = vec!["Example Org".to_string()];
        let keyset = init_keyset(tmp.path(), "snakeoil", &orgs)?;
        assert!(matches!(
            init_keyset(tmp.path(), "snakeoil", &orgs),
            Err(KeysetError::Exists(_))
        ));
        assert_eq!(list_keysets(tmp.path())?, vec!["snakeoil"]);

        for dir in KEYSET_DIRS {
            let path = keyset.keydir(dir);
            assert!(path.is_dir(), "{dir}");
            assert_eq!(mode(&path)?, 0o750);
        }
        for role in ROOTS.iter().chain(SIGNERS.iter()) {
            let dir = keyset.keydir(role.dir);
            assert_eq!(dir.join("guid").exists(), role.guid, "{}", role.dir);
            let cert = read_cert(&dir.join("cert.pem"))?;
            assert_eq!(
                name_attribute(&cert.tbs_certificate.subject, OID_COMMON_NAME).as_deref(),
                Some(role.common_name)
            );
            let issuer = read_cert(&keyset.keydir(role.signer.unwrap_or(role.dir)).join("cert.pem"))?;
            verify_issued_by(&cert, &issuer)?;
        }
        assert_eq!(mode(&keyset.keydir("uefi-pk").join("guid"))?, 0o640);

        assert_eq!(keyset.list_projects()?, vec![DEFAULT_PROJECT]);
        let default = keyset.project_dir(DEFAULT_PROJECT);
        assert!(default.join("sudi").is_dir());
        let product = keyset.product_uuid(DEFAULT_PROJECT)?;
        let cert = read_cert(&default.join("cert.pem"))?;
        assert_eq!(
            name_attribute(&cert.tbs_certificate.subject, OID_COMMON_NAME),
            Some(format!("manifest PRODUCT:{product}"))
        );

        let values = keyset.pcr7()?;
        let policy_dir = keyset.keydir("pcr7data").join("policy-1");
        let prod = index_dir(&policy_dir, &values.production);
        assert!(prod.join(LUKS_POLICY_FILE).exists());
        assert!(index_dir(&policy_dir, &values.tpm)
            .join(PASSWD_POLICY_FILE)
            .exists());
        let info = SignDataInfo::read(&prod)?;
        assert_eq!(info.key, "snakeoil");
        assert!(policy_dir.join("pubkeys/luks-snakeoil.pem").exists());
        assert!(policy_dir.join("pubkeys/tpmpass-snakeoil.pem").exists());
        Ok(())
    }

    #[test]
    fn projects_and_sudi() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let keyset = init_keyset(tmp.path(), "ks", &[])?;

        let product = keyset.add_project("widget")?;
        assert!(matches!(
            keyset.add_project("widget"),
            Err(KeysetError::Exists(_))
        ));
        assert_eq!(keyset.list_projects()?, vec!["default", "widget"]);

        let dir = keyset.new_sudi("widget", Some("SN0001"))?;
        assert_eq!(mode(&dir)?, 0o750);
        let cert = read_cert(&dir.join("cert.pem"))?;
        let subject = &cert.tbs_certificate.subject;
        assert_eq!(
            name_attribute(subject, OID_SERIAL_NUMBER),
            Some(format!("PID:{product} SN:SN0001"))
        );
        assert_eq!(
            name_attribute(subject, OID_COMMON_NAME).as_deref(),
            Some("SN0001")
        );
        verify_issued_by(&cert, &read_cert(&keyset.keydir("sudi-ca").join("cert.pem"))?)?;
        assert!(matches!(
            keyset.new_sudi("widget", Some("SN0001")),
            Err(KeysetError::Exists(_))
        ));

        let generated = keyset.new_sudi("widget", None)?;
        let serial = generated
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(Uuid::parse_str(&serial).is_ok());
        let mut expected = vec!["SN0001".to_string(), serial.clone()];
        expected.sort();
        assert_eq!(keyset.list_sudi("widget")?, expected);

        assert!(matches!(
            keyset.new_sudi("nope", None),
            Err(KeysetError::NotFound(_))
        ));

        let shown = keyset.show(Some(&format!("sudi:widget:{serial}").parse::<KeysetItem>()?))?;
        assert!(shown.contains("BEGIN CERTIFICATE"));
        let shown = keyset.show(Some(&"project:widget".parse::<KeysetItem>()?))?;
        assert!(shown.contains(&format!("uuid: {product}")));
        let shown = keyset.show(Some(&"uki-tpm".parse::<KeysetItem>()?))?;
        assert!(shown.contains("guid: "));
        Ok(())
    }

    #[test]
    fn pcr7data_from_files() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let keyset = init_keyset(tmp.path(), "ks", &[])?;
        let files = tmp.path().join("pcrs");
        std::fs::create_dir(&files)?;
        for (name, byte) in [("tpm", 1u8), ("prod", 2), ("limited", 3)] {
            std::fs::write(files.join(name), [byte; 32])?;
        }
        let policy_dir = keyset.add_pcr7data_from_files(
            &files.join("tpm"),
            &files.join("prod"),
            &files.join("limited"),
        )?;
        assert!(index_dir(&policy_dir, &[2; 32])
            .join(LUKS_POLICY_FILE)
            .exists());

        std::fs::write(files.join("short"), [0u8; 20])?;
        assert!(matches!(
            keyset.add_pcr7data_from_files(
                &files.join("short"),
                &files.join("prod"),
                &files.join("limited"),
            ),
            Err(KeysetError::PcrFile { len: 20, .. })
        ));
        Ok(())
    }
}
