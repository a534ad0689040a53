//! Signed install manifests and the history of what a machine has installed.
//!
//! An install manifest (`install.yaml`) is signed with a product's manifest key
//! and carries the leaf certificate beside it (`manifestCert.pem`). Installing
//! or updating copies all three into the manifest store under the manifest's
//! sha256 and records the merged set of targets in `manifest.json`.
pub mod lock;
pub mod store;
pub mod types;
pub mod uidmap;

use crate::crypto::sign::{candidate_cas, sign_file, verify_manifest_with};
use crate::crypto::CryptoError;
use crate::oci::{DistRepo, DistUrl, OciError, OciLayout};
use crate::paths::{self, IoContext, PathError};
use crate::run::RunError;
use crate::storage::{Storage, StorageBackend, StorageError};
use lock::ConfigLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use store::{ManifestStore, INITIAL_COMMIT, STORE_DIR, UPGRADE_COMMIT};
use tempfile::TempDir;
use thiserror::Error;
use types::{IdmapSet, ImageSource, InstallFile, SysManifest, SysTarget, UpdateType};
use uidmap::{add_uidmap, range_defaults, RangeDefaults};

pub const INSTALL_FILE: &str = "install.yaml";
pub const CERT_FILE: &str = "manifestCert.pem";
pub const SYS_MANIFEST: &str = "manifest.json";
pub const DEFAULT_CA: &str = "/factory/secure/manifestCA.pem";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("invalid install manifest: {0}")]
    Invalid(String),
    #[error("unsupported install manifest version {0}")]
    Version(u32),
    #[error("unrecognised image source {0:?}")]
    Source(String),
    #[error("{path} is locked: {owner}")]
    Locked { path: PathBuf, owner: String },
    #[error("manifest store {0} already exists")]
    StoreExists(PathBuf),
    #[error("no manifest store at {0}")]
    NoStore(PathBuf),
    #[error("no installed target named {0:?}")]
    NoTarget(String),
    #[error("an initial install needs a complete manifest")]
    PartialInstall,
    #[error("config is opened read-only")]
    ReadOnly,
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Oci(#[from] OciError),
    #[error("git: {0}")]
    Git(#[from] RunError),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = ManifestError> = core::result::Result<T, E>;

/// `<path>.signed`
pub fn signature_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".signed");
    s.into()
}

/// Sign `path` with the key at `key`, returning the signature's path.
pub fn sign_manifest(path: &Path, key: &Path) -> Result<PathBuf> {
    let signed = signature_path(path);
    sign_file(path, &signed, key)?;
    log::info!("wrote {}", signed.display());
    Ok(signed)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check the signature and chain of an install manifest and parse it.
pub fn verify_signed(
    contents: &[u8],
    sig: &Path,
    cert: &Path,
    candidates: &[PathBuf],
) -> Result<InstallFile> {
    verify_manifest_with(contents, sig, cert, candidates)?;
    let install = InstallFile::parse(contents)?;
    install.validate()?;
    Ok(install)
}

/// Full verification: signature and chain, then every target's image in
/// `storage` against its recorded manifest hash.
pub fn verify_install(
    contents: &[u8],
    sig: &Path,
    cert: &Path,
    candidates: &[PathBuf],
    storage: &dyn StorageBackend,
) -> Result<InstallFile> {
    let install = verify_signed(contents, sig, cert, candidates)?;
    for t in &install.targets {
        storage.verify_target(t)?;
    }
    Ok(install)
}

/// Combine the installed targets with those of a new manifest.
pub fn merge(old: &[SysTarget], new: Vec<SysTarget>, update_type: UpdateType) -> Vec<SysTarget> {
    match update_type {
        UpdateType::Complete => new,
        UpdateType::Partial => {
            let mut merged: Vec<_> = old
                .iter()
                .filter(|o| !new.iter().any(|n| n.name == o.name))
                .cloned()
                .collect();
            merged.extend(new);
            merged
        }
    }
}

/// The system manifest for `targets`, keeping uid ranges from `old_uidmaps`.
pub fn system_manifest(
    targets: Vec<SysTarget>,
    old_uidmaps: &[IdmapSet],
    update_type: UpdateType,
    defaults: RangeDefaults,
) -> SysManifest {
    let mut uidmaps = vec![];
    for t in &targets {
        add_uidmap(old_uidmaps, &mut uidmaps, &t.nsgroup, defaults);
    }
    SysManifest {
        uidmaps,
        sys_targets: targets,
        update_type,
    }
}

/// The three files of a signed install manifest, either local or fetched
/// from a registry into a temporary directory.
#[derive(Debug)]
pub struct InstallSource {
    pub manifest: PathBuf,
    pub signature: PathBuf,
    pub cert: PathBuf,
    _fetched: Option<TempDir>,
}

impl InstallSource {
    /// `install.yaml` with `install.yaml.signed` and `manifestCert.pem` beside it.
    pub fn local(manifest: &Path) -> Self {
        let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        Self {
            manifest: manifest.to_path_buf(),
            signature: signature_path(manifest),
            cert: dir.join(CERT_FILE),
            _fetched: None,
        }
    }

    /// Fetch `docker://<host>/<name>:<tag>` and its referrers.
    pub fn fetch(url: &str) -> Result<Self> {
        let url = DistUrl::parse(url)?;
        let artifacts = DistRepo::connect(&url.addr)?.fetch_install(&url.name, &url.tag)?;
        let tmp = tempfile::tempdir().at(Path::new("/tmp"))?;
        let manifest = tmp.path().join(INSTALL_FILE);
        paths::write_mode(&manifest, &artifacts.manifest, 0o644)?;
        paths::write_mode(&signature_path(&manifest), &artifacts.signature, 0o644)?;
        paths::write_mode(&tmp.path().join(CERT_FILE), &artifacts.cert, 0o644)?;
        log::info!("fetched {}:{} from {}", url.name, url.tag, url.addr);
        Ok(Self {
            _fetched: Some(tmp),
            ..Self::local(&manifest)
        })
    }

    pub fn open(spec: &str) -> Result<Self> {
        if spec.starts_with("docker://") {
            Self::fetch(spec)
        } else {
            Ok(Self::local(Path::new(spec)))
        }
    }

    fn dir(&self) -> &Path {
        self.manifest.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Copy the three files into `dest` under the manifest hash, returning
    /// the name recorded as each target's `source_file`.
    fn stage(&self, dest: &Path, sha: &str) -> Result<String> {
        let source_file = format!("{sha}.yaml");
        paths::copy_file(&self.manifest, &dest.join(&source_file))?;
        paths::copy_file(&self.signature, &dest.join(format!("{source_file}.signed")))?;
        paths::copy_file(&self.cert, &dest.join(format!("{sha}.pem")))?;
        Ok(source_file)
    }
}

#[derive(Debug, Clone)]
pub struct MosOptions {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub store_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub ca_path: PathBuf,
    pub read_only: bool,
}

impl MosOptions {
    pub fn for_root(root: &Path) -> Self {
        let ca_path = if root == Path::new("/") {
            PathBuf::from(DEFAULT_CA)
        } else {
            root.join(DEFAULT_CA.trim_start_matches('/'))
        };
        Self {
            root: root.to_path_buf(),
            config_dir: root.join("config"),
            store_dir: root.join("atomfs-store"),
            scratch_dir: root.join("scratch-writes"),
            ca_path,
            read_only: false,
        }
    }
}

impl Default for MosOptions {
    fn default() -> Self {
        Self::for_root(Path::new("/"))
    }
}

/// A machine's installed-system state, held under its config lock.
pub struct Mos {
    opts: MosOptions,
    storage: Storage,
    defaults: RangeDefaults,
    _lock: ConfigLock,
}

impl Mos {
    pub fn open(opts: MosOptions) -> Result<Self> {
        std::fs::create_dir_all(&opts.config_dir).at(&opts.config_dir)?;
        let lock = ConfigLock::acquire(&opts.config_dir, opts.read_only)?;
        if !opts.read_only {
            for dir in [&opts.store_dir, &opts.scratch_dir] {
                std::fs::create_dir_all(dir).at(dir)?;
            }
        }
        let storage = Storage::atomfs(&opts.store_dir);
        Ok(Self {
            opts,
            storage,
            defaults: range_defaults(),
            _lock: lock,
        })
    }

    pub fn with_range_defaults(mut self, defaults: RangeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    fn store_path(&self) -> PathBuf {
        self.opts.config_dir.join(STORE_DIR)
    }

    fn candidates(&self) -> Vec<PathBuf> {
        candidate_cas(Some(&self.opts.ca_path))
    }

    fn writable(&self) -> Result<()> {
        if self.opts.read_only {
            return Err(ManifestError::ReadOnly);
        }
        Ok(())
    }

    /// Bring every target's image into the layer cache. Relative `oci:`
    /// directories are taken relative to `src_dir`.
    pub fn import_targets(&self, install: &InstallFile, src_dir: &Path) -> Result<()> {
        for t in &install.targets {
            if self.storage.target_exists(t) {
                log::debug!("{} {} already in the cache", t.service_name, t.version);
                continue;
            }
            match ImageSource::parse(&t.source)? {
                ImageSource::Oci { dir, .. } => {
                    self.storage.import_target(&src_dir.join(dir), t)?;
                }
                ImageSource::Docker { addr, name, tag } => {
                    let tmp = tempfile::tempdir().at(Path::new("/tmp"))?;
                    let layout = OciLayout::create(tmp.path())?;
                    let tag = tag.unwrap_or_else(|| t.version.clone());
                    DistRepo::connect(&addr)?.pull_image(
                        &name,
                        &tag,
                        &layout,
                        &format!("{}:{}", t.image_path(), t.version),
                    )?;
                    self.storage.import_target(tmp.path(), t)?;
                }
            }
        }
        Ok(())
    }

    /// Verify the signature, import the targets and check their hashes.
    fn verify_and_import(&self, src: &InstallSource, contents: &[u8]) -> Result<InstallFile> {
        let install = verify_signed(contents, &src.signature, &src.cert, &self.candidates())?;
        self.import_targets(&install, src.dir())?;
        for t in &install.targets {
            self.storage.verify_target(t)?;
        }
        Ok(install)
    }

    /// First install on a machine: import the targets and start the history.
    pub fn install(&self, src: &InstallSource) -> Result<SysManifest> {
        self.writable()?;
        let contents = paths::read(&src.manifest)?;
        let install = InstallFile::parse(&contents)?;
        if install.update_type == UpdateType::Partial {
            return Err(ManifestError::PartialInstall);
        }
        self.verify_and_import(src, &contents)?;
        self.init_manifest(src)
    }

    /// Start the manifest history from an install manifest whose targets are
    /// already in the cache.
    pub fn init_manifest(&self, src: &InstallSource) -> Result<SysManifest> {
        self.writable()?;
        let contents = paths::read(&src.manifest)?;
        let sha = sha256_hex(&contents);
        let install = verify_install(
            &contents,
            &src.signature,
            &src.cert,
            &self.candidates(),
            &self.storage,
        )?;
        let store = ManifestStore::init(&self.store_path())?;
        let result = (|| -> Result<SysManifest> {
            let source_file = src.stage(store.path(), &sha)?;
            let targets = install
                .targets
                .iter()
                .map(|t| SysTarget::new(t, &source_file))
                .collect();
            let sys = system_manifest(targets, &[], install.update_type, self.defaults);
            paths::write_mode(&store.path().join(SYS_MANIFEST), &sys.to_json()?, 0o644)?;
            store.commit(INITIAL_COMMIT)?;
            Ok(sys)
        })();
        if result.is_err() {
            let _ = std::fs::remove_dir_all(store.path());
        }
        result
    }

    /// Apply a new install manifest on top of the installed one.
    pub fn update(&self, src: &InstallSource) -> Result<SysManifest> {
        self.writable()?;
        let store = ManifestStore::open(&self.store_path())?;
        let old = SysManifest::from_json(&store.read(SYS_MANIFEST)?)?;
        let contents = paths::read(&src.manifest)?;
        let sha = sha256_hex(&contents);
        let install = self.verify_and_import(src, &contents)?;

        let staging = tempfile::tempdir().at(Path::new("/tmp"))?;
        let source_file = src.stage(staging.path(), &sha)?;
        let new = install
            .targets
            .iter()
            .map(|t| SysTarget::new(t, &source_file))
            .collect();
        let merged = merge(&old.sys_targets, new, install.update_type);

        let kept: BTreeSet<_> = merged
            .iter()
            .map(|t| t.source_file.as_str())
            .filter(|f| *f != source_file)
            .collect();
        for file in kept {
            let stem = file.trim_end_matches(".yaml");
            for name in [file.to_string(), format!("{file}.signed"), format!("{stem}.pem")] {
                paths::copy_file(&store.path().join(&name), &staging.path().join(&name))?;
            }
        }

        let sys = system_manifest(merged, &old.uidmaps, install.update_type, self.defaults);
        paths::write_mode(&staging.path().join(SYS_MANIFEST), &sys.to_json()?, 0o644)?;
        store.replace_and_commit(staging.path(), UPGRADE_COMMIT)?;
        log::info!(
            "updated to {} ({} targets)",
            source_file,
            sys.sys_targets.len()
        );
        Ok(sys)
    }

    pub fn current_manifest(&self) -> Result<SysManifest> {
        let store = ManifestStore::open(&self.store_path())?;
        SysManifest::from_json(&store.read(SYS_MANIFEST)?)
    }

    pub fn current(&self, name: &str) -> Result<SysTarget> {
        self.current_manifest()?
            .target(name)
            .cloned()
            .ok_or_else(|| ManifestError::NoTarget(name.to_string()))
    }

    pub fn list(&self) -> Result<Vec<SysTarget>> {
        Ok(self.current_manifest()?.sys_targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{issue, years_from_now, CertTemplate, Issuer, Subject};
    use crate::crypto::pem::{generate_key, write_cert, write_private_key};
    use crate::oci::{self, Descriptor, ImageManifest, EMPTY_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST};
    use eyre::Result;
    use types::ServiceType;
    use uidmap::FULL_RANGE;

    fn sys(name: &str, nsgroup: &str, source_file: &str) -> SysTarget {
        SysTarget {
            name: name.into(),
            source: format!("docker://zothub/machine/{name}:1"),
            version: "1".into(),
            service_type: ServiceType::Container,
            nsgroup: nsgroup.into(),
            network: Default::default(),
            mounts: vec![],
            manifest_hash: "00".into(),
            source_file: source_file.into(),
        }
    }

    fn names(targets: &[SysTarget]) -> Vec<(&str, &str)> {
        targets
            .iter()
            .map(|t| (t.name.as_str(), t.source_file.as_str()))
            .collect()
    }

    #[test]
    fn merge_partial_and_complete() {
        let old = vec![sys("a", "", "1.yaml"), sys("b", "", "1.yaml")];
        let new = vec![sys("b", "", "2.yaml"), sys("c", "", "2.yaml")];

        let merged = merge(&old, new.clone(), UpdateType::Partial);
        assert_eq!(
            names(&merged),
            vec![("a", "1.yaml"), ("b", "2.yaml"), ("c", "2.yaml")]
        );
        let merged = merge(&old, new, UpdateType::Complete);
        assert_eq!(names(&merged), vec![("b", "2.yaml"), ("c", "2.yaml")]);
    }

    #[test]
    fn system_manifest_keeps_ranges() {
        let first = system_manifest(
            vec![sys("a", "ga", "1.yaml"), sys("b", "none", "1.yaml"), sys("c", "gc", "1.yaml")],
            &[],
            UpdateType::Complete,
            FULL_RANGE,
        );
        let ids: Vec<_> = first.uidmaps.iter().map(|u| (u.name.as_str(), u.id)).collect();
        assert_eq!(ids, vec![("ga", 100_000), ("gc", 165_536)]);

        let second = system_manifest(
            vec![sys("c", "gc", "2.yaml"), sys("d", "gd", "2.yaml")],
            &first.uidmaps,
            UpdateType::Complete,
            FULL_RANGE,
        );
        let ids: Vec<_> = second.uidmaps.iter().map(|u| (u.name.as_str(), u.id)).collect();
        assert_eq!(ids, vec![("gc", 165_536), ("gd", 231_072)]);
    }

    #[test]
    fn install_source_paths() {
        let src = InstallSource::local(Path::new("/media/inst/install.yaml"));
        assert_eq!(src.signature, PathBuf::from("/media/inst/install.yaml.signed"));
        assert_eq!(src.cert, PathBuf::from("/media/inst/manifestCert.pem"));
        assert_eq!(
            MosOptions::for_root(Path::new("/tmp/r")).ca_path,
            PathBuf::from("/tmp/r/factory/secure/manifestCA.pem")
        );
        assert_eq!(MosOptions::default().ca_path, PathBuf::from(DEFAULT_CA));
    }

    struct Fixture {
        tmp: TempDir,
        key: PathBuf,
        cert: PathBuf,
        oci: OciLayout,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let tmp = tempfile::tempdir()?;
            let ca_key = generate_key()?;
            let ca = issue(
                &CertTemplate::ca(Subject::new("Manifest rootCA"), years_from_now(25)),
                &ca_key.to_public_key(),
                Issuer::SelfSigned(&ca_key),
            )?;
            let leaf_key = generate_key()?;
            let leaf = issue(
                &CertTemplate::code_signing(Subject::new("manifest PRODUCT:p"), years_from_now(20)),
                &leaf_key.to_public_key(),
                Issuer::Ca {
                    cert: &ca,
                    key: &ca_key,
                },
            )?;
            let opts = MosOptions::for_root(&tmp.path().join("root"));
            std::fs::create_dir_all(opts.ca_path.parent().ok_or_else(|| eyre::eyre!("no parent"))?)?;
            write_cert(&opts.ca_path, &ca)?;
            let key = tmp.path().join("privkey.pem");
            let cert = tmp.path().join("cert.pem");
            write_private_key(&key, &leaf_key)?;
            write_cert(&cert, &leaf)?;
            let oci = OciLayout::create(&tmp.path().join("oci"))?;
            Ok(Self { tmp, key, cert, oci })
        }

        fn opts(&self) -> MosOptions {
            MosOptions::for_root(&self.tmp.path().join("root"))
        }

        /// Add `machine/<name>:<version>` to the source layout.
        fn image(&self, name: &str, version: &str) -> Result<String> {
            let content = format!("{name} {version}");
            self.oci.write_blob(EMPTY_CONFIG)?;
            self.oci.write_blob(content.as_bytes())?;
            let manifest = ImageManifest::artifact(Descriptor::of(
                "application/vnd.oci.image.layer.squashfs",
                content.as_bytes(),
            ));
            let body = serde_json::to_vec(&manifest)?;
            self.oci.write_blob(&body)?;
            let desc = Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &body);
            self.oci.tag(&desc, &format!("machine/{name}:{version}"))?;
            Ok(oci::drop_hash_prefix(&desc.digest).to_string())
        }

        /// Write and sign an install manifest in its own directory.
        fn manifest(&self, dir: &str, update_type: &str, targets: &[(&str, &str, &str)]) -> Result<InstallSource> {
            let mut yaml = format!("version: 1\nproduct: p\nupdate_type: {update_type}\ntargets:\n");
            for (name, version, nsgroup) in targets {
                let hash = self.image(name, version)?;
                yaml.push_str(&format!(
                    "  - service_name: {name}\n    source: oci:{}:machine/{name}:{version}\n    version: \"{version}\"\n    service_type: container\n    nsgroup: \"{nsgroup}\"\n    manifest_hash: {hash}\n",
                    self.oci.path().display()
                ));
            }
            let dir = self.tmp.path().join(dir);
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(INSTALL_FILE);
            std::fs::write(&path, yaml)?;
            sign_manifest(&path, &self.key)?;
            std::fs::copy(&self.cert, dir.join(CERT_FILE))?;
            Ok(InstallSource::local(&path))
        }
    }

    #[test]
    fn install_then_update() -> Result<()> {
        if !store::have_git() {
            return Ok(());
        }
        let f = Fixture::new()?;
        let partial = f.manifest("partial", "partial", &[("a", "1", "ga")])?;
        let mos = Mos::open(f.opts())?.with_range_defaults(FULL_RANGE);
        assert!(matches!(mos.install(&partial), Err(ManifestError::PartialInstall)));

        let first = f.manifest("first", "complete", &[("a", "1", "ga"), ("b", "1", "none")])?;
        let sys = mos.install(&first)?;
        assert_eq!(sys.sys_targets.len(), 2);
        assert_eq!(mos.current("a")?.version, "1");
        assert!(matches!(mos.current("zz"), Err(ManifestError::NoTarget(_))));
        assert!(matches!(mos.install(&first), Err(ManifestError::StoreExists(_))));

        let second = f.manifest("second", "partial", &[("b", "2", "gb")])?;
        let sys = mos.update(&second)?;
        let versions: Vec<_> = sys.sys_targets.iter().map(|t| (t.name.as_str(), t.version.as_str())).collect();
        assert_eq!(versions, vec![("a", "1"), ("b", "2")]);
        let ids: Vec<_> = sys.uidmaps.iter().map(|u| (u.name.as_str(), u.id)).collect();
        assert_eq!(ids, vec![("ga", 100_000), ("gb", 165_536)]);

        let store = ManifestStore::open(&f.opts().config_dir.join(STORE_DIR))?;
        assert_eq!(store.history()?, vec![UPGRADE_COMMIT, INITIAL_COMMIT]);
        let a = mos.current("a")?;
        assert!(store.exists(&a.source_file));
        assert!(store.exists(&format!("{}.signed", a.source_file)));

        let third = f.manifest("third", "complete", &[("c", "1", "")])?;
        mos.update(&third)?;
        assert_eq!(mos.list()?.len(), 1);
        assert!(!store.exists(&a.source_file));
        Ok(())
    }

    #[test]
    fn update_rejects_tampered_manifest() -> Result<()> {
        if !store::have_git() {
            return Ok(());
        }
        let f = Fixture::new()?;
        let mos = Mos::open(f.opts())?;
        mos.install(&f.manifest("first", "complete", &[("a", "1", "")])?)?;

        let bad = f.manifest("bad", "complete", &[("b", "1", "")])?;
        std::fs::write(&bad.manifest, "version: 1\nproduct: p\ntargets: []\n")?;
        assert!(matches!(
            mos.update(&bad),
            Err(ManifestError::Crypto(CryptoError::Signature))
        ));
        assert_eq!(mos.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn config_lock_is_exclusive() -> Result<()> {
        let f = Fixture::new()?;
        let _mos = Mos::open(f.opts())?;
        assert!(matches!(
            Mos::open(f.opts()),
            Err(ManifestError::Locked { .. })
        ));
        Ok(())
    }
}
