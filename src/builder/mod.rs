//! Bootable media for a keyset: the customised bootkit, and ISO or disk
//! images that boot a signed install manifest.
use crate::crypto::CryptoError;
use crate::efi::EfiError;
use crate::keyset::{Keyset, KeysetError};
use crate::manifest::{self, ManifestError, CERT_FILE, INSTALL_FILE};
use crate::oci::{DistRepo, DistUrl, OciError};
use crate::ovmf::OvmfError;
use crate::paths::{self, PathError};
use crate::pe::PeError;
use crate::run::RunError;
use crate::shim::ShimError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod bootkit;
pub mod cmdline;
pub mod esp;
pub mod iso;
pub mod mirror;
pub mod publish;
pub mod uki;

pub use cmdline::{boot_cmdline, BootMode, ISO_LABEL};

/// Registry repository holding target images, tagged by manifest hash.
pub const MOS_REPO: &str = "mos";

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("unsupported boot url {0:?}, expected docker:// or oci:")]
    BootUrl(String),
    #[error("unknown boot mode {0:?}, expected efi-auto, efi-shim or efi-kernel")]
    BootMode(String),
    #[error("{tool} failed: {source}")]
    Tool {
        tool: &'static str,
        source: RunError,
    },
    #[error("bootkit is missing {0}")]
    Bootkit(PathBuf),
    #[error("local registry: {0}")]
    Mirror(String),
    #[error("{target}: image manifest hash is {found}, expected {expected}")]
    Pinned {
        target: String,
        expected: String,
        found: String,
    },
    #[error("target {0} has no manifest hash")]
    Unpublished(String),
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Shim(#[from] ShimError),
    #[error(transparent)]
    Efi(#[from] EfiError),
    #[error(transparent)]
    Ovmf(#[from] OvmfError),
    #[error(transparent)]
    Oci(#[from] OciError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Keyset(#[from] KeysetError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BuilderError> = core::result::Result<T, E>;

impl BuilderError {
    pub(crate) fn tool(tool: &'static str) -> impl FnOnce(RunError) -> BuilderError {
        move |source| BuilderError::Tool { tool, source }
    }
}

/// A bootable image of the install manifest at `boot_url`.
#[derive(Debug)]
pub struct OciBoot {
    pub keyset: Keyset,
    pub project: String,
    pub boot_url: String,
    pub boot_mode: BootMode,
    pub out_file: PathBuf,
    /// ISO 9660 when set, else a GPT disk image.
    pub cdrom: bool,
    /// Appended to the derived kernel command line.
    pub cmdline: String,
    /// Extra files, source path to path on the media.
    pub files: BTreeMap<PathBuf, String>,
    /// Address of the local registry the manifest and its targets are copied to.
    pub mirror: Option<String>,
    /// Storage directory of that registry, copied onto the media.
    pub repo_dir: Option<PathBuf>,
    /// Leave the manifest and images off the media and boot from the registry.
    pub boot_from_remote: bool,
    /// Disk image size, 1 GiB if unset.
    pub disk_size: Option<u64>,
}

impl OciBoot {
    pub fn new(keyset: Keyset, project: &str, boot_url: &str, out_file: &Path) -> Self {
        Self {
            keyset,
            project: project.to_string(),
            boot_url: boot_url.to_string(),
            boot_mode: BootMode::default(),
            out_file: out_file.to_path_buf(),
            cdrom: true,
            cmdline: String::new(),
            files: BTreeMap::new(),
            mirror: None,
            repo_dir: None,
            boot_from_remote: false,
            disk_size: None,
        }
    }

    pub fn build(&self) -> Result<()> {
        let bootkit = self.keyset.bootkit();
        if !bootkit.join(esp::KERNEL_EFI).exists() {
            return Err(BuilderError::Bootkit(bootkit.join(esp::KERNEL_EFI)));
        }
        let cmdline = boot_cmdline(&self.boot_url, &self.cmdline, self.boot_from_remote)?;
        log::info!(
            "building {} for {}:{} from {}",
            self.out_file.display(),
            self.keyset.name(),
            self.project,
            self.boot_url
        );
        if let Some(mirror) = &self.mirror {
            self.mirror_install(&DistRepo::connect(mirror)?)?;
        }

        let staging = tempfile::tempdir()?;
        let root = staging.path();
        let efi_tree = tempfile::tempdir()?;
        let tree = if self.cdrom { efi_tree.path() } else { root };
        let mode = esp::populate_efi(&bootkit, self.boot_mode, &cmdline, tree)?;
        log::debug!("boot mode {mode}, cmdline {cmdline:?}");
        if self.cdrom {
            let image = root.join(iso::ESP_IMAGE);
            paths::create_dir_mode(image.parent().unwrap_or(root), 0o755)?;
            esp::make_esp(&image, tree)?;
        }

        paths::copy_file(&iso::modules_squashfs(&bootkit)?, &root.join(iso::MODULES))?;
        if !self.boot_from_remote {
            if let Some(repo) = self.local_repo() {
                paths::copy_tree(&repo, &root.join(iso::OCI_DIR))?;
            }
        }
        for (src, dest) in &self.files {
            paths::copy_file(src, &root.join(dest.trim_start_matches('/')))?;
        }

        if self.cdrom {
            iso::make_iso(&self.out_file, root)
        } else {
            iso::make_disk(&self.out_file, root, self.disk_size)
        }
    }

    /// The image store to put on the media: the registry's storage, or the
    /// layout an `oci:` url points into.
    fn local_repo(&self) -> Option<PathBuf> {
        match self.boot_url.strip_prefix("oci:") {
            Some(rest) => rest.split_once(':').map(|(dir, _)| PathBuf::from(dir)),
            None => self.repo_dir.clone(),
        }
    }

    /// Fetch and verify the install manifest at `boot_url`, then copy it
    /// and every target it names into `mirror`, keeping digests.
    fn mirror_install(&self, mirror: &DistRepo) -> Result<()> {
        if !self.boot_url.starts_with("docker://") {
            return Ok(());
        }
        let url = DistUrl::parse(&self.boot_url)?;
        let remote = DistRepo::connect(&url.addr)?;
        let artifacts = remote.fetch_install(&url.name, &url.tag)?;

        let scratch = tempfile::tempdir()?;
        let manifest_path = scratch.path().join(INSTALL_FILE);
        let sig = manifest::signature_path(&manifest_path);
        let cert = scratch.path().join(CERT_FILE);
        paths::write_mode(&manifest_path, &artifacts.manifest, 0o644)?;
        paths::write_mode(&sig, &artifacts.signature, 0o644)?;
        paths::write_mode(&cert, &artifacts.cert, 0o644)?;
        let ca = self.keyset.keydir("manifest-ca").join("cert.pem");
        let install = manifest::verify_signed(&artifacts.manifest, &sig, &cert, &[ca])?;
        log::info!("verified {} ({} targets)", self.boot_url, install.targets.len());

        if remote.addr() == mirror.addr() {
            return Ok(());
        }
        mirror.publish_install(&url.name, &url.tag, &manifest_path, &sig, &cert)?;
        for t in &install.targets {
            if t.manifest_hash.is_empty() {
                return Err(BuilderError::Unpublished(t.service_name.clone()));
            }
            remote.copy_image_to(MOS_REPO, &t.manifest_hash, mirror, MOS_REPO, &t.manifest_hash)?;
        }
        Ok(())
    }
}
