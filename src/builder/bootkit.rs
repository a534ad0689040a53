//! A keyset's own bootkit: shim trusting the keyset's UKI signers, the UKI
//! carrying its manifest CA and PCR7 data, and OVMF variables enrolling its
//! Secure Boot keys. Also the provisioning and install ISOs built from it.
use super::esp::{KERNEL_EFI, SHIM_EFI};
use super::mirror::ZotServer;
use super::publish::publish_manifest;
use super::uki::build_uki;
use super::{BuilderError, OciBoot, Result};
use crate::crypto::authenticode::sign_efi_file;
use crate::efi::{load_keydir_owned, new_db_from_certs, SignatureData, SignatureDatabase};
use crate::keyset::Keyset;
use crate::ovmf::{populate_secure_boot, SecureBootKeys};
use crate::paths;
use crate::shim::set_vendor_db;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Version of the published bootkit rootfs layers.
pub const LAYER_VERSION: &str = "0.0.5";
pub const LAYER_REGISTRY: &str = "zothub.io";
pub const OVMF_VARS: &str = "ovmf-vars.fd";
pub const OVMF_CODE: &str = "ovmf-code.fd";

const UKI_SIGNERS: [&str; 3] = ["uki-limited", "uki-production", "uki-tpm"];
const LIVECD_NAME: &str = "machine/livecd";
const LIVECD_TAG: &str = "1.0.0";

/// The unpacked upstream bootkit a keyset's is derived from.
#[derive(Debug, Clone)]
pub struct PristineBootkit {
    dir: PathBuf,
}

impl PristineBootkit {
    pub fn open(dir: &Path) -> Result<Self> {
        let kit = Self {
            dir: dir.to_path_buf(),
        };
        for file in [
            kit.shim(),
            kit.kernel(),
            kit.modules(),
            kit.ovmf_code(),
            kit.ovmf_vars(),
        ] {
            if !file.exists() {
                return Err(BuilderError::Bootkit(file));
            }
        }
        Ok(kit)
    }

    pub fn shim(&self) -> PathBuf {
        self.dir.join("shim").join(SHIM_EFI)
    }

    pub fn kernel(&self) -> PathBuf {
        self.dir.join("kernel").join(KERNEL_EFI)
    }

    pub fn modules(&self) -> PathBuf {
        self.dir.join("kernel/modules.squashfs")
    }

    pub fn ovmf_code(&self) -> PathBuf {
        self.dir.join("ovmf").join(OVMF_CODE)
    }

    pub fn ovmf_vars(&self) -> PathBuf {
        self.dir.join("ovmf").join(OVMF_VARS)
    }
}

/// The three UKI signing certificates, each owned by its key's GUID.
pub fn uki_certs(keyset: &Keyset) -> Result<Vec<SignatureData>> {
    UKI_SIGNERS
        .iter()
        .map(|dir| Ok(load_keydir_owned(&keyset.keydir(dir))?))
        .collect()
}

/// Write a copy of `shim_in` whose vendor db trusts only the keyset's UKI
/// signers, signed with `uefi-db`.
pub fn update_shim(keyset: &Keyset, shim_in: &Path, shim_out: &Path) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let unsigned = scratch.path().join(SHIM_EFI);
    paths::copy_file(shim_in, &unsigned)?;
    set_vendor_db(
        &unsigned,
        &new_db_from_certs(uki_certs(keyset)?),
        &SignatureDatabase(vec![]),
    )?;
    let db = keyset.keydir("uefi-db");
    sign_efi_file(&unsigned, shim_out, &db.join("privkey.pem"), &db.join("cert.pem"))?;
    log::info!("wrote shim {}", shim_out.display());
    Ok(())
}

/// PK, KEK and db from the keyset, with the UKI signers in MOK.
pub fn secure_boot_keys(keyset: &Keyset) -> Result<SecureBootKeys> {
    Ok(SecureBootKeys {
        pk: load_keydir_owned(&keyset.keydir("uefi-pk"))?,
        kek: vec![load_keydir_owned(&keyset.keydir("uefi-kek"))?],
        db: vec![load_keydir_owned(&keyset.keydir("uefi-db"))?],
        mok: uki_certs(keyset)?,
    })
}

/// Seed `vars_in` with the keyset's Secure Boot keys into
/// `<keyset>/bootkit/ovmf-vars.fd`.
pub fn build_ovmf_vars(keyset: &Keyset, vars_in: &Path) -> Result<PathBuf> {
    let out = keyset.bootkit().join(OVMF_VARS);
    populate_secure_boot(vars_in, &out, &secure_boot_keys(keyset)?)?;
    Ok(out)
}

/// Derive `<keyset>/bootkit` from `pristine`, optionally replacing the
/// initrd's `mosctl`.
pub fn customize_bootkit(keyset: &Keyset, pristine: &PristineBootkit, mosctl: Option<&Path>) -> Result<()> {
    let dest = keyset.bootkit();
    paths::create_dir_mode(&dest, 0o755)?;
    paths::copy_file(&pristine.modules(), &dest.join("kernel/modules.squashfs"))?;
    paths::copy_file(&pristine.ovmf_code(), &dest.join(OVMF_CODE))?;
    update_shim(keyset, &pristine.shim(), &dest.join(SHIM_EFI))?;
    build_uki(keyset, &pristine.kernel(), &dest.join(KERNEL_EFI), mosctl)?;
    build_ovmf_vars(keyset, &pristine.ovmf_vars())?;
    log::info!("customized bootkit for keyset {}", keyset.name());
    Ok(())
}

/// An install manifest booting the published `<rootfs>` layer as the live
/// root filesystem.
pub fn stub_manifest(product: Uuid, rootfs: &str, layer_version: &str) -> String {
    format!(
        r#"version: 1
product: "{product}"
update_type: complete
targets:
  - service_name: livecd
    source: "docker://{LAYER_REGISTRY}/machine/bootkit/{rootfs}:{layer_version}-squashfs"
    version: "{layer_version}"
    service_type: fs-only
    nsgroup: "none"
    network:
      type: none
"#
    )
}

/// Publish `manifest` to a fresh local registry and build an ISO booting it.
fn build_from_stub(keyset: &Keyset, project: &str, manifest: &str, out: &Path) -> Result<()> {
    let work = tempfile::tempdir()?;
    let cache = work.path().join("cache");
    let zot = ZotServer::start(work.path(), &cache)?;

    let manifest_path = work.path().join("manifest.yaml");
    paths::write_mode(&manifest_path, manifest.as_bytes(), 0o600)?;
    publish_manifest(keyset, project, &zot.repo()?, LIVECD_NAME, LIVECD_TAG, &manifest_path)?;

    let url = format!("docker://{}/{LIVECD_NAME}:{LIVECD_TAG}", zot.addr());
    let mut boot = OciBoot::new(keyset.clone(), project, &url, out);
    boot.cmdline = "console=ttyS0".to_string();
    boot.mirror = Some(zot.addr());
    boot.repo_dir = Some(zot.storage().to_path_buf());
    boot.build()
}

/// An ISO that provisions a machine's TPM for `project`.
pub fn build_provisioner(keyset: &Keyset, project: &str, out: &Path, layer_version: &str) -> Result<()> {
    let manifest = stub_manifest(keyset.product_uuid(project)?, "provision-rootfs", layer_version);
    build_from_stub(keyset, project, &manifest, out)
}

/// An ISO that installs the manifest at `install_url`, or the stock
/// installer layer when none is given.
pub fn build_installer(
    keyset: &Keyset,
    project: &str,
    install_url: Option<&str>,
    out: &Path,
    layer_version: &str,
) -> Result<()> {
    match install_url {
        Some(url) => {
            let mut boot = OciBoot::new(keyset.clone(), project, url, out);
            boot.cmdline = "console=ttyS0".to_string();
            boot.boot_from_remote = true;
            boot.build()
        }
        None => {
            let manifest = stub_manifest(keyset.product_uuid(project)?, "install-rootfs", layer_version);
            build_from_stub(keyset, project, &manifest, out)
        }
    }
}
