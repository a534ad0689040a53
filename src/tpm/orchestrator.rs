//! The TPM lifecycle: taking ownership of a blank TPM and storing the
//! provisioned secrets, unlocking them on every boot from the signed initrd,
//! rotating the OS key before an install, and clearing the TPM again.
//!
//! Every secret read goes through a signed-policy session: PCR7 must match
//! the value the pcr7data entry was signed for, and for LUKS secrets the
//! ea-version index must hold the signed policy version.
use super::nv::{NvIndex, TPM_LAYOUT_VERSION};
use super::policy::{PolicyKind, PolicyVersion, SignData, PCR7DATA_DIR};
use super::tools::{self, Authorized, ExternalKey, Owner, Primary, Session};
use super::{get_context, Result, TpmError};
use crate::disk::{self, DiskError, TrustPartitions, PBF_MOUNTPOINT, SBF_MAPPER_NAME};
use crate::hwrng::{self, ADMIN_PASSPHRASE_LEN, LUKS_PASSPHRASE_LEN};
use crate::paths;
use crate::pcr7::PcrError;
use crate::run;
use std::path::{Path, PathBuf};

/// Where the pcr7data tree is found, either on the boot media or bind
/// mounted from the PBF.
pub const SIGNDATA_DIR: &str = "/pcr7data";
/// Overrides the PCR7 read from the TPM.
pub const PCR7_FILE: &str = "/pcr7.bin";
pub const PASSPHRASE_BACKUP: &str = "/run/tpm-passphrase";
pub const PRIV_DIR: &str = "/priv";
pub const MANIFEST_CA: &str = "/manifestCA.pem";
pub const SUDI_CERT_FILE: &str = "sudi.pem";
pub const SUDI_KEY_FILE: &str = "sudi-key.pem";
pub const KEYRING_KEY: &str = "machine:luks";
// possessor and user: all
const KEYRING_PERM: &str = "0x3f3f0000";
const EA_VERSION_SIZE: usize = 4;

/// The running PCR7, from [`PCR7_FILE`] when present.
pub fn current_pcr7() -> Result<Vec<u8>> {
    let file = Path::new(PCR7_FILE);
    if file.exists() {
        log::debug!("using pcr7 from {PCR7_FILE}");
        return Ok(paths::read(file)?);
    }
    get_context()?.pcr7()
}

/// `(offset, size)` reads covering `size` bytes in pieces of at most `max`.
fn chunks(size: usize, max: usize) -> Vec<(usize, usize)> {
    let max = max.max(1);
    (0..size)
        .step_by(max)
        .map(|offset| (offset, max.min(size - offset)))
        .collect()
}

fn layout_version() -> String {
    format!("{TPM_LAYOUT_VERSION:08}")
}

/// The trust state of this machine: its provisioned-data partitions and the
/// pcr7data entry for the running PCR7.
#[derive(Debug)]
pub struct Trust {
    signdata_dir: PathBuf,
    sign_data: SignData,
    partitions: TrustPartitions,
}

impl Trust {
    pub fn open() -> Result<Self> {
        Self::open_at(Path::new(SIGNDATA_DIR))
    }

    pub fn open_at(signdata_dir: &Path) -> Result<Self> {
        let partitions = disk::find_trust_partitions(&disk::scan()?)?;
        if !signdata_dir.exists() {
            mount_signdata(&partitions, signdata_dir)?;
        }
        let sign_data = SignData::choose(signdata_dir, &current_pcr7()?)?;
        Ok(Self {
            signdata_dir: signdata_dir.to_path_buf(),
            sign_data,
            partitions,
        })
    }

    pub fn sign_data(&self) -> &SignData {
        &self.sign_data
    }

    /// A policy session authorized by the signed policy of `kind`.
    fn authorized_session(
        &self,
        kind: PolicyKind,
        key: &ExternalKey,
    ) -> Result<Session<Authorized>> {
        let signed = self.sign_data.signed_policy(kind);
        let primary = Primary::create()?;
        let session = Session::policy(&primary)?.policy_pcr()?;
        let session = if kind.checks_version() {
            let version = tools::nv_read_public(NvIndex::EaVersion, EA_VERSION_SIZE)?;
            session
                .policy_nv(&String::from_utf8_lossy(&version))?
                .authorize(key, &signed)?
        } else {
            session.authorize(key, &signed)?
        };
        Ok(session)
    }

    /// Read all of `index`, one authorized session per TPM-sized chunk.
    fn read_secret(&self, index: NvIndex, kind: PolicyKind) -> Result<Vec<u8>> {
        let (size, max) = {
            let mut ctx = get_context()?;
            (ctx.nv_size(index)?, ctx.nv_buffer_max()?)
        };
        let key = ExternalKey::load(&self.sign_data.pubkey(kind))?;
        log::debug!("reading {index}: {size} bytes, buffer max {max}");
        let mut secret = Vec::with_capacity(size);
        for (offset, len) in chunks(size, max) {
            log::debug!("reading {len} bytes at offset {offset}");
            let piece = self
                .authorized_session(kind, &key)?
                .nv_read(index, len, offset)?;
            secret.extend_from_slice(&piece);
        }
        Ok(secret)
    }

    /// Take ownership of a blank TPM and store the provisioned identity plus
    /// freshly generated SBS and OS passphrases in it.
    pub fn provision(&self, cert: &Path, key: &Path, disk: Option<&str>, wipe: bool) -> Result<()> {
        self.sign_data.require(PolicyKind::Luks)?;
        hwrng::hwrng_seed()?;
        if !self.partitions.is_empty() {
            let found = [&self.partitions.pbf, &self.partitions.sbf]
                .into_iter()
                .flatten()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DiskError::AlreadyPartitioned(found).into());
        }
        let cert = paths::read(cert)?;
        let key = paths::read(key)?;

        log::info!("taking ownership of TPM");
        clear_unowned()?;
        tools::setup_dictionary_lockout()?;

        let admin = hwrng::gen_passphrase(ADMIN_PASSPHRASE_LEN)?;
        if let Err(e) = paths::write_mode(Path::new(PASSPHRASE_BACKUP), admin.as_bytes(), 0o600) {
            log::warn!("unable to save admin passphrase backup: {e}");
        }
        self.store_admin_password(&admin)?;

        let owner = Owner::new(&admin);
        log::debug!("storing TPM layout and policy versions");
        store_public(&owner, NvIndex::TpmVersion, &layout_version())?;
        store_public(&owner, NvIndex::EaVersion, &PolicyVersion::CURRENT.to_string())?;

        let sbs = hwrng::gen_passphrase(LUKS_PASSPHRASE_LEN)?;
        let os = hwrng::gen_passphrase(LUKS_PASSPHRASE_LEN)?;
        match disk {
            Some(requested) => {
                let devices = disk::scan()?;
                let target = disk::choose_disk(&devices, Some(requested))?;
                disk::partition_for_tpm(target, wipe, &self.signdata_dir, &sbs)?;
            }
            None => log::warn!("no disk given, no PBF or SBF will be created"),
        }

        let policy = authorize_digest(&self.sign_data.pubkey(PolicyKind::Luks))?;
        let secrets: [(NvIndex, &[u8]); 4] = [
            (NvIndex::SbsKey, sbs.as_bytes()),
            (NvIndex::ProvisionedCert, cert.as_slice()),
            (NvIndex::ProvisionedKey, key.as_slice()),
            (NvIndex::OsKey, os.as_bytes()),
        ];
        for (index, data) in secrets {
            owner.nv_define(index, data.len(), Some(&policy))?;
        }
        for (index, data) in secrets {
            owner.nv_write(index, data)?;
        }
        log::info!("provisioned TPM");
        Ok(())
    }

    fn store_admin_password(&self, admin: &str) -> Result<()> {
        get_context()?.change_hierarchy_auth(admin)?;
        let policy = authorize_digest(&self.sign_data.pubkey(PolicyKind::Passwd))?;
        let owner = Owner::new(admin);
        owner.nv_define(NvIndex::AdminPassword, admin.len(), Some(&policy))?;
        owner.nv_write(NvIndex::AdminPassword, admin.as_bytes())?;
        Ok(())
    }

    /// The TPM admin password, readable only while booted with the tpm key.
    pub fn read_admin_password(&self) -> Result<String> {
        self.sign_data.require(PolicyKind::Passwd)?;
        let raw = self.read_secret(NvIndex::AdminPassword, PolicyKind::Passwd)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Unlock the provisioned secrets, then extend PCR7 so they stay locked
    /// for the rest of this boot.
    pub fn initrd_setup(&self) -> Result<()> {
        self.sign_data.require(PolicyKind::Luks)?;
        let unlocked = self.unlock();
        if let Err(e) = &unlocked {
            log::error!("initrd setup failed: {e}");
        }
        lock_pcr7()?;
        unlocked
    }

    fn unlock(&self) -> Result<()> {
        let dest = setup_factory(Path::new(PRIV_DIR))?;

        let cert = self.read_secret(NvIndex::ProvisionedCert, PolicyKind::Luks)?;
        paths::write_mode(&dest.join(SUDI_CERT_FILE), &cert, 0o600)?;
        let key = self.read_secret(NvIndex::ProvisionedKey, PolicyKind::Luks)?;
        paths::write_mode(&dest.join(SUDI_KEY_FILE), &key, 0o600)?;
        log::info!("copied provisioned identity");

        let os = self.read_secret(NvIndex::OsKey, PolicyKind::Luks)?;
        add_to_keyring(&os)?;

        paths::copy_file(Path::new(MANIFEST_CA), &dest.join("manifestCA.pem"))?;

        let secure = Path::new(disk::SBF_MOUNTPOINT);
        if let Some(sbf) = &self.partitions.sbf {
            let sbs = self.read_secret(NvIndex::SbsKey, PolicyKind::Luks)?;
            let mapped = disk::luks_open(sbf, &String::from_utf8_lossy(&sbs), SBF_MAPPER_NAME)?;
            disk::mount(&mapped, secure, "ext4", false)?;
        } else {
            paths::create_dir_mode(secure, 0o700)?;
        }
        // the initrd still needs these while the tmpfs is only under /priv
        paths::copy_file(&dest.join(SUDI_CERT_FILE), &secure.join(SUDI_CERT_FILE))?;
        if let Err(e) = paths::copy_file(Path::new(MANIFEST_CA), &secure.join("manifestCA.pem")) {
            log::warn!("failed copying manifest CA: {e}");
        }
        Ok(())
    }

    /// Replace the OS passphrase before an install. PCR7 is only extended
    /// once the new passphrase is in place.
    pub fn preinstall(&self) -> Result<()> {
        self.sign_data.require(PolicyKind::Luks)?;
        let os = hwrng::gen_passphrase(LUKS_PASSPHRASE_LEN)?;
        let key = ExternalKey::load(&self.sign_data.pubkey(PolicyKind::Luks))?;
        self.authorized_session(PolicyKind::Luks, &key)?
            .nv_write(NvIndex::OsKey, os.as_bytes())?;
        add_to_keyring(os.as_bytes())?;
        lock_pcr7()
    }
}

/// Bind the PBF's pcr7data to `signdata_dir`.
fn mount_signdata(partitions: &TrustPartitions, signdata_dir: &Path) -> Result<()> {
    let pbf = partitions
        .pbf
        .as_ref()
        .ok_or_else(|| PcrError::Layout("no signdata found".to_string()))?;
    let pbf_mount = Path::new(PBF_MOUNTPOINT);
    disk::mount(pbf, pbf_mount, "ext4", true)?;
    disk::bind_mount(&pbf_mount.join(PCR7DATA_DIR), signdata_dir)?;
    Ok(())
}

/// The private tmpfs the identity is unpacked to. Returns its `secure` directory.
fn setup_factory(priv_dir: &Path) -> Result<PathBuf> {
    paths::create_dir_mode(priv_dir, 0o755)?;
    // / is shared, and nothing below /priv may propagate out of it
    disk::make_slave(priv_dir)?;
    let tmpfs = priv_dir.join("factory");
    disk::mount_tmpfs(&tmpfs, "1G")?;

    let pbf = Path::new(PBF_MOUNTPOINT);
    if pbf.exists() {
        let private = priv_dir.join(PBF_MOUNTPOINT.trim_start_matches('/'));
        if let Err(e) = disk::bind_mount(pbf, &private) {
            log::warn!("failed bind mounting {} to {}: {e}", pbf.display(), private.display());
        }
    }

    let dest = tmpfs.join("secure");
    paths::create_dir_mode(&dest, 0o700)?;
    Ok(dest)
}

fn add_to_keyring(passphrase: &[u8]) -> Result<()> {
    let id = run::capture(
        &mut run::cmd("keyctl", ["padd", "user", KEYRING_KEY, "@s"]),
        Some(passphrase),
    )
    .map_err(TpmError::Keyring)?;
    let id = String::from_utf8_lossy(&id).trim().to_string();
    for args in [
        ["setperm", id.as_str(), KEYRING_PERM],
        ["link", id.as_str(), "@u"],
        ["unlink", id.as_str(), "@s"],
    ] {
        run::run(&mut run::cmd("keyctl", args)).map_err(TpmError::Keyring)?;
    }
    log::debug!("added {KEYRING_KEY} to the user keyring");
    Ok(())
}

/// Digest letting any policy signed by the key at `pubkey` satisfy an index.
fn authorize_digest(pubkey: &Path) -> Result<Vec<u8>> {
    let key = ExternalKey::load(pubkey)?;
    Ok(Session::trial()?.authorize_trial(&key)?)
}

/// Publicly readable, owner-written value.
fn store_public(owner: &Owner, index: NvIndex, value: &str) -> Result<()> {
    owner.nv_define(index, value.len(), None)?;
    owner.nv_write(index, value.as_bytes())?;
    Ok(())
}

/// Clear a TPM whose lockout auth is still empty.
fn clear_unowned() -> Result<()> {
    let mut ctx = get_context()?;
    match ctx.clear_platform() {
        Ok(()) => {
            log::info!("cleared TPM through platform hierarchy");
            Ok(())
        }
        Err(e) => {
            log::debug!("platform clear failed: {e}");
            ctx.lockout(None)?.clear()
        }
    }
}

/// Extend PCR7 so no signed policy matches for the rest of this boot. If that
/// fails the secrets would stay readable, so the machine is powered off.
pub fn lock_pcr7() -> Result<()> {
    if let Err(e) = get_context().and_then(|mut ctx| ctx.extend_pcr7()) {
        log::error!("failed extending PCR 7: {e}");
        if let Err(off) = run::run(&mut run::cmd("poweroff", Vec::<&str>::new())) {
            log::error!("failed powering off: {off}");
        }
        return Err(e);
    }
    Ok(())
}

/// Clear the TPM. An empty lockout auth is tried first, then the admin
/// password read under the signed password policy.
pub fn tpm_clear() -> Result<()> {
    match clear_unowned() {
        Ok(()) => return Ok(()),
        Err(e) => log::info!("clear with empty lockout auth failed ({e}), using admin password"),
    }
    let password = Trust::open()?.read_admin_password()?;
    get_context()?.lockout(Some(&password))?.clear()
}

/// The policy version stored in the TPM.
pub fn read_policy_version() -> Result<PolicyVersion> {
    let raw = tools::nv_read_public(NvIndex::EaVersion, EA_VERSION_SIZE)?;
    Ok(String::from_utf8_lossy(&raw).parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn chunked_reads_cover_the_index() {
        assert_eq!(chunks(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(chunks(1024, 1024), vec![(0, 1024)]);
        assert_eq!(chunks(1600, 1024), vec![(0, 1024), (1024, 576)]);
        assert!(chunks(0, 1024).is_empty());
    }

    #[test]
    fn layout_version_is_zero_padded() {
        assert_eq!(layout_version(), "00000003");
        assert_eq!(PolicyVersion::CURRENT.to_string().len(), EA_VERSION_SIZE);
    }

    #[test]
    fn missing_pbf_is_a_layout_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = mount_signdata(&TrustPartitions::default(), &dir.path().join("pcr7data"))
            .unwrap_err();
        assert!(matches!(err, TpmError::SignData(PcrError::Layout(_))));
        Ok(())
    }

    #[test]
    #[ignore = "needs a provisioned TPM"]
    fn policy_version_is_current() -> Result<()> {
        assert_eq!(read_policy_version()?, PolicyVersion::CURRENT);
        Ok(())
    }
}
