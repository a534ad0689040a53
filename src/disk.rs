//! The provisioned-data partitions: a plaintext PBF carrying the pcr7data tree
//! and a LUKS2 SBF protected by the sbs-key.
use crate::paths::{self, PathError};
use crate::run::{self, RunError};
use serde::{Deserialize, Deserializer};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::{uuid, Uuid};

pub const PBF_TYPE_GUID: Uuid = uuid!("01a3e19f-9fea-ed47-92c2-e75639ff5601");
pub const SBF_TYPE_GUID: Uuid = uuid!("01a3e19f-9fea-ed47-92c2-e75639ff5602");
pub const PBF_NAME: &str = "pbf";
pub const SBF_NAME: &str = "sbf";
pub const SBF_MAPPER_NAME: &str = "secureBootFlash";
pub const PBF_MOUNTPOINT: &str = "/factory/pbf";
pub const SBF_MOUNTPOINT: &str = "/factory/secure";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const PBF_START_MIB: u64 = 4;
const PBF_SIZE_MIB: u64 = 64;
const SBF_START_MIB: u64 = 68;
const SBF_SIZE_MIB: u64 = 256;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to parse lsblk output: {0}")]
    Lsblk(#[from] serde_json::Error),
    #[error("cannot provision: {0} already has PBF or SBF partitions")]
    AlreadyPartitioned(String),
    #[error("did not find a suitable disk for the PBF and SBF partitions")]
    NoSuitableDisk,
    #[error("partition {0} has a provisioning type but cannot be read")]
    Unreadable(PathBuf),
    #[error("{what} failed: {source}")]
    Step {
        what: &'static str,
        #[source]
        source: RunError,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = DiskError> = core::result::Result<T, E>;

fn step(what: &'static str) -> impl FnOnce(RunError) -> DiskError {
    move |source| DiskError::Step { what, source }
}

// lsblk renders booleans as "0"/"1" on older util-linux
fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(d)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s == "1",
    })
}

/// One entry of `lsblk --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub size: u64,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub rota: bool,
    pub tran: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub parttype: Option<String>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Deserialize)]
struct Lsblk {
    blockdevices: Vec<BlockDevice>,
}

impl BlockDevice {
    fn part_type(&self) -> Option<Uuid> {
        self.parttype.as_deref().and_then(|t| Uuid::parse_str(t).ok())
    }

    fn is_usb(&self) -> bool {
        self.tran.as_deref() == Some("usb")
    }

    fn is_ata(&self) -> bool {
        self.tran.as_deref() == Some("sata")
    }
}

pub fn parse_lsblk(json: &[u8]) -> Result<Vec<BlockDevice>> {
    Ok(serde_json::from_slice::<Lsblk>(json)?.blockdevices)
}

pub fn scan() -> Result<Vec<BlockDevice>> {
    let out = run::capture(
        &mut run::cmd(
            "lsblk",
            [
                "--json",
                "--bytes",
                "--output",
                "NAME,PATH,SIZE,ROTA,TRAN,TYPE,PARTTYPE",
            ],
        ),
        None,
    )
    .map_err(step("lsblk"))?;
    parse_lsblk(&out)
}

/// Provisioned-data partitions found on the system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustPartitions {
    pub pbf: Option<PathBuf>,
    pub sbf: Option<PathBuf>,
}

impl TrustPartitions {
    pub fn is_empty(&self) -> bool {
        self.pbf.is_none() && self.sbf.is_none()
    }
}

/// The first PBF and SBF partitions among `devices`. A matching partition whose
/// device node is missing is an error rather than skipped.
pub fn find_trust_partitions(devices: &[BlockDevice]) -> Result<TrustPartitions> {
    let mut found = TrustPartitions::default();
    for disk in devices {
        for part in &disk.children {
            let slot = match part.part_type() {
                Some(t) if t == PBF_TYPE_GUID => &mut found.pbf,
                Some(t) if t == SBF_TYPE_GUID => &mut found.sbf,
                _ => continue,
            };
            if !part.path.exists() {
                return Err(DiskError::Unreadable(part.path.clone()));
            }
            if slot.is_none() {
                *slot = Some(part.path.clone());
            }
        }
    }
    Ok(found)
}

/// A disk for the provisioned-data partitions. `requested` of `None` or
/// `any` considers every disk; otherwise only the named one.
pub fn choose_disk<'a>(
    devices: &'a [BlockDevice],
    requested: Option<&str>,
) -> Result<&'a BlockDevice> {
    let wanted = requested
        .filter(|r| *r != "any")
        .map(|r| Path::new(r).file_name().map(|n| n.to_string_lossy().into_owned()));
    let mut disks: Vec<&BlockDevice> = devices
        .iter()
        .filter(|d| d.kind == "disk")
        .filter(|d| match &wanted {
            Some(name) => name.as_deref() == Some(d.name.as_str()),
            None => true,
        })
        .collect();
    disks.sort_by(|a, b| a.name.cmp(&b.name));

    let common = |d: &BlockDevice| d.size >= GIB && !d.is_usb();
    let searches: [&dyn Fn(&BlockDevice) -> bool; 3] = [
        &|d| common(d) && !d.rota && d.is_ata(),
        &|d| common(d) && !d.rota,
        &|d| common(d) && d.rota,
    ];
    searches
        .iter()
        .find_map(|search| disks.iter().copied().find(|&d| search(d)))
        .ok_or(DiskError::NoSuitableDisk)
}

/// `/dev/sda` + 1 is `/dev/sda1`, `/dev/nvme0n1` + 1 is `/dev/nvme0n1p1`.
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let name = disk.display().to_string();
    let sep = if name.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    PathBuf::from(format!("{name}{sep}{number}"))
}

fn sgdisk_new_args(number: u32, start_mib: u64, size_mib: u64, guid: Uuid, name: &str) -> Vec<String> {
    vec![
        format!("--new={number}:{start_mib}M:+{size_mib}M"),
        format!("--typecode={number}:{}", guid.hyphenated().to_string().to_uppercase()),
        format!("--change-name={number}:{name}"),
    ]
}

pub fn mount(device: &Path, target: &Path, fstype: &str, read_only: bool) -> Result<()> {
    paths::create_dir_mode(target, 0o755)?;
    let mut args = vec!["-t".to_string(), fstype.to_string()];
    if read_only {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    args.push(device.display().to_string());
    args.push(target.display().to_string());
    run::run(&mut run::cmd("mount", &args)).map_err(step("mount"))
}

pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    paths::create_dir_mode(target, 0o755)?;
    run::run(&mut run::cmd(
        "mount",
        [OsStr::new("--bind"), source.as_os_str(), target.as_os_str()],
    ))
    .map_err(step("bind mount"))
}

/// Make `target` a bind mount of itself that does not propagate mounts back
/// to its shared parent.
pub fn make_slave(target: &Path) -> Result<()> {
    bind_mount(target, target)?;
    run::run(&mut run::cmd(
        "mount",
        [OsStr::new("--make-rslave"), target.as_os_str()],
    ))
    .map_err(step("make-rslave"))
}

pub fn mount_tmpfs(target: &Path, size: &str) -> Result<()> {
    paths::create_dir_mode(target, 0o700)?;
    run::run(&mut run::cmd(
        "mount",
        [
            OsStr::new("-t"),
            OsStr::new("tmpfs"),
            OsStr::new("-o"),
            OsStr::new(&format!("size={size},mode=0700")),
            OsStr::new("tmpfs"),
            target.as_os_str(),
        ],
    ))
    .map_err(step("mount tmpfs"))
}

pub fn umount(target: &Path) -> Result<()> {
    run::run(&mut run::cmd("umount", [target])).map_err(step("umount"))
}

pub fn luks_format(device: &Path, passphrase: &str) -> Result<()> {
    run::run_with_stdin(
        &mut run::cmd(
            "cryptsetup",
            [
                OsStr::new("luksFormat"),
                OsStr::new("--type=luks2"),
                OsStr::new("--batch-mode"),
                OsStr::new("--key-file=-"),
                device.as_os_str(),
            ],
        ),
        passphrase.as_bytes(),
    )
    .map_err(step("luksFormat"))
}

/// Open `device` as `/dev/mapper/<name>`.
pub fn luks_open(device: &Path, passphrase: &str, name: &str) -> Result<PathBuf> {
    run::run_with_stdin(
        &mut run::cmd(
            "cryptsetup",
            [
                OsStr::new("open"),
                OsStr::new("--key-file=-"),
                device.as_os_str(),
                OsStr::new(name),
            ],
        ),
        passphrase.as_bytes(),
    )
    .map_err(step("luks open"))?;
    Ok(Path::new("/dev/mapper").join(name))
}

pub fn luks_close(name: &str) -> Result<()> {
    run::run(&mut run::cmd("cryptsetup", ["close", name])).map_err(step("luks close"))
}

fn mkfs_ext4(device: &Path) -> Result<()> {
    run::run(&mut run::cmd("mkfs.ext4", [OsStr::new("-F"), device.as_os_str()]))
        .map_err(step("mkfs.ext4"))
}

/// Create and populate the PBF and SBF partitions on `disk`.
pub fn partition_for_tpm(
    disk: &BlockDevice,
    wipe: bool,
    pcr7data: &Path,
    sbs_passphrase: &str,
) -> Result<TrustPartitions> {
    if wipe {
        run::run(&mut run::cmd("sgdisk", [OsStr::new("--zap-all"), disk.path.as_os_str()]))
            .map_err(step("wipe"))?;
    }
    let mut args = sgdisk_new_args(1, PBF_START_MIB, PBF_SIZE_MIB, PBF_TYPE_GUID, PBF_NAME);
    args.extend(sgdisk_new_args(2, SBF_START_MIB, SBF_SIZE_MIB, SBF_TYPE_GUID, SBF_NAME));
    args.push(disk.path.display().to_string());
    log::debug!("partitioning {}", disk.path.display());
    run::run(&mut run::cmd("sgdisk", &args)).map_err(step("sgdisk"))?;

    let pbf = partition_path(&disk.path, 1);
    mkfs_ext4(&pbf)?;
    let mnt = tempfile::tempdir().map_err(|source| PathError::Io {
        path: std::env::temp_dir(),
        source,
    })?;
    mount(&pbf, mnt.path(), "ext4", false)?;
    let copied = paths::copy_tree(pcr7data, &mnt.path().join("pcr7data"));
    umount(mnt.path())?;
    copied?;

    let sbf = partition_path(&disk.path, 2);
    luks_format(&sbf, sbs_passphrase)?;
    let mapped = luks_open(&sbf, sbs_passphrase, SBF_MAPPER_NAME)?;
    let formatted = mkfs_ext4(&mapped);
    luks_close(SBF_MAPPER_NAME)?;
    formatted?;

    log::info!("created PBF {} and SBF {}", pbf.display(), sbf.display());
    Ok(TrustPartitions {
        pbf: Some(pbf),
        sbf: Some(sbf),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const LSBLK: &str = r#"{
       "blockdevices": [
          {"name":"sda", "path":"/dev/sda", "size":500107862016, "rota":true, "tran":"sata", "type":"disk", "parttype":null},
          {"name":"sdb", "path":"/dev/sdb", "size":32010928128, "rota":"0", "tran":"usb", "type":"disk", "parttype":null},
          {"name":"nvme0n1", "path":"/dev/nvme0n1", "size":256060514304, "rota":false, "tran":"nvme", "type":"disk", "parttype":null,
             "children": [
                {"name":"nvme0n1p1", "path":"/dev/null", "size":67108864, "rota":false, "tran":null, "type":"part", "parttype":"01a3e19f-9fea-ed47-92c2-e75639ff5601"},
                {"name":"nvme0n1p2", "path":"/dev/null", "size":268435456, "rota":false, "tran":null, "type":"part", "parttype":"01a3e19f-9fea-ed47-92c2-e75639ff5602"}
             ]
          }
       ]
    }"#;

    #[test]
    fn guid_raw_bytes() {
        assert_eq!(
            hex::encode(PBF_TYPE_GUID.to_bytes_le()),
            "9fe1a301ea9f47ed92c2e75639ff5601"
        );
        assert_eq!(
            hex::encode(SBF_TYPE_GUID.to_bytes_le()),
            "9fe1a301ea9f47ed92c2e75639ff5602"
        );
    }

    #[test]
    fn parses_lsblk() -> Result<()> {
        let devices = parse_lsblk(LSBLK.as_bytes())?;
        assert_eq!(devices.len(), 3);
        assert!(devices[0].rota);
        assert!(!devices[1].rota);
        assert_eq!(devices[2].children.len(), 2);
        Ok(())
    }

    #[test]
    fn finds_partitions() -> Result<()> {
        let devices = parse_lsblk(LSBLK.as_bytes())?;
        let found = find_trust_partitions(&devices)?;
        assert_eq!(found.pbf, Some(PathBuf::from("/dev/null")));
        assert_eq!(found.sbf, Some(PathBuf::from("/dev/null")));
        assert!(find_trust_partitions(&devices[..2])?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_partition_node_is_fatal() -> Result<()> {
        let json = LSBLK.replace("\"path\":\"/dev/null\"", "\"path\":\"/dev/does-not-exist\"");
        let devices = parse_lsblk(json.as_bytes())?;
        assert!(matches!(
            find_trust_partitions(&devices),
            Err(DiskError::Unreadable(_))
        ));
        Ok(())
    }

    #[test]
    fn disk_preference() -> Result<()> {
        let devices = parse_lsblk(LSBLK.as_bytes())?;
        // ssd over hdd, usb never
        assert_eq!(choose_disk(&devices, None)?.name, "nvme0n1");
        assert_eq!(choose_disk(&devices, Some("/dev/sda"))?.name, "sda");
        assert!(matches!(
            choose_disk(&devices, Some("sdb")),
            Err(DiskError::NoSuitableDisk)
        ));
        Ok(())
    }

    #[test]
    fn partition_names() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
    }

    #[test]
    fn sgdisk_arguments() {
        assert_eq!(
            sgdisk_new_args(1, 4, 64, PBF_TYPE_GUID, PBF_NAME),
            vec![
                "--new=1:4M:+64M",
                "--typecode=1:01A3E19F-9FEA-ED47-92C2-E75639FF5601",
                "--change-name=1:pbf",
            ]
        );
    }
}
