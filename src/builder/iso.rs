//! Laying out a staged tree as an ISO 9660 image or a GPT disk.
use super::cmdline::ISO_LABEL;
use super::esp::{mcopy, ESP_LABEL};
use super::{BuilderError, Result};
use crate::paths::IoContext;
use crate::run;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const ESP_IMAGE: &str = "loader/images/efi-esp.img";
pub const MODULES: &str = "krd/modules.squashfs";
pub const OCI_DIR: &str = "oci";

pub const DEFAULT_DISK_SIZE: u64 = 1 << 30;
const PARTITION_START_SECTOR: u64 = 2048;
const SECTOR_SIZE: u64 = 512;

/// The kernel modules squashfs of a bootkit.
pub fn modules_squashfs(bootkit: &Path) -> Result<PathBuf> {
    ["kernel/modules.squashfs", "modules.squashfs"]
        .iter()
        .map(|p| bootkit.join(p))
        .find(|p| p.exists())
        .ok_or_else(|| BuilderError::Bootkit(bootkit.join("kernel/modules.squashfs")))
}

pub fn xorriso_args(out: &Path, staging: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-compliance", "iso_9660_level=3", "-as", "mkisofs", "-o"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(out.into());
    for arg in [
        "-V",
        ISO_LABEL,
        "-eltorito-alt-boot",
        "-e",
        ESP_IMAGE,
        "-no-emul-boot",
        "-isohybrid-gpt-basdat",
    ] {
        args.push(arg.into());
    }
    args.push(staging.into());
    args
}

pub fn make_iso(out: &Path, staging: &Path) -> Result<()> {
    run::run(&mut run::cmd("xorriso", xorriso_args(out, staging))).map_err(BuilderError::tool("xorriso"))?;
    log::info!("wrote {}", out.display());
    Ok(())
}

/// A disk image with one EFI system partition holding `staging`.
pub fn make_disk(out: &Path, staging: &Path, size: Option<u64>) -> Result<()> {
    let size = size.unwrap_or(DEFAULT_DISK_SIZE);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(out)
        .at(out)?;
    file.set_len(size).at(out)?;
    drop(file);

    let mut sgdisk = run::cmd(
        "sgdisk",
        [
            format!("--new=1:{PARTITION_START_SECTOR}:0"),
            "--typecode=1:ef00".to_string(),
        ],
    );
    run::run(sgdisk.arg(out)).map_err(BuilderError::tool("sgdisk"))?;

    let offset = PARTITION_START_SECTOR.to_string();
    let mut mkfs = run::cmd("mkfs.fat", ["-F", "32", "-n", ESP_LABEL, "--offset", offset.as_str()]);
    run::run(mkfs.arg(out)).map_err(BuilderError::tool("mkfs.fat"))?;

    let mut image = OsString::from(out);
    image.push(format!("@@{}", PARTITION_START_SECTOR * SECTOR_SIZE));
    let image = PathBuf::from(image);
    for entry in std::fs::read_dir(staging).at(staging)? {
        let entry = entry.at(staging)?;
        let dest = format!("::{}", entry.file_name().to_string_lossy());
        mcopy(&image, &entry.path(), &dest)?;
    }
    log::info!("wrote {size} byte disk {}", out.display());
    Ok(())
}
