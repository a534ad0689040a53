//! The EFI system partition: its tree and the FAT image holding it.
use super::cmdline::{startup_nsh, BootMode};
use super::{BuilderError, Result};
use crate::paths::{self, IoContext};
use crate::run;
use std::fs::OpenOptions;
use std::path::Path;

pub const EFI_BOOT_DIR: &str = "efi/boot";
pub const SHIM_EFI: &str = "shim.efi";
pub const KERNEL_EFI: &str = "kernel.efi";
pub const ESP_LABEL: &str = "EFIBOOT";

/// Fill `dest/efi/boot` from `bootkit` for `mode`, returning the mode used.
pub fn populate_efi(bootkit: &Path, mode: BootMode, cmdline: &str, dest: &Path) -> Result<BootMode> {
    let mode = match mode {
        BootMode::Auto if bootkit.join(SHIM_EFI).exists() => BootMode::Shim,
        BootMode::Auto => BootMode::Kernel,
        m => m,
    };
    let boot = dest.join(EFI_BOOT_DIR);
    paths::create_dir_mode(&boot, 0o755)?;
    let script = match mode {
        BootMode::Shim => {
            paths::copy_file(&bootkit.join(SHIM_EFI), &boot.join(SHIM_EFI))?;
            startup_nsh(SHIM_EFI, Some(KERNEL_EFI), cmdline)
        }
        _ => startup_nsh(KERNEL_EFI, None, cmdline),
    };
    paths::copy_file(&bootkit.join(KERNEL_EFI), &boot.join(KERNEL_EFI))?;
    paths::write_mode(&boot.join("startup.nsh"), script.as_bytes(), 0o644)?;
    log::debug!("populated {} for {mode}", boot.display());
    Ok(mode)
}

/// Bytes to allocate for a FAT filesystem holding `tree_size` bytes of files.
pub fn esp_size(tree_size: u64) -> u64 {
    (tree_size * 105).div_ceil(100)
}

/// Create the FAT32 image `image` sized for, and holding, `tree/efi`.
pub fn make_esp(image: &Path, tree: &Path) -> Result<()> {
    let size = esp_size(paths::dir_size(tree)?);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(image)
        .at(image)?;
    file.set_len(size).at(image)?;
    drop(file);

    let mut mkfs = run::cmd("mkfs.fat", ["-s", "1", "-F", "32", "-n", ESP_LABEL]);
    run::run(mkfs.arg(image)).map_err(BuilderError::tool("mkfs.fat"))?;
    mcopy(image, &tree.join("efi"), "::efi")?;
    log::info!("created {size} byte ESP image {}", image.display());
    Ok(())
}

/// Copy `src` recursively into the FAT filesystem `image` (which may carry an
/// `@@<offset>` suffix) at `dest`.
pub fn mcopy(image: &Path, src: &Path, dest: &str) -> Result<()> {
    let mut cmd = run::cmd("mcopy", ["-s", "-i"]);
    cmd.arg(image).arg(src).arg(dest).env("MTOOLS_SKIP_CHECK", "1");
    run::run(&mut cmd).map_err(BuilderError::tool("mcopy"))
}
