//! Kernel command lines and the EFI shell script that boots them.
use super::{BuilderError, Result};
use std::fmt;
use std::str::FromStr;

pub const ISO_LABEL: &str = "OCI-BOOT";

/// How the ESP boots the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    /// Shim if the bootkit has one, else the kernel directly.
    #[default]
    Auto,
    Shim,
    Kernel,
}

impl FromStr for BootMode {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "efi-auto" => Ok(BootMode::Auto),
            "efi-shim" => Ok(BootMode::Shim),
            "efi-kernel" => Ok(BootMode::Kernel),
            _ => Err(BuilderError::BootMode(s.to_string())),
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootMode::Auto => "efi-auto",
            BootMode::Shim => "efi-shim",
            BootMode::Kernel => "efi-kernel",
        })
    }
}

/// The `root=soci:` argument for `boot_url`, followed by `extra`.
///
/// `docker://<host>/<name>` boots from `<host>` when `from_remote`, else from
/// the copy on the boot media (`repo=local`). `oci:<dir>:<name>` has no repo.
pub fn boot_cmdline(boot_url: &str, extra: &str, from_remote: bool) -> Result<String> {
    let bad = || BuilderError::BootUrl(boot_url.to_string());
    let (name, repo) = if let Some(rest) = boot_url.strip_prefix("docker://") {
        let (host, name) = rest.split_once('/').ok_or_else(bad)?;
        let repo = if from_remote { host } else { "local" };
        (name, Some(repo))
    } else if let Some(rest) = boot_url.strip_prefix("oci:") {
        let (_, name) = rest.split_once(':').ok_or_else(bad)?;
        (name, None)
    } else {
        return Err(bad());
    };
    if name.is_empty() {
        return Err(bad());
    }
    let mut cmdline = format!("root=soci:name={name},dev=LABEL={ISO_LABEL}");
    if let Some(repo) = repo {
        cmdline.push_str(",repo=");
        cmdline.push_str(repo);
    }
    if !extra.is_empty() {
        cmdline.push(' ');
        cmdline.push_str(extra);
    }
    Ok(cmdline)
}

/// `startup.nsh` running `loader` (with `kernel` as its argument when
/// booting through shim) from the ESP's `efi/boot`.
pub fn startup_nsh(loader: &str, kernel: Option<&str>, cmdline: &str) -> String {
    let target = match kernel {
        Some(kernel) => format!("{loader} {kernel}"),
        None => loader.to_string(),
    };
    format!("fs0:\ncd fs0:/efi/boot/\n{target} {cmdline}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn docker_urls() -> Result<()> {
        assert_eq!(
            boot_cmdline("docker://127.0.0.1:20001/machine/livecd:1.0.0", "console=ttyS0", false)?,
            "root=soci:name=machine/livecd:1.0.0,dev=LABEL=OCI-BOOT,repo=local console=ttyS0"
        );
        assert_eq!(
            boot_cmdline("docker://zothub.io/machine/livecd:1.0.0", "", true)?,
            "root=soci:name=machine/livecd:1.0.0,dev=LABEL=OCI-BOOT,repo=zothub.io"
        );
        Ok(())
    }

    #[test]
    fn oci_and_bad_urls() -> Result<()> {
        assert_eq!(
            boot_cmdline("oci:/srv/oci:machine/install:1.0", "quiet", true)?,
            "root=soci:name=machine/install:1.0,dev=LABEL=OCI-BOOT quiet"
        );
        for url in ["http://host/name", "docker://host", "oci:/srv/oci", "docker://host/"] {
            assert!(matches!(
                boot_cmdline(url, "", false),
                Err(BuilderError::BootUrl(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn startup_script() {
        assert_eq!(
            startup_nsh("shim.efi", Some("kernel.efi"), "root=x"),
            "fs0:\ncd fs0:/efi/boot/\nshim.efi kernel.efi root=x\n"
        );
        assert_eq!(
            startup_nsh("kernel.efi", None, "root=x"),
            "fs0:\ncd fs0:/efi/boot/\nkernel.efi root=x\n"
        );
    }

    #[test]
    fn boot_modes() -> Result<()> {
        for mode in [BootMode::Auto, BootMode::Shim, BootMode::Kernel] {
            assert_eq!(mode.to_string().parse::<BootMode>()?, mode);
        }
        assert!("bios".parse::<BootMode>().is_err());
        Ok(())
    }
}
