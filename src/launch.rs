//! Launching a VM that provisions itself from the keyset's provisioning ISO
//! and then installs from its install ISO.
use crate::keyset::{Keyset, KeysetError};
use crate::paths::{self, IoContext, PathError};
use crate::run::{self, RunError};
use ambassador::{delegatable_trait, Delegate};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const PROVISIONED: &str = "provisioned successfully";
pub const INSTALLED: &str = "installed successfully";
const FAILURE_MARKERS: [&str; 2] = ["ERROR", "XXX FAIL XXX"];

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const PROVISION_ISO: &str = "provision.iso";
pub const INSTALL_ISO: &str = "install.iso";
pub const SUDI_DISK: &str = "sudi.vfat";
pub const INSTALL_DISK: &str = "install.vfat";
const DATA_DISK_SIZE: u64 = 20 << 20;
const ROOT_DISK_SIZE: &str = "600G";

const STATE_ATTEMPTS: u32 = 5;
const STATE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("unknown machine type {0:?}")]
    Provider(String),
    #[error("machine {0:?} already exists")]
    Exists(String),
    #[error("{tool} failed: {source}")]
    Tool {
        tool: &'static str,
        source: RunError,
    },
    #[error("machine {name:?} did not reach {state:?}")]
    State { name: String, state: &'static str },
    #[error("console reported failure: {0}")]
    BadToken(String),
    #[error("timed out waiting for {0:?} on the console")]
    Timeout(String),
    #[error("console closed before {0:?} was seen")]
    ConsoleClosed(String),
    #[error("{path}: {source}")]
    Console {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot locate the home directory")]
    NoHome,
    #[error(transparent)]
    Keyset(#[from] KeysetError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LaunchError> = core::result::Result<T, E>;

fn tool(tool: &'static str) -> impl FnOnce(RunError) -> LaunchError {
    move |source| LaunchError::Tool { tool, source }
}

/// What the console has shown so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleState {
    Pending,
    Succeeded,
    Failed(String),
}

/// Scan console output for `good`, or a line carrying a failure marker.
pub fn scan_console(text: &str, good: &str) -> ConsoleState {
    if text.contains(good) {
        return ConsoleState::Succeeded;
    }
    text.lines()
        .find(|l| FAILURE_MARKERS.iter().any(|m| l.contains(m)))
        .map(|l| ConsoleState::Failed(l.trim().to_string()))
        .unwrap_or(ConsoleState::Pending)
}

/// Read `console` until `good` appears, a failure line appears, the stream
/// ends or `timeout` passes.
pub fn follow_console<R: Read>(console: &mut R, good: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match console.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if Instant::now() >= deadline {
                    return Err(LaunchError::Timeout(good.to_string()));
                }
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        seen.extend_from_slice(&buf[..n]);
        match scan_console(&String::from_utf8_lossy(&seen), good) {
            ConsoleState::Succeeded => return Ok(()),
            ConsoleState::Failed(line) => return Err(LaunchError::BadToken(line)),
            ConsoleState::Pending if n == 0 => return Err(LaunchError::ConsoleClosed(good.to_string())),
            ConsoleState::Pending if Instant::now() >= deadline => {
                return Err(LaunchError::Timeout(good.to_string()))
            }
            ConsoleState::Pending => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub file: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Disk {
    fn root(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: "ssd".into(),
            size: Some("120G".into()),
            format: None,
        }
    }

    fn data(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: "hdd".into(),
            size: None,
            format: Some("raw".into()),
        }
    }
}

/// One stage of a machine's life: what it boots and which disks it sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MachineConfig {
    pub name: String,
    pub uefi: bool,
    pub uefi_code: PathBuf,
    pub uefi_vars: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<PathBuf>,
    pub boot: String,
    pub tpm: bool,
    pub tpm_version: String,
    pub secure_boot: bool,
    pub serial: bool,
    pub gui: bool,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Serialize)]
struct MachineDefinition<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    ephemeral: bool,
    description: &'a str,
    config: &'a MachineConfig,
}

/// A VM manager able to run a machine through its stages.
#[delegatable_trait]
pub trait VmProvider {
    fn exists(&self, name: &str) -> bool;

    fn create(&self, config: &MachineConfig) -> Result<()>;

    fn start(&self, name: &str) -> Result<()>;

    /// Wait until the machine reports `state`.
    fn wait_state(&self, name: &str, state: &'static str) -> Result<()>;

    /// The machine's serial console.
    fn console_log(&self, name: &str) -> Result<Box<dyn Read>>;

    fn delete(&self, name: &str) -> Result<()>;
}

pub const RUNNING: &str = "running";
pub const STOPPED: &str = "stopped";

/// Machines managed by `machined` through the `machine` client.
#[derive(Debug, Clone, Default)]
pub struct KvmProvider;

impl KvmProvider {
    /// Check that `machined` answers.
    pub fn new() -> Result<Self> {
        run::run(&mut run::cmd("machine", ["list"])).map_err(tool("machine"))?;
        Ok(Self)
    }

    fn state_home() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
            return Ok(PathBuf::from(dir));
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/state"))
            .ok_or(LaunchError::NoHome)
    }

    fn console_socket(name: &str) -> Result<PathBuf> {
        Ok(Self::state_home()?
            .join("machine/machines")
            .join(name)
            .join(name)
            .join("sockets/console.sock"))
    }
}

impl VmProvider for KvmProvider {
    fn exists(&self, name: &str) -> bool {
        run::run(&mut run::cmd("machine", ["info", name])).is_ok()
    }

    fn create(&self, config: &MachineConfig) -> Result<()> {
        let definition = MachineDefinition {
            name: &config.name,
            kind: "kvm",
            ephemeral: false,
            description: "A machine booting in Secure Boot mode with a TPM",
            config,
        };
        let yaml = serde_yaml::to_string(&definition)
            .map_err(|e| LaunchError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        run::run_with_stdin(&mut run::cmd("machine", ["init", config.name.as_str()]), yaml.as_bytes())
            .map_err(tool("machine"))?;
        log::debug!("defined machine {}", config.name);
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        run::run(&mut run::cmd("machine", ["start", name])).map_err(tool("machine"))
    }

    fn wait_state(&self, name: &str, state: &'static str) -> Result<()> {
        let wanted = format!("status: {state}");
        for _ in 0..STATE_ATTEMPTS {
            let info = run::capture(&mut run::cmd("machine", ["info", name]), None);
            if matches!(info, Ok(out) if String::from_utf8_lossy(&out).contains(&wanted)) {
                return Ok(());
            }
            std::thread::sleep(STATE_INTERVAL);
        }
        Err(LaunchError::State {
            name: name.to_string(),
            state,
        })
    }

    fn console_log(&self, name: &str) -> Result<Box<dyn Read>> {
        let path = Self::console_socket(name)?;
        let stream = UnixStream::connect(&path).map_err(|source| LaunchError::Console {
            path: path.clone(),
            source,
        })?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .map_err(|source| LaunchError::Console { path, source })?;
        Ok(Box::new(stream))
    }

    fn delete(&self, name: &str) -> Result<()> {
        run::run(&mut run::cmd("machine", ["delete", name])).map_err(tool("machine"))
    }
}

#[derive(Delegate)]
#[delegate(VmProvider)]
pub enum Provider {
    Kvm(KvmProvider),
}

impl Provider {
    pub fn by_type(kind: &str) -> Result<Self> {
        match kind {
            "kvm" => Ok(Provider::Kvm(KvmProvider::new()?)),
            _ => Err(LaunchError::Provider(kind.to_string())),
        }
    }
}

/// A 20 MiB vfat image labelled `label` holding `files` (source, name).
pub fn make_vfat(image: &Path, label: &str, files: &[(&Path, &str)]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(image)
        .at(image)?;
    file.set_len(DATA_DISK_SIZE).at(image)?;
    drop(file);
    let mut mkfs = run::cmd("mkfs.vfat", ["-n", label]);
    run::run(mkfs.arg(image)).map_err(tool("mkfs.vfat"))?;
    for (src, name) in files {
        let mut mcopy = run::cmd("mcopy", ["-i"]);
        mcopy
            .arg(image)
            .arg(src)
            .arg(format!("::{name}"))
            .env("MTOOLS_SKIP_CHECK", "1");
        run::run(&mut mcopy).map_err(tool("mcopy"))?;
    }
    Ok(())
}

/// The SUDI disk: the machine's identity certificate and key.
pub fn make_sudi_disk(sudi_dir: &Path) -> Result<PathBuf> {
    let disk = sudi_dir.join(SUDI_DISK);
    make_vfat(
        &disk,
        "trust-data",
        &[
            (sudi_dir.join("cert.pem").as_path(), "cert.pem"),
            (sudi_dir.join("privkey.pem").as_path(), "privkey.pem"),
        ],
    )?;
    Ok(disk)
}

/// The install disk: the url of the manifest to install.
pub fn make_install_disk(sudi_dir: &Path, url: &str) -> Result<PathBuf> {
    let disk = sudi_dir.join(INSTALL_DISK);
    let scratch = tempfile::tempdir()?;
    let url_file = scratch.path().join("url.txt");
    paths::write_mode(&url_file, url.as_bytes(), 0o644)?;
    make_vfat(&disk, "inst-data", &[(url_file.as_path(), "url.txt")])?;
    Ok(disk)
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub name: String,
    pub project: String,
    /// Machine serial, a random UUID if unset.
    pub serial: Option<String>,
    pub skip_provisioning: bool,
    /// Manifest to install after provisioning, no install when unset.
    pub install_url: Option<String>,
    pub timeout: Duration,
}

/// The machine configs for each stage of a launch.
#[derive(Debug, Clone)]
pub struct Stages {
    pub provision: MachineConfig,
    pub install: MachineConfig,
    pub boot: MachineConfig,
}

pub fn stages(keyset: &Keyset, name: &str, root_disk: &Path, sudi_dir: &Path) -> Stages {
    let artifacts = keyset.path().join(ARTIFACTS_DIR);
    let base = MachineConfig {
        name: name.to_string(),
        uefi: true,
        uefi_code: keyset.bootkit().join("ovmf-code.fd"),
        uefi_vars: keyset.bootkit().join("ovmf-vars.fd"),
        cdrom: None,
        boot: "hdd".into(),
        tpm: true,
        tpm_version: "2.0".into(),
        secure_boot: true,
        serial: true,
        gui: false,
        disks: vec![Disk::root(root_disk)],
    };
    let from_cdrom = |iso: &str, disk: &str| {
        let mut config = base.clone();
        config.cdrom = Some(artifacts.join(iso));
        config.boot = "cdrom".into();
        config.disks.push(Disk::data(&sudi_dir.join(disk)));
        config
    };
    Stages {
        provision: from_cdrom(PROVISION_ISO, SUDI_DISK),
        install: from_cdrom(INSTALL_ISO, INSTALL_DISK),
        boot: base.clone(),
    }
}

fn run_stage(provider: &Provider, config: &MachineConfig, good: &str, timeout: Duration) -> Result<()> {
    provider.create(config)?;
    provider.start(&config.name)?;
    provider.wait_state(&config.name, RUNNING)?;
    follow_console(&mut provider.console_log(&config.name)?, good, timeout)?;
    log::info!("{}: {good}", config.name);
    provider.wait_state(&config.name, STOPPED)
}

fn run_stages(provider: &Provider, stages: &Stages, opts: &LaunchOptions) -> Result<()> {
    if opts.skip_provisioning {
        log::info!("skipping provisioning");
    } else {
        run_stage(provider, &stages.provision, PROVISIONED, opts.timeout)?;
        provider.delete(&opts.name)?;
    }
    if opts.install_url.is_none() {
        log::info!("skipping install");
        return provider.create(&stages.boot);
    }
    run_stage(provider, &stages.install, INSTALLED, opts.timeout)?;
    provider.delete(&opts.name)?;
    provider.create(&stages.boot)
}

/// Issue a SUDI for a new machine, then provision it and, given an install
/// url, install it. A failed launch leaves no machine and no SUDI behind.
pub fn launch(provider: &Provider, keyset: &Keyset, opts: &LaunchOptions) -> Result<()> {
    if provider.exists(&opts.name) {
        return Err(LaunchError::Exists(opts.name.clone()));
    }
    let sudi_dir = keyset.new_sudi(&opts.project, opts.serial.as_deref())?;
    let machine_dir = keyset.path().join("machines").join(&opts.name);
    let result = (|| -> Result<()> {
        make_sudi_disk(&sudi_dir)?;
        if let Some(url) = &opts.install_url {
            make_install_disk(&sudi_dir, url)?;
        }
        paths::create_dir_mode(&machine_dir, 0o755)?;
        let root = machine_dir.join(format!("{}.qcow2", opts.name));
        let mut qemu_img = run::cmd("qemu-img", ["create", "-f", "qcow2"]);
        run::run(qemu_img.arg(&root).arg(ROOT_DISK_SIZE)).map_err(tool("qemu-img"))?;
        run_stages(provider, &stages(keyset, &opts.name, &root, &sudi_dir), opts)
    })();
    if let Err(e) = &result {
        log::warn!("launch of {} failed: {e}", opts.name);
        if provider.exists(&opts.name) {
            let _ = provider.delete(&opts.name);
        }
        let _ = std::fs::remove_dir_all(&sudi_dir);
        let _ = std::fs::remove_dir_all(&machine_dir);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Cursor;

    #[test]
    fn console_tokens() {
        assert_eq!(
            scan_console("booting\nprovisioned successfully\n", PROVISIONED),
            ConsoleState::Succeeded
        );
        assert_eq!(
            scan_console("booting\nmosctl: ERROR: tpm is not empty\n", PROVISIONED),
            ConsoleState::Failed("mosctl: ERROR: tpm is not empty".into())
        );
        assert_eq!(scan_console("booting\n", INSTALLED), ConsoleState::Pending);
        assert_eq!(
            scan_console("provisioned successfully", INSTALLED),
            ConsoleState::Pending
        );
    }

    #[test]
    fn follow_until_token() -> Result<()> {
        let mut console = Cursor::new(b"starting\r\ninstalled successfully\r\n".to_vec());
        follow_console(&mut console, INSTALLED, Duration::from_secs(1))?;

        let mut console = Cursor::new(b"XXX FAIL XXX\n".to_vec());
        assert!(matches!(
            follow_console(&mut console, INSTALLED, Duration::from_secs(1)),
            Err(LaunchError::BadToken(_))
        ));

        let mut console = Cursor::new(b"starting\n".to_vec());
        assert!(matches!(
            follow_console(&mut console, INSTALLED, Duration::from_secs(1)),
            Err(LaunchError::ConsoleClosed(_))
        ));
        Ok(())
    }

    /// A console that never produces output.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(10));
            Err(ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn follow_times_out() {
        assert!(matches!(
            follow_console(&mut Silent, PROVISIONED, Duration::from_millis(50)),
            Err(LaunchError::Timeout(_))
        ));
    }

    #[test]
    fn stage_configs() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::create_dir(tmp.path().join("snakeoil"))?;
        let keyset = Keyset::open(tmp.path(), "snakeoil")?;
        let sudi = tmp.path().join("sudi");
        let stages = stages(&keyset, "m1", Path::new("/vm/m1.qcow2"), &sudi);

        assert_eq!(stages.provision.boot, "cdrom");
        assert_eq!(
            stages.provision.cdrom,
            Some(keyset.path().join("artifacts/provision.iso"))
        );
        assert_eq!(stages.provision.disks[1].file, sudi.join(SUDI_DISK));
        assert_eq!(stages.install.disks[1].file, sudi.join(INSTALL_DISK));
        assert_eq!(stages.boot.boot, "hdd");
        assert_eq!(stages.boot.cdrom, None);
        assert_eq!(stages.boot.disks.len(), 1);

        let yaml = serde_yaml::to_string(&stages.provision)?;
        assert!(yaml.contains("secure-boot: true"));
        assert!(yaml.contains("uefi-vars:"));
        assert!(yaml.contains("format: raw"));
        Ok(())
    }
}
