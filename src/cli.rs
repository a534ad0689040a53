use crate::builder::bootkit::{
    build_installer, build_provisioner, customize_bootkit, PristineBootkit, LAYER_VERSION,
};
use crate::builder::mirror::ZotServer;
use crate::builder::publish::publish_manifest;
use crate::builder::{BootMode, OciBoot};
use crate::crypto::authenticode::{sign_efi_file, verify_efi_file};
use crate::crypto::sign::{candidate_cas, sign_file, verify_manifest_with};
use crate::keyset::{self, Keyset, KeysetItem};
use crate::launch::{self, LaunchOptions, Provider, ARTIFACTS_DIR, INSTALL_ISO, PROVISION_ISO};
use crate::manifest::types::InstallFile;
use crate::manifest::{signature_path, InstallSource, Mos, MosOptions};
use crate::oci::DistRepo;
use crate::paths;
use crate::pcr7::byte_pair_swap_hex;
use crate::tpm::orchestrator::{self, Trust};
use crate::tpm::policy::{gen_luks_policy, gen_passwd_policy, PolicyVersion};
use clap::{Args, Parser, Subcommand};
use eyre::{eyre, Result};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const TPM_ENV_VAR: &str = "TCTI";
const TOOLS_TCTI_ENV_VAR: &str = "TPM2TOOLS_TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, global = true, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// `keyset:project`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub keyset: String,
    pub project: String,
}

impl FromStr for ProjectRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((keyset, project))
                if !keyset.is_empty() && !project.is_empty() && !project.contains(':') =>
            {
                Ok(Self {
                    keyset: keyset.to_string(),
                    project: project.to_string(),
                })
            }
            _ => Err(format!(
                "bad project {s:?}, expected keyset:project, e.g. snakeoil:default"
            )),
        }
    }
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.keyset, self.project)
    }
}

impl ProjectRef {
    fn open(&self) -> Result<Keyset> {
        let keyset = Keyset::open_default(&self.keyset)?;
        keyset.product_uuid(&self.project)?;
        Ok(keyset)
    }
}

/// `src:dest` for a file placed on boot media.
fn parse_insert(s: &str) -> Result<(PathBuf, String), String> {
    match s.split_once(':') {
        Some((src, dest)) if !src.is_empty() && !dest.is_empty() => {
            Ok((PathBuf::from(src), dest.to_string()))
        }
        _ => Err(format!("--insert {s:?} has no dest (src:dest)")),
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage keysets
    #[command(subcommand)]
    Keyset(KeysetCommand),
    /// Manage the projects of a keyset
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage machine identities of a project
    #[command(subcommand)]
    Sudi(SudiCommand),
    /// Take ownership of a blank TPM and store a machine identity in it
    Provision {
        /// Machine certificate
        cert: PathBuf,
        /// Machine private key
        key: PathBuf,
        /// Disk for the trust partitions, "any" to pick one
        #[arg(long)]
        disk: Option<String>,
        /// Wipe the chosen disk first
        #[arg(long)]
        wipe: bool,
    },
    /// Unlock the provisioned secrets during boot, then lock PCR7
    InitrdSetup,
    /// Rotate the OS passphrase ahead of an install, then lock PCR7
    Preinstall,
    /// Clear the TPM through the lockout hierarchy
    TpmClear,
    /// Print the policy version stored in the TPM
    ReadPolicyVersion,
    /// Extend PCR7 so no signed policy matches for the rest of this boot
    ExtendPcr7,
    /// Print the predicted PCR7 values of a keyset
    ComputePcr7 {
        keyset: String,
    },
    /// Write the TPM EA policy digests for a pair of PCR7 values
    TpmPolicyGen(PolicyGenArgs),
    /// Verify a signed install manifest
    VerifyManifest {
        manifest: PathBuf,
        signature: PathBuf,
        cert: PathBuf,
        /// Manifest CA, tried after the host's own
        #[arg(long)]
        ca: Option<PathBuf>,
    },
    /// Create digital signatures
    #[command(subcommand)]
    Sign(SignCommand),
    /// Check an EFI binary carries a signature from `cert`
    VerifyEfi {
        file: PathBuf,
        #[arg(long)]
        cert: PathBuf,
    },
    /// Build an ISO that provisions a machine's TPM
    BuildProvisioner {
        project: ProjectRef,
        out: PathBuf,
        #[arg(long, default_value = LAYER_VERSION)]
        layer_version: String,
    },
    /// Build an ISO that installs a signed manifest
    BuildInstaller {
        project: ProjectRef,
        out: PathBuf,
        /// docker:// url of the install manifest, the stock installer if unset
        #[arg(long)]
        install_url: Option<String>,
        #[arg(long, default_value = LAYER_VERSION)]
        layer_version: String,
    },
    /// Build a bootable image of an install manifest
    Mkboot(MkbootArgs),
    /// Sign an install manifest and publish it with its targets
    Publish {
        project: ProjectRef,
        /// Registry address, host:port
        repo: String,
        /// name:tag to publish under
        reference: String,
        manifest: PathBuf,
    },
    /// Create a VM, provision it and install it
    Launch(LaunchArgs),
    /// Install a signed manifest on a blank system
    Install(InstallArgs),
    /// Update the installed system from a signed manifest
    Update(InstallArgs),
}

#[derive(Subcommand, Debug)]
enum KeysetCommand {
    List,
    /// Create a keyset, and its bootkit and ISOs if given a pristine bootkit
    Add {
        name: String,
        /// Organization for the keyset's certificates
        #[arg(long = "org")]
        orgs: Vec<String>,
        /// Unpacked upstream bootkit
        #[arg(long)]
        bootkit_dir: Option<PathBuf>,
        /// mosctl to place in the UKI's initrd
        #[arg(long, env = "MOSCTL_PATH")]
        mosctl_path: Option<PathBuf>,
        #[arg(long, default_value = LAYER_VERSION)]
        layer_version: String,
    },
    /// Show a keyset, or one of its key directories, projects or SUDIs
    Show {
        keyset: String,
        /// e.g. uefi-db, project:default or sudi:default:<serial>
        item: Option<KeysetItem>,
    },
    /// Add pcr7data for PCR7 values measured elsewhere
    Pcr7data {
        keyset: String,
        #[arg(long)]
        pcr7_tpm: PathBuf,
        #[arg(long)]
        pcr7_limited: PathBuf,
        #[arg(long)]
        pcr7_prod: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    List { keyset: String },
    Add { keyset: String, project: String },
}

#[derive(Subcommand, Debug)]
enum SudiCommand {
    List {
        project: ProjectRef,
    },
    Add {
        project: ProjectRef,
        /// Machine serial, a random UUID if unset
        serial: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SignCommand {
    /// Detached RSA signature of a file
    File {
        file: PathBuf,
        #[arg(long)]
        key: PathBuf,
        /// Defaults to `<file>.signed`
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Authenticode signature of an EFI binary
    Efi {
        file: PathBuf,
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PolicyGenArgs {
    #[arg(long)]
    pcr7_tpm: PathBuf,
    #[arg(long)]
    pcr7_production: PathBuf,
    #[arg(long = "passwd-policy-file", default_value = "passwd_policy.out")]
    passwd_out: PathBuf,
    #[arg(long = "luks-policy-file", default_value = "luks_policy.out")]
    luks_out: PathBuf,
    #[arg(long, default_value = "0001")]
    policy_version: PolicyVersion,
}

#[derive(Args, Debug)]
struct MkbootArgs {
    project: ProjectRef,
    /// docker://<host>/<name>:<tag> or oci:<dir>:<name>:<tag>
    url: String,
    out: PathBuf,
    /// Boot from the registry rather than a copy on the media
    #[arg(long)]
    boot_from_remote: bool,
    /// Build an ISO rather than a disk image
    #[arg(long)]
    cdrom: bool,
    /// Extra kernel command line
    #[arg(long, default_value = "")]
    cmdline: String,
    /// efi-auto, efi-shim or efi-kernel
    #[arg(long, default_value = "efi-auto")]
    boot: BootMode,
    /// src:dest of a file to add to the media
    #[arg(long, value_parser = parse_insert)]
    insert: Vec<(PathBuf, String)>,
}

#[derive(Args, Debug)]
struct LaunchArgs {
    name: String,
    /// docker:// url of the manifest to install
    install_url: Option<String>,
    #[arg(long, env = "TRUST_PROJECT")]
    project: ProjectRef,
    /// Machine serial, a random UUID if unset
    #[arg(long, alias = "uuid")]
    serial: Option<String>,
    #[arg(long)]
    skip_provisioning: bool,
    #[arg(long)]
    skip_install: bool,
    /// Kind of machine to launch
    #[arg(long = "type", default_value = "kvm")]
    machine_type: String,
    /// Seconds to wait for each stage
    #[arg(long, default_value_t = launch::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// install.yaml path or docker:// url
    manifest: String,
    /// Root of the system to install into
    #[arg(long, short, default_value = "/")]
    root: PathBuf,
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        env::set_var(TOOLS_TCTI_ENV_VAR, &cli.tcti);
        cli
    }

    /// Default log filter when RUST_LOG is unset.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{self:?}");
        match &self.command {
            Commands::Keyset(cmd) => keyset_command(cmd)?,
            Commands::Project(cmd) => project_command(cmd)?,
            Commands::Sudi(cmd) => sudi_command(cmd)?,
            Commands::Provision {
                cert,
                key,
                disk,
                wipe,
            } => {
                if disk.is_none() {
                    log::warn!("no disk specified, no disk will be provisioned");
                }
                Trust::open()?.provision(cert, key, disk.as_deref(), *wipe)?
            }
            Commands::InitrdSetup => Trust::open()?.initrd_setup()?,
            Commands::Preinstall => Trust::open()?.preinstall()?,
            Commands::TpmClear => orchestrator::tpm_clear()?,
            Commands::ReadPolicyVersion => println!("{}", orchestrator::read_policy_version()?),
            Commands::ExtendPcr7 => orchestrator::lock_pcr7()?,
            Commands::ComputePcr7 { keyset } => {
                let values = Keyset::open_default(keyset)?.pcr7()?;
                println!("production: {}", hex::encode(values.production));
                println!("limited: {}", hex::encode(values.limited));
                println!("tpm: {}", hex::encode(values.tpm));
            }
            Commands::TpmPolicyGen(args) => policy_gen(args)?,
            Commands::VerifyManifest {
                manifest,
                signature,
                cert,
                ca,
            } => {
                let contents = paths::read(manifest)?;
                verify_manifest_with(&contents, signature, cert, &candidate_cas(ca.as_deref()))?;
                InstallFile::parse(&contents)?.validate()?;
                println!("{} verified", manifest.display());
            }
            Commands::Sign(SignCommand::File { file, key, output }) => {
                let output = output
                    .clone()
                    .unwrap_or_else(|| signature_path(file));
                sign_file(file, &output, key)?;
            }
            Commands::Sign(SignCommand::Efi {
                file,
                key,
                cert,
                output,
            }) => sign_efi_file(file, output, key, cert)?,
            Commands::VerifyEfi { file, cert } => {
                if !verify_efi_file(file, cert)? {
                    return Err(eyre!("{} is not signed by {}", file.display(), cert.display()));
                }
                println!("{} verified", file.display());
            }
            Commands::BuildProvisioner {
                project,
                out,
                layer_version,
            } => build_provisioner(&project.open()?, &project.project, out, layer_version)?,
            Commands::BuildInstaller {
                project,
                out,
                install_url,
                layer_version,
            } => build_installer(
                &project.open()?,
                &project.project,
                install_url.as_deref(),
                out,
                layer_version,
            )?,
            Commands::Mkboot(args) => mkboot(args)?,
            Commands::Publish {
                project,
                repo,
                reference,
                manifest,
            } => {
                let (name, tag) = reference
                    .rsplit_once(':')
                    .ok_or_else(|| eyre!("bad reference {reference:?}, expected name:tag"))?;
                let desc = publish_manifest(
                    &project.open()?,
                    &project.project,
                    &DistRepo::connect(repo)?,
                    name,
                    tag,
                    manifest,
                )?;
                println!("published {repo}/{name}:{tag} ({})", desc.digest);
            }
            Commands::Launch(args) => launch_command(args)?,
            Commands::Install(args) => {
                let mos = Mos::open(MosOptions::for_root(&args.root))?;
                let sys = mos.install(&InstallSource::open(&args.manifest)?)?;
                log::info!("installed {} targets", sys.sys_targets.len());
            }
            Commands::Update(args) => {
                let mos = Mos::open(MosOptions::for_root(&args.root))?;
                let sys = mos.update(&InstallSource::open(&args.manifest)?)?;
                log::info!("{} targets installed", sys.sys_targets.len());
            }
        };
        Ok(self)
    }
}

fn keyset_command(cmd: &KeysetCommand) -> Result<()> {
    match cmd {
        KeysetCommand::List => {
            for name in keyset::list_keysets(&paths::keys_dir()?)? {
                println!("{name}");
            }
        }
        KeysetCommand::Add {
            name,
            orgs,
            bootkit_dir,
            mosctl_path,
            layer_version,
        } => {
            let keyset = keyset::init_keyset(&paths::keys_dir()?, name, orgs)?;
            match bootkit_dir {
                Some(dir) => make_bootkit(&keyset, dir, mosctl_path.as_deref(), layer_version)?,
                None => log::warn!("no --bootkit-dir given, keyset {name} has no bootkit"),
            }
        }
        KeysetCommand::Show { keyset, item } => {
            print!("{}", Keyset::open_default(keyset)?.show(item.as_ref())?)
        }
        KeysetCommand::Pcr7data {
            keyset,
            pcr7_tpm,
            pcr7_limited,
            pcr7_prod,
        } => {
            let dir = Keyset::open_default(keyset)?
                .add_pcr7data_from_files(pcr7_tpm, pcr7_prod, pcr7_limited)?;
            println!("{}", dir.display());
        }
    }
    Ok(())
}

/// Customise the bootkit of a new keyset and build its default project's
/// provisioning and install ISOs.
fn make_bootkit(keyset: &Keyset, dir: &Path, mosctl: Option<&Path>, layer_version: &str) -> Result<()> {
    customize_bootkit(keyset, &PristineBootkit::open(dir)?, mosctl)?;
    let artifacts = keyset.path().join(ARTIFACTS_DIR);
    paths::create_dir_mode(&artifacts, 0o755)?;
    build_provisioner(
        keyset,
        keyset::DEFAULT_PROJECT,
        &artifacts.join(PROVISION_ISO),
        layer_version,
    )?;
    build_installer(
        keyset,
        keyset::DEFAULT_PROJECT,
        None,
        &artifacts.join(INSTALL_ISO),
        layer_version,
    )?;
    Ok(())
}

fn project_command(cmd: &ProjectCommand) -> Result<()> {
    match cmd {
        ProjectCommand::List { keyset } => {
            for project in Keyset::open_default(keyset)?.list_projects()? {
                println!("{project}");
            }
        }
        ProjectCommand::Add { keyset, project } => {
            let product = Keyset::open_default(keyset)?.add_project(project)?;
            println!("{product}");
        }
    }
    Ok(())
}

fn sudi_command(cmd: &SudiCommand) -> Result<()> {
    match cmd {
        SudiCommand::List { project } => {
            for serial in project.open()?.list_sudi(&project.project)? {
                println!("{serial}");
            }
        }
        SudiCommand::Add { project, serial } => {
            let dir = project.open()?.new_sudi(&project.project, serial.as_deref())?;
            println!("{}", dir.display());
        }
    }
    Ok(())
}

fn policy_gen(args: &PolicyGenArgs) -> Result<()> {
    let passwd = gen_passwd_policy(&paths::read(&args.pcr7_tpm)?)?;
    let luks = gen_luks_policy(
        &paths::read(&args.pcr7_production)?,
        &args.policy_version.to_string(),
    )?;
    paths::write_mode(&args.passwd_out, &passwd, 0o644)?;
    paths::write_mode(&args.luks_out, &luks, 0o644)?;
    log::info!(
        "passwd policy {} luks policy {}",
        byte_pair_swap_hex(&passwd),
        byte_pair_swap_hex(&luks)
    );
    Ok(())
}

fn mkboot(args: &MkbootArgs) -> Result<()> {
    let keyset = args.project.open()?;
    let work = tempfile::tempdir()?;
    let cache = work.path().join("cache");
    let zot = ZotServer::start(work.path(), &cache)?;

    let mut boot = OciBoot::new(keyset, &args.project.project, &args.url, &args.out);
    boot.boot_mode = args.boot;
    boot.cdrom = args.cdrom;
    boot.cmdline = args.cmdline.clone();
    boot.boot_from_remote = args.boot_from_remote;
    boot.files = args.insert.iter().cloned().collect();
    boot.mirror = Some(zot.addr());
    boot.repo_dir = Some(zot.storage().to_path_buf());
    boot.build()?;
    println!("wrote {}", args.out.display());
    Ok(())
}

fn launch_command(args: &LaunchArgs) -> Result<()> {
    let install_url = match (&args.install_url, args.skip_install) {
        (_, true) => None,
        (Some(url), false) => Some(url.clone()),
        (None, false) => return Err(eyre!("an install manifest url is required without --skip-install")),
    };
    let keyset = args.project.open()?;
    let provider = Provider::by_type(&args.machine_type)?;
    launch::launch(
        &provider,
        &keyset,
        &LaunchOptions {
            name: args.name.clone(),
            project: args.project.project.clone(),
            serial: args.serial.clone(),
            skip_provisioning: args.skip_provisioning,
            install_url,
            timeout: Duration::from_secs(args.timeout),
        },
    )?;
    println!("machine {} launched", args.name);
    Ok(())
}
