//! Policy sessions driven through the `tpm2_*` tools.
//!
//! A [`Session`] moves through the policy commands in order. The session is
//! flushed from the TPM when it is dropped, whichever state it reached.
use super::nv::NvIndex;
use super::pcr::PCR7_SELECTION;
use crate::paths::{self, PathError};
use crate::run::{self, RunError};
use ambassador::{delegatable_trait, Delegate};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: RunError,
    },
    #[error("tpm returned {got} bytes reading {index}, expected {expected}")]
    ShortRead {
        index: NvIndex,
        got: usize,
        expected: usize,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ToolError> = core::result::Result<T, E>;

fn tool(step: &'static str, args: &[String], input: Option<&[u8]>) -> Result<Vec<u8>> {
    run::capture(&mut run::cmd(step, args), input).map_err(|source| ToolError::Step { step, source })
}

fn arg(flag: &str, path: &Path) -> String {
    format!("{flag}={}", path.display())
}

/// Scratch files of one tpm2 tools session.
#[delegatable_trait]
pub trait SessionFiles {
    fn dir(&self) -> &Path;

    fn session_file(&self) -> PathBuf {
        self.dir().join("session.ctx")
    }

    fn policy_file(&self) -> PathBuf {
        self.dir().join("policy.digest")
    }
}

pub struct Scratch {
    dir: TempDir,
    started: bool,
}

impl SessionFiles for Scratch {
    fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.started {
            let session = self.session_file();
            if let Err(e) = tool("tpm2_flushcontext", &[session.display().to_string()], None) {
                log::warn!("failed to flush tpm session: {e}");
            }
        }
    }
}

/// A public key loaded with `tpm2_loadexternal`.
pub struct ExternalKey {
    _dir: TempDir,
    context: PathBuf,
    name: PathBuf,
}

impl ExternalKey {
    pub fn load(pubkey: &Path) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let context = dir.path().join("pubkey.ctx");
        let name = dir.path().join("pubkey.name");
        tool(
            "tpm2_loadexternal",
            &[
                "--hierarchy=o".to_string(),
                "--key-algorithm=rsa".to_string(),
                arg("--public", pubkey),
                arg("--key-context", &context),
                arg("--name", &name),
            ],
            None,
        )?;
        log::debug!("loaded {} into the tpm", pubkey.display());
        Ok(Self {
            _dir: dir,
            context,
            name,
        })
    }
}

/// A primary key in the null hierarchy, used to salt real policy sessions.
pub struct Primary {
    _dir: TempDir,
    context: PathBuf,
}

impl Primary {
    pub fn create() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let context = dir.path().join("primary.ctx");
        tool(
            "tpm2_createprimary",
            &[arg("--key-context", &context), "--hierarchy=n".to_string()],
            None,
        )?;
        Ok(Self { _dir: dir, context })
    }
}

pub trait SessionState {}
pub struct Started;
pub struct PcrBound;
pub struct Versioned;
pub struct Authorized;
impl SessionState for Started {}
impl SessionState for PcrBound {}
impl SessionState for Versioned {}
impl SessionState for Authorized {}

/// States from which a policy can be authorized by a signature.
pub trait Authorizable: SessionState {}
impl Authorizable for PcrBound {}
impl Authorizable for Versioned {}

#[derive(Delegate)]
#[delegate(SessionFiles, target = "scratch")]
pub struct Session<S: SessionState> {
    scratch: Scratch,
    state: S,
}

impl<S: SessionState> Session<S> {
    fn advance<T: SessionState>(self, state: T) -> Session<T> {
        Session {
            scratch: self.scratch,
            state,
        }
    }

    fn session_arg(&self) -> String {
        arg("--session", &self.session_file())
    }

    /// The policy digest reached so far.
    pub fn digest(&self) -> Result<Vec<u8>> {
        Ok(paths::read(&self.policy_file())?)
    }
}

impl Session<Started> {
    fn start(extra: &[String]) -> Result<Self> {
        let mut scratch = Scratch {
            dir: tempfile::tempdir()?,
            started: false,
        };
        let mut args = vec![arg("--session", &scratch.session_file())];
        args.extend_from_slice(extra);
        tool("tpm2_startauthsession", &args, None)?;
        scratch.started = true;
        Ok(Self {
            scratch,
            state: Started,
        })
    }

    pub fn trial() -> Result<Self> {
        Self::start(&[])
    }

    pub fn policy(primary: &Primary) -> Result<Self> {
        Self::start(&[
            arg("--key-context", &primary.context),
            "--policy-session".to_string(),
        ])
    }

    /// The digest that lets any policy signed by `key` satisfy an index.
    pub fn authorize_trial(self, key: &ExternalKey) -> Result<Vec<u8>> {
        tool(
            "tpm2_policyauthorize",
            &[
                self.session_arg(),
                arg("--name", &key.name),
                arg("--policy", &self.policy_file()),
            ],
            None,
        )?;
        self.digest()
    }

    pub fn policy_pcr(self) -> Result<Session<PcrBound>> {
        tool(
            "tpm2_policypcr",
            &[
                self.session_arg(),
                format!("--pcr-list={PCR7_SELECTION}"),
                arg("--policy", &self.policy_file()),
            ],
            None,
        )?;
        Ok(self.advance(PcrBound))
    }
}

impl Session<PcrBound> {
    /// ea-version must equal `version`.
    pub fn policy_nv(self, version: &str) -> Result<Session<Versioned>> {
        tool(
            "tpm2_policynv",
            &[
                self.session_arg(),
                "--input=-".to_string(),
                NvIndex::EaVersion.to_string(),
                "eq".to_string(),
                arg("--policy", &self.policy_file()),
            ],
            Some(version.as_bytes()),
        )?;
        Ok(self.advance(Versioned))
    }
}

impl<S: Authorizable> Session<S> {
    /// Authorize the current policy with `signature` made by `key` over it.
    pub fn authorize(self, key: &ExternalKey, signature: &Path) -> Result<Session<Authorized>> {
        let ticket = self.dir().join("verification.tkt");
        tool(
            "tpm2_verifysignature",
            &[
                "-c".to_string(),
                key.context.display().to_string(),
                "-f".to_string(),
                "rsassa".to_string(),
                "-g".to_string(),
                "sha256".to_string(),
                "-m".to_string(),
                self.policy_file().display().to_string(),
                "-s".to_string(),
                signature.display().to_string(),
                "-t".to_string(),
                ticket.display().to_string(),
            ],
            None,
        )?;
        tool(
            "tpm2_policyauthorize",
            &[
                self.session_arg(),
                arg("--input", &self.policy_file()),
                arg("--name", &key.name),
                arg("--ticket", &ticket),
            ],
            None,
        )?;
        Ok(self.advance(Authorized))
    }
}

impl Session<Authorized> {
    fn auth_arg(&self) -> String {
        format!("--auth=session:{}", self.session_file().display())
    }

    pub fn nv_read(self, index: NvIndex, size: usize, offset: usize) -> Result<Vec<u8>> {
        let data = tool(
            "tpm2_nvread",
            &[
                self.auth_arg(),
                format!("--size={size}"),
                format!("--offset={offset}"),
                index.to_string(),
            ],
            None,
        )?;
        if data.len() != size {
            return Err(ToolError::ShortRead {
                index,
                got: data.len(),
                expected: size,
            });
        }
        Ok(data)
    }

    pub fn nv_write(self, index: NvIndex, data: &[u8]) -> Result<()> {
        tool(
            "tpm2_nvwrite",
            &[self.auth_arg(), "--input=-".to_string(), index.to_string()],
            Some(data),
        )?;
        Ok(())
    }
}

/// Owner hierarchy operations, authorized by the admin password.
pub struct Owner<'a> {
    password: &'a str,
}

impl<'a> Owner<'a> {
    pub fn new(password: &'a str) -> Self {
        Self { password }
    }

    pub fn nv_define(&self, index: NvIndex, size: usize, policy: Option<&[u8]>) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut args = vec![
            format!("--attributes={}", index.attributes()),
            format!("--hierarchy-auth={}", self.password),
        ];
        if let Some(policy) = policy {
            let file = dir.path().join("policy.digest");
            paths::write_mode(&file, policy, 0o600)?;
            args.push(arg("--policy", &file));
        }
        args.push(format!("--size={size}"));
        args.push(index.to_string());
        tool("tpm2_nvdefine", &args, None)?;
        log::debug!("defined {index} ({size} bytes)");
        Ok(())
    }

    pub fn nv_write(&self, index: NvIndex, data: &[u8]) -> Result<()> {
        tool(
            "tpm2_nvwrite",
            &[
                "--hierarchy=o".to_string(),
                format!("--auth={}", self.password),
                "--input=-".to_string(),
                index.to_string(),
            ],
            Some(data),
        )?;
        Ok(())
    }
}

/// Read an index whose own (empty) auth allows reading.
pub fn nv_read_public(index: NvIndex, size: usize) -> Result<Vec<u8>> {
    let data = tool(
        "tpm2_nvread",
        &[format!("--size={size}"), index.to_string()],
        None,
    )?;
    if data.len() != size {
        return Err(ToolError::ShortRead {
            index,
            got: data.len(),
            expected: size,
        });
    }
    Ok(data)
}

/// No more tries limit and a two minute lockout recovery.
pub fn setup_dictionary_lockout() -> Result<()> {
    tool(
        "tpm2_dictionarylockout",
        &[
            "--setup-parameters".to_string(),
            "--lockout-recovery-time=120".to_string(),
            format!("--max-tries={}", u32::MAX),
            "--clear-lockout".to_string(),
        ],
        None,
    )?;
    Ok(())
}
