use self::nv::NvIndex;
use self::pcr::{first_handle, pcr7_selection, PcrError};
use self::policy::PolicyError;
use self::tools::ToolError;
use crate::disk::DiskError;
use crate::hwrng::HwrngError;
use crate::paths::PathError;
use crate::run::RunError;
use once_cell::sync::OnceCell;
use sha2::{Digest as _, Sha256};
use std::ops::DerefMut;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::constants::{CapabilityType, StartupType};
use tss_esapi::handles::{AuthHandle, ObjectHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{Auth, CapabilityData, Digest, DigestValues};

pub mod nv;
pub mod orchestrator;
pub mod pcr;
pub mod policy;
pub mod tools;

/// Extended into PCR7 once the secrets are out, so no signed policy matches again.
pub const LOCK_MEASUREMENT: &[u8] = b"atomix\n";

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("failed to open TPM context: {0}")]
    Context(#[source] tss_esapi::Error),
    #[error("TPM context lock poisoned")]
    Poisoned,
    #[error("TPM did not report {0:?}")]
    Property(PropertyTag),
    #[error("PCR read returned no sha256:7 digest")]
    NoPcrDigest,
    #[error("failed to update keyring: {0}")]
    Keyring(#[source] RunError),
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
    #[error(transparent)]
    PcrSelection(#[from] PcrError),
    #[error(transparent)]
    SignData(#[from] crate::pcr7::PcrError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Tools(#[from] ToolError),
    #[error(transparent)]
    Hwrng(#[from] HwrngError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

pub type Context = MutexGuard<'static, tss_esapi::Context>;
pub trait TContext: DerefMut<Target = tss_esapi::Context> {}
impl TContext for Context {}

pub struct Ctx<C: TContext, S: ContextState> {
    ctx: C,
    state: S,
}

pub trait ContextState {}
pub struct Initial;
/// Lockout hierarchy auth has been set on the context.
pub struct Lockout {
    with_password: bool,
}
impl ContextState for Initial {}
impl ContextState for Lockout {}

pub type InitialContext = Ctx<Context, Initial>;
pub type LockoutContext = Ctx<Context, Lockout>;

impl<C: TContext, S: ContextState> Ctx<C, S> {
    fn flush_transient(&mut self) -> Result<()> {
        let (capabilities, _) = self.ctx.get_capability(CapabilityType::Handles, 0, 80)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                self.ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }
}

impl InitialContext {
    /// The current sha256 PCR7 value.
    pub fn pcr7(&mut self) -> Result<Vec<u8>> {
        let selection = pcr7_selection()?;
        let (_update_counter, _selection, digests) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(selection))?;
        digests
            .value()
            .first()
            .map(|d| d.value().to_vec())
            .ok_or(TpmError::NoPcrDigest)
    }

    /// Extend PCR7 with the lock measurement.
    pub fn extend_pcr7(&mut self) -> Result<()> {
        let handle = first_handle(&pcr7_selection()?)?;
        let mut vals = DigestValues::new();
        vals.set(
            HashingAlgorithm::Sha256,
            Digest::try_from(Sha256::digest(LOCK_MEASUREMENT).to_vec())?,
        );
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.pcr_extend(handle, vals)
            })?;
        log::info!("extended PCR 7");
        Ok(())
    }

    /// The defined size of `index`.
    pub fn nv_size(&mut self, index: NvIndex) -> Result<usize> {
        let tpm_handle = TpmHandle::NvIndex(index.handle()?);
        let mut handle = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(tpm_handle))?;
        let read = self
            .ctx
            .execute_without_session(|ctx| ctx.nv_read_public(handle.into()));
        self.ctx.tr_close(&mut handle)?;
        let (public, _name) = read?;
        Ok(public.data_size())
    }

    /// Largest chunk a single NV read may return.
    pub fn nv_buffer_max(&mut self) -> Result<usize> {
        self.ctx
            .get_tpm_property(PropertyTag::NvBufferMax)?
            .map(|v| v as usize)
            .ok_or(TpmError::Property(PropertyTag::NvBufferMax))
    }

    /// Clear through the platform hierarchy, which firmware usually still
    /// leaves open with an empty auth.
    pub fn clear_platform(&mut self) -> Result<()> {
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear(AuthHandle::Platform)
            })?;
        Ok(())
    }

    /// Set the owner, endorsement and lockout auth to `password`.
    pub fn change_hierarchy_auth(&mut self, password: &str) -> Result<()> {
        for hierarchy in [AuthHandle::Owner, AuthHandle::Endorsement, AuthHandle::Lockout] {
            let auth = Auth::try_from(password.as_bytes().to_vec())?;
            self.ctx
                .execute_with_session(Some(AuthSession::Password), |ctx| {
                    ctx.hierarchy_change_auth(hierarchy, auth)
                })?;
        }
        log::debug!("changed hierarchy auth");
        Ok(())
    }

    pub fn lockout(mut self, password: Option<&str>) -> Result<LockoutContext> {
        let auth = Auth::try_from(password.unwrap_or_default().as_bytes().to_vec())?;
        self.ctx.tr_set_auth(ObjectHandle::Lockout, auth)?;
        Ok(LockoutContext {
            ctx: self.ctx,
            state: Lockout {
                with_password: password.is_some(),
            },
        })
    }
}

impl LockoutContext {
    pub fn clear(mut self) -> Result<()> {
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear(AuthHandle::Lockout)
            })?;
        log::info!(
            "cleared TPM through lockout hierarchy ({} auth)",
            if self.state.with_password {
                "admin"
            } else {
                "empty"
            }
        );
        Ok(())
    }
}

static CONTEXT: OnceCell<Mutex<tss_esapi::Context>> = OnceCell::new();

pub fn get_context() -> Result<InitialContext> {
    let context = CONTEXT.get_or_try_init(|| {
        use tss_esapi::tcti_ldr::TctiNameConf;

        let conf = TctiNameConf::from_environment_variable().map_err(TpmError::Context)?;
        log::debug!("TCTI config {:?}", conf);
        tss_esapi::Context::new(conf)
            .map(Mutex::new)
            .map_err(TpmError::Context)
    })?;
    let mut ctx = context.lock().map_err(|_| TpmError::Poisoned)?;
    // fails harmlessly on a TPM firmware already started
    if let Err(e) = ctx.startup(StartupType::Clear) {
        log::debug!("TPM startup: {e}");
    }
    let mut ctx = Ctx {
        ctx,
        state: Initial {},
    };
    ctx.flush_transient()?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use sha2::Digest as _;

    #[test]
    fn lock_measurement_digest() {
        assert_eq!(
            hex::encode(Sha256::digest(LOCK_MEASUREMENT)),
            "b7135cbb321a66fa848b07288bd008b89bd5b7496c4569c5e1a4efd5f7c8e0a7"
        );
    }

    #[test]
    #[ignore = "needs a TPM"]
    fn pcr7_is_32_bytes() -> Result<()> {
        assert_eq!(get_context()?.pcr7()?.len(), 32);
        Ok(())
    }

    #[test]
    #[ignore = "needs a TPM"]
    fn extend_changes_pcr7() -> Result<()> {
        let mut ctx = get_context()?;
        let before = ctx.pcr7()?;
        ctx.extend_pcr7()?;
        let after = ctx.pcr7()?;
        let mut hasher = Sha256::new();
        hasher.update(&before);
        hasher.update(Sha256::digest(LOCK_MEASUREMENT));
        assert_eq!(after, hasher.finalize().to_vec());
        Ok(())
    }

    #[test]
    #[ignore = "needs a TPM"]
    fn buffer_max_reported() -> Result<()> {
        assert!(get_context()?.nv_buffer_max()? > 0);
        Ok(())
    }
}
