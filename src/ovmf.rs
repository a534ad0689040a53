//! Seeding OVMF firmware variables with a keyset's Secure Boot keys.
use crate::crypto::pem::cert_pem;
use crate::efi::SignatureData;
use crate::run::{self, RunError};
use der::Decode;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use x509_cert::Certificate;

const TOOL: &str = "virt-fw-vars";

#[derive(Error, Debug)]
pub enum OvmfError {
    #[error("failed to serialize certificate for {arg}: {reason}")]
    SerializeCert { arg: &'static str, reason: String },
    #[error("{TOOL} failed: {0}")]
    ToolInvocation(#[from] RunError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = OvmfError> = core::result::Result<T, E>;

/// Keys to install into a variable store.
#[derive(Debug, Clone)]
pub struct SecureBootKeys {
    pub pk: SignatureData,
    pub kek: Vec<SignatureData>,
    pub db: Vec<SignatureData>,
    pub mok: Vec<SignatureData>,
}

fn write_pem(dir: &Path, arg: &'static str, sig: &SignatureData) -> Result<PathBuf> {
    let pem = Certificate::from_der(&sig.data)
        .map_err(|e| e.to_string())
        .and_then(|c| cert_pem(&c).map_err(|e| e.to_string()))
        .map_err(|reason| OvmfError::SerializeCert { arg, reason })?;
    let mut file = tempfile::Builder::new()
        .suffix(".pem")
        .tempfile_in(dir)?;
    file.write_all(pem.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// `--set-pk`/`--add-*` argument triples, with each certificate written as PEM under `dir`.
fn key_args(dir: &Path, keys: &SecureBootKeys) -> Result<Vec<String>> {
    let groups: [(&'static str, &[SignatureData]); 4] = [
        ("--set-pk", std::slice::from_ref(&keys.pk)),
        ("--add-kek", &keys.kek),
        ("--add-db", &keys.db),
        ("--add-mok", &keys.mok),
    ];
    let mut args = vec![];
    for (arg, sigs) in groups {
        for sig in sigs {
            let path = write_pem(dir, arg, sig)?;
            args.push(arg.to_string());
            args.push(sig.owner.to_string());
            args.push(path.display().to_string());
        }
    }
    Ok(args)
}

/// Write a copy of `vars_in` to `vars_out` that boots with Secure Boot
/// enabled, no Microsoft keys, and `keys` enrolled.
pub fn populate_secure_boot(vars_in: &Path, vars_out: &Path, keys: &SecureBootKeys) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let mut args = key_args(scratch.path(), keys)?;

    let dir = vars_out.parent().unwrap_or_else(|| Path::new("."));
    let staged = tempfile::NamedTempFile::new_in(dir)?;
    let mut full = vec![
        format!("--input={}", vars_in.display()),
        format!("--output={}", staged.path().display()),
        "--secure-boot".to_string(),
        "--no-microsoft".to_string(),
    ];
    full.append(&mut args);
    run::run(&mut run::cmd(TOOL, &full))?;
    staged.persist(vars_out).map_err(|e| e.error)?;
    log::info!("wrote secure boot variables to {}", vars_out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{issue, years_from_now, CertTemplate, Issuer, Subject};
    use crate::crypto::pem::generate_key;
    use der::Encode;
    use eyre::Result;
    use uuid::Uuid;

    fn cert_sig(owner: Uuid) -> Result<SignatureData> {
        let key = generate_key()?;
        let cert = issue(
            &CertTemplate::ca(Subject::new("UEFI PK"), years_from_now(1)),
            &key.to_public_key(),
            Issuer::SelfSigned(&key),
        )?;
        Ok(SignatureData::new(owner, cert.to_der()?))
    }

    #[test]
    fn arguments_carry_owner_and_pem() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let owner = Uuid::new_v4();
        let sig = cert_sig(owner)?;
        let keys = SecureBootKeys {
            pk: sig.clone(),
            kek: vec![sig.clone()],
            db: vec![],
            mok: vec![sig.clone(), sig],
        };
        let args = key_args(dir.path(), &keys)?;
        assert_eq!(args.len(), 12);
        let flags: Vec<_> = args.iter().step_by(3).map(String::as_str).collect();
        assert_eq!(flags, ["--set-pk", "--add-kek", "--add-mok", "--add-mok"]);
        assert_eq!(args[1], owner.to_string());
        assert!(std::fs::read_to_string(&args[2])?.starts_with("-----BEGIN CERTIFICATE-----"));
        Ok(())
    }

    #[test]
    fn bad_certificate_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let keys = SecureBootKeys {
            pk: SignatureData::new(Uuid::nil(), vec![1, 2, 3]),
            kek: vec![],
            db: vec![],
            mok: vec![],
        };
        assert!(matches!(
            key_args(dir.path(), &keys),
            Err(OvmfError::SerializeCert { arg: "--set-pk", .. })
        ));
        Ok(())
    }

    #[test]
    fn no_output_on_tool_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("ovmf-vars.fd");
        let keys = SecureBootKeys {
            pk: cert_sig(Uuid::new_v4())?,
            kek: vec![],
            db: vec![],
            mok: vec![],
        };
        // the input does not exist, so the tool (or its absence) fails
        let res = populate_secure_boot(&dir.path().join("missing.fd"), &out, &keys);
        assert!(matches!(res, Err(OvmfError::ToolInvocation(_))));
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
