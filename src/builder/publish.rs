//! Publishing an install manifest: its targets are copied into the registry
//! under their manifest hashes, and the manifest is signed with a project key.
use super::{BuilderError, Result, MOS_REPO};
use crate::keyset::Keyset;
use crate::manifest::types::{ImageSource, InstallFile, Target};
use crate::manifest::{sign_manifest, INSTALL_FILE};
use crate::oci::{drop_hash_prefix, sha256_digest, Descriptor, DistRepo, OciLayout};
use crate::paths;
use std::path::Path;

/// Record `found` as the target's manifest hash, refusing to change one the
/// author already pinned.
pub fn pin_hash(target: &mut Target, found: &str) -> Result<()> {
    if !target.manifest_hash.is_empty() && target.manifest_hash != found {
        return Err(BuilderError::Pinned {
            target: target.service_name.clone(),
            expected: target.manifest_hash.clone(),
            found: found.to_string(),
        });
    }
    target.manifest_hash = found.to_string();
    Ok(())
}

/// Copy `target`'s image into `repo` as `mos:<hash>`, returning the hash.
fn copy_target(target: &Target, repo: &DistRepo) -> Result<String> {
    match ImageSource::parse(&target.source)? {
        ImageSource::Docker { addr, name, tag } => {
            let tag = tag.unwrap_or_else(|| target.version.clone());
            let src = DistRepo::connect(&addr)?;
            let hash = drop_hash_prefix(&sha256_digest(&src.fetch_manifest(&name, &tag)?)).to_string();
            src.copy_image_to(&name, &tag, repo, MOS_REPO, &hash)?;
            Ok(hash)
        }
        ImageSource::Oci { dir, name, tag } => {
            let reference = format!("{name}:{}", tag.as_deref().unwrap_or(&target.version));
            let layout = OciLayout::open(&dir)?;
            let body = layout.read_blob(&layout.resolve(&reference)?.digest)?;
            let hash = drop_hash_prefix(&sha256_digest(&body)).to_string();
            repo.push_image(&layout, &reference, MOS_REPO, &hash)?;
            Ok(hash)
        }
    }
}

/// Publish the install manifest `source` as `name:tag` in `repo`, signed by
/// `project` of `keyset`.
pub fn publish_manifest(
    keyset: &Keyset,
    project: &str,
    repo: &DistRepo,
    name: &str,
    tag: &str,
    source: &Path,
) -> Result<Descriptor> {
    let mut install = InstallFile::parse(&paths::read(source)?)?;
    for target in &mut install.targets {
        let hash = copy_target(target, repo)?;
        pin_hash(target, &hash)?;
        log::debug!("{} is {MOS_REPO}:{hash}", target.service_name);
    }
    install.validate()?;

    let dir = keyset.project_dir(project);
    let scratch = tempfile::tempdir()?;
    let manifest = scratch.path().join(INSTALL_FILE);
    let yaml = serde_yaml::to_string(&install).map_err(crate::manifest::ManifestError::from)?;
    paths::write_mode(&manifest, yaml.as_bytes(), 0o644)?;
    let signature = sign_manifest(&manifest, &dir.join("privkey.pem"))?;
    Ok(repo.publish_install(name, tag, &manifest, &signature, &dir.join("cert.pem"))?)
}
