//! Where target images live once installed: a zot-style cache of OCI layouts,
//! one per image path, which atomfs mounts from.
use crate::manifest::types::Target;
use crate::oci::{self, OciError, OciLayout, MEDIA_TYPE_IMAGE_MANIFEST};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{target}: manifest hash is {found}, expected {expected}")]
    HashMismatch {
        target: String,
        expected: String,
        found: String,
    },
    #[error("{target}: {reference} does not point to an image manifest ({media_type})")]
    NotManifest {
        target: String,
        reference: String,
        media_type: String,
    },
    #[error("no image {name}:{version} under {dir}")]
    NoImage {
        dir: PathBuf,
        name: String,
        version: String,
    },
    #[error(transparent)]
    Oci(#[from] OciError),
}

pub type Result<T, E = StorageError> = core::result::Result<T, E>;

pub trait StorageBackend {
    /// Hex sha256 of the image manifest `target` resolves to in the cache.
    fn manifest_hash(&self, target: &Target) -> Result<String>;

    /// Copy `target`'s image from the layout (or zot tree) at `src_dir` into
    /// the cache.
    fn import_target(&self, src_dir: &Path, target: &Target) -> Result<()>;

    fn target_exists(&self, target: &Target) -> bool;

    /// Check the cached image against the manifest's recorded hash.
    fn verify_target(&self, target: &Target) -> Result<()> {
        let found = self.manifest_hash(target)?;
        if found != target.manifest_hash {
            return Err(StorageError::HashMismatch {
                target: target.service_name.clone(),
                expected: target.manifest_hash.clone(),
                found,
            });
        }
        Ok(())
    }
}

/// Locate an image in `dir`. A plain OCI layout names it `<name>:<version>`;
/// a zot tree keeps one layout per name, tagged `<version>`.
pub fn pick_oci_or_zot(dir: &Path, name: &str, version: &str) -> Result<(PathBuf, String)> {
    if dir.join("index.json").exists() {
        let reference = if version.is_empty() {
            name.to_string()
        } else {
            format!("{name}:{version}")
        };
        return Ok((dir.to_path_buf(), reference));
    }
    let layout = dir.join(name);
    if !layout.join("index.json").exists() {
        return Err(StorageError::NoImage {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            version: version.to_string(),
        });
    }
    Ok((layout, version.to_string()))
}

pub enum Storage {
    Atomfs(AtomfsStorage),
}

impl Storage {
    /// Atomfs storage keeping its OCI layouts under `cache`.
    pub fn atomfs(cache: &Path) -> Self {
        Storage::Atomfs(AtomfsStorage {
            cache: cache.to_path_buf(),
        })
    }

    fn backend(&self) -> &dyn StorageBackend {
        match self {
            Storage::Atomfs(a) => a,
        }
    }
}

impl StorageBackend for Storage {
    fn manifest_hash(&self, target: &Target) -> Result<String> {
        self.backend().manifest_hash(target)
    }

    fn import_target(&self, src_dir: &Path, target: &Target) -> Result<()> {
        self.backend().import_target(src_dir, target)
    }

    fn target_exists(&self, target: &Target) -> bool {
        self.backend().target_exists(target)
    }
}

pub struct AtomfsStorage {
    cache: PathBuf,
}

impl StorageBackend for AtomfsStorage {
    fn manifest_hash(&self, target: &Target) -> Result<String> {
        let (dir, reference) = pick_oci_or_zot(&self.cache, &target.image_path(), &target.version)?;
        let desc = OciLayout::open(&dir)?.resolve(&reference)?;
        if desc.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            return Err(StorageError::NotManifest {
                target: target.service_name.clone(),
                reference,
                media_type: desc.media_type,
            });
        }
        Ok(oci::drop_hash_prefix(&desc.digest).to_string())
    }

    fn import_target(&self, src_dir: &Path, target: &Target) -> Result<()> {
        let image = target.image_path();
        let (dir, reference) = pick_oci_or_zot(src_dir, &image, &target.version)?;
        let dest = OciLayout::create(&self.cache.join(&image))?;
        OciLayout::open(&dir)?.copy_image(&reference, &dest, &target.version)?;
        log::info!(
            "imported {} ({image}:{}) from {}",
            target.service_name,
            target.version,
            src_dir.display()
        );
        Ok(())
    }

    fn target_exists(&self, target: &Target) -> bool {
        self.manifest_hash(target).is_ok()
    }
}
