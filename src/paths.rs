//! Well-known locations and small filesystem helpers shared by the trust commands.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Overrides the XDG data home, mostly useful for tests and CI.
pub const DATA_HOME_ENV: &str = "MOS_TRUST_DATA_HOME";

#[derive(Error, Debug)]
pub enum PathError {
    #[error("unable to determine the user data directory, set HOME or {DATA_HOME_ENV}")]
    NoDataHome,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = PathError> = core::result::Result<T, E>;

pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| PathError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn data_home() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_HOME_ENV) {
        return Ok(dir.into());
    }
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        return Ok(dir.into());
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share"))
        .ok_or(PathError::NoDataHome)
}

/// `<data home>/machine/trust/keys`, the parent of every keyset.
pub fn keys_dir() -> Result<PathBuf> {
    Ok(data_home()?.join("machine").join("trust").join("keys"))
}

pub fn create_dir_mode(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .at(path)
}

/// Write a new file with the given mode. Refuses to clobber an existing file.
pub fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .at(path)?;
    f.write_all(contents).at(path)?;
    // umask may have stripped bits we asked for
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).at(path)
}

/// Write (or replace) a file with the given mode.
pub fn write_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .at(path)?;
    f.write_all(contents).at(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).at(path)
}

pub fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).at(path)
}

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).at(path)
}

/// Copy a file, keeping the source permissions.
pub fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    fs::copy(src, dest).at(src).map(|_| ())
}

/// Recursively copy a directory tree.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).at(dest)?;
    for entry in fs::read_dir(src).at(src)? {
        let entry = entry.at(src)?;
        let target = dest.join(entry.file_name());
        if entry.file_type().at(&entry.path())?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            copy_file(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Total size of all regular files under `path`.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(path).at(path)? {
        let entry = entry.at(path)?;
        let meta = entry.metadata().at(&entry.path())?;
        if meta.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += meta.len();
        }
    }
    Ok(size)
}

/// Names of the immediate subdirectories of `path`, sorted.
pub fn subdirs(path: &Path) -> Result<Vec<String>> {
    let mut names = vec![];
    for entry in fs::read_dir(path).at(path)? {
        let entry = entry.at(path)?;
        if entry.file_type().at(&entry.path())?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
