//! The revisioned history of installed manifests, kept as a git repository.
use super::{ManifestError, Result};
use crate::paths::{self, IoContext};
use crate::run;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const STORE_DIR: &str = "manifest.git";
const AUTHOR_NAME: &str = "machine";
const AUTHOR_EMAIL: &str = "root@machine.local";

pub const INITIAL_COMMIT: &str = "Initial commit";
pub const UPGRADE_COMMIT: &str = "System upgrade";

#[derive(Debug)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Create an empty store at `dir`, which must not exist yet.
    pub fn init(dir: &Path) -> Result<Self> {
        if dir.exists() {
            return Err(ManifestError::StoreExists(dir.to_path_buf()));
        }
        std::fs::create_dir_all(dir).at(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
        };
        if let Err(e) = store.git(["init", "-q"]) {
            let _ = std::fs::remove_dir_all(dir);
            return Err(e);
        }
        log::debug!("initialised manifest store {}", dir.display());
        Ok(store)
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join(".git").is_dir() {
            return Err(ManifestError::NoStore(dir.to_path_buf()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = run::cmd("git", [OsStr::new("-C"), self.dir.as_os_str()]);
        cmd.args(args)
            .env("GIT_AUTHOR_NAME", AUTHOR_NAME)
            .env("GIT_AUTHOR_EMAIL", AUTHOR_EMAIL)
            .env("GIT_COMMITTER_NAME", AUTHOR_NAME)
            .env("GIT_COMMITTER_EMAIL", AUTHOR_EMAIL)
            .env("GIT_CONFIG_NOSYSTEM", "1");
        cmd
    }

    fn git<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Ok(run::capture(&mut self.command(args), None)?)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(paths::read(&self.dir.join(name))?)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    /// Stage everything in the work tree and commit it.
    pub fn commit(&self, message: &str) -> Result<()> {
        self.git(["add", "-A"])?;
        self.git(["-c", "commit.gpgsign=false", "commit", "-q", "-m", message])?;
        log::info!("committed {:?} to {}", message, self.dir.display());
        Ok(())
    }

    /// Make the work tree exactly the files in `staging` and commit them. On
    /// failure the work tree is put back to the last commit.
    pub fn replace_and_commit(&self, staging: &Path, message: &str) -> Result<()> {
        let result = self.replace(staging).and_then(|()| self.commit(message));
        if result.is_err() {
            log::warn!("restoring {} after failed update", self.dir.display());
            let _ = self.git(["reset", "-q", "--hard", "HEAD"]);
            let _ = self.git(["clean", "-q", "-f", "-d"]);
        }
        result
    }

    fn replace(&self, staging: &Path) -> Result<()> {
        for entry in std::fs::read_dir(&self.dir).at(&self.dir)? {
            let entry = entry.at(&self.dir)?;
            if entry.file_name() == ".git" {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path).at(&path)?;
            } else {
                std::fs::remove_file(&path).at(&path)?;
            }
        }
        paths::copy_tree(staging, &self.dir)?;
        Ok(())
    }

    /// Commit subjects, newest first.
    pub fn history(&self) -> Result<Vec<String>> {
        let out = self.git(["log", "--format=%s"])?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn head_author(&self) -> Result<String> {
        let out = self.git(["log", "-1", "--format=%an <%ae>|%cn <%ce>"])?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

#[cfg(test)]
pub(crate) fn have_git() -> bool {
    run::run(&mut run::cmd("git", ["--version"])).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn init_commit_replace() -> Result<()> {
        if !have_git() {
            return Ok(());
        }
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join(STORE_DIR);
        let store = ManifestStore::init(&dir)?;
        assert!(matches!(
            ManifestStore::init(&dir),
            Err(ManifestError::StoreExists(_))
        ));

        std::fs::write(dir.join("a.yaml"), "a")?;
        std::fs::write(dir.join("manifest.json"), "{}")?;
        store.commit(INITIAL_COMMIT)?;
        assert_eq!(
            store.head_author()?,
            "machine <root@machine.local>|machine <root@machine.local>"
        );

        let staging = tmp.path().join("staging");
        std::fs::create_dir(&staging)?;
        std::fs::write(staging.join("b.yaml"), "b")?;
        std::fs::write(staging.join("manifest.json"), "{\"v\":2}")?;
        let store = ManifestStore::open(&dir)?;
        store.replace_and_commit(&staging, UPGRADE_COMMIT)?;
        assert!(!store.exists("a.yaml"));
        assert_eq!(store.read("b.yaml")?, b"b");
        assert_eq!(store.read("manifest.json")?, b"{\"v\":2}");
        assert_eq!(store.history()?, vec![UPGRADE_COMMIT, INITIAL_COMMIT]);
        Ok(())
    }

    #[test]
    fn open_requires_repository() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(matches!(
            ManifestStore::open(tmp.path()),
            Err(ManifestError::NoStore(_))
        ));
        Ok(())
    }
}
