//! The advisory lock on a config directory, and finding who holds it.
use super::{ManifestError, Result};
use crate::paths::IoContext;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "manifest.lock";
const PROC_LOCKS: &str = "/proc/locks";

/// Held for as long as the value lives.
#[derive(Debug)]
pub struct ConfigLock {
    file: File,
    path: PathBuf,
}

impl ConfigLock {
    /// Take the lock on `<config_dir>/manifest.lock` without waiting.
    pub fn acquire(config_dir: &Path, shared: bool) -> Result<Self> {
        let path = config_dir.join(LOCK_FILE);
        let file = File::create(&path).at(&path)?;
        let op = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
        if rc == 0 {
            log::debug!("locked {}", path.display());
            return Ok(Self { file, path });
        }
        let owner = match file.metadata() {
            Ok(meta) => lock_owner(Path::new(PROC_LOCKS), meta.ino()),
            Err(e) => format!("cannot stat lock file: {e}"),
        };
        Err(ManifestError::Locked { path, owner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        // SAFETY: as above; closing the file would release it anyway.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// The pid holding a lock on inode `ino` according to a `/proc/locks` listing.
pub fn find_lock_pid(locks: &str, ino: u64) -> Option<String> {
    locks.lines().find_map(|line| {
        let fields: Vec<_> = line.split_whitespace().collect();
        // "1: FLOCK  ADVISORY  WRITE 1234 fd:01:5678 0 EOF"
        let id = fields.get(5)?;
        let (_, lock_ino) = id.rsplit_once(':')?;
        (lock_ino.parse::<u64>().ok()? == ino).then(|| fields[4].to_string())
    })
}

fn lock_owner(proc_locks: &Path, ino: u64) -> String {
    let locks = match std::fs::read_to_string(proc_locks) {
        Ok(l) => l,
        Err(e) => return format!("failed to read {}: {e}", proc_locks.display()),
    };
    let Some(pid) = find_lock_pid(&locks, ino) else {
        return "couldn't find who owns the lock".to_string();
    };
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => {
            let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");
            format!("lock owned by pid {pid} ({})", cmdline.trim_end())
        }
        Err(_) => format!("lock owned by pid {pid}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_proc_locks() {
        let locks = "1: FLOCK  ADVISORY  WRITE 4242 fd:01:1311 0 EOF\n\
                     2: POSIX  ADVISORY  READ 17 00:19:99 0 EOF\n";
        assert_eq!(find_lock_pid(locks, 1311).as_deref(), Some("4242"));
        assert_eq!(find_lock_pid(locks, 99).as_deref(), Some("17"));
        assert_eq!(find_lock_pid(locks, 7), None);
        assert_eq!(find_lock_pid("garbage\n", 7), None);
    }

    #[test]
    fn exclusive() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let held = ConfigLock::acquire(tmp.path(), false)?;
        assert!(matches!(
            ConfigLock::acquire(tmp.path(), false),
            Err(ManifestError::Locked { .. })
        ));
        assert!(matches!(
            ConfigLock::acquire(tmp.path(), true),
            Err(ManifestError::Locked { .. })
        ));
        drop(held);
        let _shared = ConfigLock::acquire(tmp.path(), true)?;
        let _other = ConfigLock::acquire(tmp.path(), true)?;
        Ok(())
    }
}
