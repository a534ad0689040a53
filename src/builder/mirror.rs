//! A throwaway local zot registry for staging images onto boot media.
use super::{BuilderError, Result};
use crate::oci::DistRepo;
use crate::paths;
use serde_json::json;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const PING_ATTEMPTS: u32 = 6;
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// zot's configuration for a registry rooted at `storage` on `port`.
pub fn zot_config(storage: &Path, port: u16) -> serde_json::Value {
    json!({
        "distSpecVersion": "1.1.0",
        "storage": {
            "rootDirectory": storage,
            "gc": false,
        },
        "http": {
            "address": Ipv4Addr::LOCALHOST.to_string(),
            "port": port.to_string(),
        },
        "log": {
            "level": "error",
        },
    })
}

fn unused_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// A `zot serve` child process, killed when dropped.
#[derive(Debug)]
pub struct ZotServer {
    child: Child,
    port: u16,
    storage: PathBuf,
}

impl ZotServer {
    /// Serve `storage` on an unused loopback port. The config file is
    /// written to `workdir`.
    pub fn start(workdir: &Path, storage: &Path) -> Result<Self> {
        paths::create_dir_mode(storage, 0o755)?;
        let port = unused_port()?;
        let config = workdir.join("zot-config.json");
        let body = serde_json::to_vec_pretty(&zot_config(storage, port))
            .map_err(|e| BuilderError::Mirror(e.to_string()))?;
        paths::write_mode(&config, &body, 0o644)?;

        log::info!("starting zot on port {port}");
        let child = Command::new("zot")
            .arg("serve")
            .arg(&config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BuilderError::Mirror(format!("failed to start zot: {e}")))?;
        let server = Self {
            child,
            port,
            storage: storage.to_path_buf(),
        };
        server.wait_ready()?;
        Ok(server)
    }

    fn wait_ready(&self) -> Result<()> {
        let mut last = None;
        for _ in 0..PING_ATTEMPTS {
            match DistRepo::connect(&self.addr()) {
                Ok(_) => {
                    log::debug!("zot answering on {}", self.addr());
                    return Ok(());
                }
                Err(e) => last = Some(e),
            }
            std::thread::sleep(PING_INTERVAL);
        }
        Err(BuilderError::Mirror(format!(
            "zot on {} did not start: {}",
            self.addr(),
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", Ipv4Addr::LOCALHOST, self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn repo(&self) -> Result<DistRepo> {
        Ok(DistRepo::connect(&self.addr())?)
    }
}

impl Drop for ZotServer {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            log::warn!("failed to stop zot: {e}");
        }
        let _ = self.child.wait();
    }
}
