//! The signed install manifest (`install.yaml`) and the system manifest
//! (`manifest.json`) derived from it.
use super::{ManifestError, Result};
use crate::oci::drop_url_prefix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

pub const CURRENT_INSTALL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    #[default]
    Partial,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Iso,
    Zap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "hostfs")]
    Hostfs,
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "fs-only")]
    FsOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Host,
    #[default]
    None,
    Simple,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNetwork {
    #[serde(rename = "type", default)]
    pub kind: NetworkType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address6: Option<String>,
}

impl TargetNetwork {
    fn validate(&self, target: &str) -> Result<()> {
        let bad = |why: &str| ManifestError::Invalid(format!("target {target}: {why}"));
        if self.kind != NetworkType::Simple && !self.ports.is_empty() {
            return Err(bad("ports need a simple network"));
        }
        if self.ports.iter().any(|p| p.host == 0 || p.container == 0) {
            return Err(bad("ports must be in 1..65535"));
        }
        if let Some(a) = &self.address {
            a.parse::<Ipv4Addr>().map_err(|_| bad("bad ipv4 address"))?;
        }
        if let Some(a) = &self.address6 {
            a.parse::<Ipv6Addr>().map_err(|_| bad("bad ipv6 address"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub options: String,
}

/// Where a target's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// `docker://<host>/<name>[:<tag>]`
    Docker {
        addr: String,
        name: String,
        tag: Option<String>,
    },
    /// `oci:<dir>:<name>[:<tag>]`
    Oci {
        dir: PathBuf,
        name: String,
        tag: Option<String>,
    },
}

fn split_tag(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (s, None),
    }
}

impl ImageSource {
    pub fn parse(source: &str) -> Result<Self> {
        let bad = || ManifestError::Source(source.to_string());
        if let Some(rest) = source.strip_prefix("oci:") {
            let (dir, image) = rest.split_once(':').ok_or_else(bad)?;
            let (name, tag) = split_tag(image);
            if dir.is_empty() || name.is_empty() {
                return Err(bad());
            }
            return Ok(ImageSource::Oci {
                dir: dir.into(),
                name: name.to_string(),
                tag: tag.map(str::to_string),
            });
        }
        if source.starts_with("docker://") {
            let (addr, image) = drop_url_prefix(source).split_once('/').ok_or_else(bad)?;
            let (name, tag) = split_tag(image);
            if addr.is_empty() || name.is_empty() {
                return Err(bad());
            }
            return Ok(ImageSource::Docker {
                addr: addr.to_string(),
                name: name.to_string(),
                tag: tag.map(str::to_string),
            });
        }
        Err(bad())
    }

    pub fn name(&self) -> &str {
        match self {
            ImageSource::Docker { name, .. } | ImageSource::Oci { name, .. } => name,
        }
    }
}

/// One service of an install manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub service_name: String,
    pub source: String,
    pub version: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub nsgroup: String,
    #[serde(default)]
    pub network: TargetNetwork,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub manifest_hash: String,
}

impl Target {
    /// Targets in the `""` or `"none"` nsgroup share the host uid range.
    pub fn needs_idmap(&self) -> bool {
        needs_idmap(&self.nsgroup)
    }

    /// The image name the target is stored under in the layer cache.
    pub fn image_path(&self) -> String {
        ImageSource::parse(&self.source)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|_| self.service_name.clone())
    }
}

pub fn needs_idmap(nsgroup: &str) -> bool {
    !nsgroup.is_empty() && nsgroup != "none"
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFile {
    pub version: u32,
    pub product: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,
    #[serde(default)]
    pub update_type: UpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    pub targets: Vec<Target>,
}

impl InstallFile {
    pub fn parse(yaml: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(yaml)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.product.is_empty() {
            return Err(ManifestError::Invalid("product must be set".into()));
        }
        if self.version != CURRENT_INSTALL_VERSION {
            return Err(ManifestError::Version(self.version));
        }
        if let Some(storage) = &self.storage_type {
            if storage != "atomfs" {
                return Err(ManifestError::Invalid(format!(
                    "unsupported storage type {storage:?}"
                )));
            }
        }
        let mut names = HashSet::new();
        for t in &self.targets {
            if t.service_name.is_empty() {
                return Err(ManifestError::Invalid("target with empty service_name".into()));
            }
            if t.version.is_empty() {
                return Err(ManifestError::Invalid(format!(
                    "target {} has an empty version",
                    t.service_name
                )));
            }
            if !names.insert(t.service_name.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate target {}",
                    t.service_name
                )));
            }
            t.network.validate(&t.service_name)?;
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.service_name == name)
    }
}

/// A host-uid range assigned to an nsgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet {
    pub name: String,
    pub id: u64,
    pub range: u64,
}

/// A target as installed: the target itself plus the install manifest
/// (`<sha>.yaml`) that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysTarget {
    pub name: String,
    pub source: String,
    pub version: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub nsgroup: String,
    #[serde(default)]
    pub network: TargetNetwork,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    pub manifest_hash: String,
    pub source_file: String,
}

impl SysTarget {
    pub fn new(target: &Target, source_file: &str) -> Self {
        Self {
            name: target.service_name.clone(),
            source: target.source.clone(),
            version: target.version.clone(),
            service_type: target.service_type,
            nsgroup: target.nsgroup.clone(),
            network: target.network.clone(),
            mounts: target.mounts.clone(),
            manifest_hash: target.manifest_hash.clone(),
            source_file: source_file.to_string(),
        }
    }

    pub fn target(&self) -> Target {
        Target {
            service_name: self.name.clone(),
            source: self.source.clone(),
            version: self.version.clone(),
            service_type: self.service_type,
            nsgroup: self.nsgroup.clone(),
            network: self.network.clone(),
            mounts: self.mounts.clone(),
            manifest_hash: self.manifest_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysManifest {
    pub uidmaps: Vec<IdmapSet>,
    pub sys_targets: Vec<SysTarget>,
    #[serde(default)]
    pub update_type: UpdateType,
}

impl SysManifest {
    pub fn target(&self, name: &str) -> Option<&SysTarget> {
        self.sys_targets.iter().find(|t| t.name == name)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const INSTALL: &str = r#"
version: 1
product: 2b1f4b4e-6a36-4b39-9f2a-7c0f5d3e1a11
image_type: iso
storage_type: atomfs
targets:
  - service_name: hostfs
    source: docker://zothub.io/machine/bootkit/rootfs:1.0.0-squashfs
    version: 1.0.0-squashfs
    service_type: hostfs
    nsgroup: none
    network:
      type: host
    manifest_hash: 5a1d
  - service_name: zot
    source: oci:/media/oci:machine/zot:2.0
    version: "2.0"
    service_type: container
    nsgroup: zot
    network:
      type: simple
      ports:
        - host: 5000
          container: 5000
      address: 10.0.3.2
    mounts:
      - source: /data/zot
        dest: /var/lib/zot
        options: rw
    manifest_hash: 9e4c
"#;

    #[test]
    fn parse_install_manifest() -> Result<()> {
        let install = InstallFile::parse(INSTALL.as_bytes())?;
        install.validate()?;
        assert_eq!(install.update_type, UpdateType::Partial);
        assert_eq!(install.image_type, Some(ImageType::Iso));
        let zot = install.target("zot").ok_or_else(|| eyre::eyre!("no zot"))?;
        assert!(zot.needs_idmap());
        assert_eq!(zot.image_path(), "machine/zot");
        assert_eq!(zot.network.ports, vec![Port { host: 5000, container: 5000 }]);
        let hostfs = install.target("hostfs").ok_or_else(|| eyre::eyre!("no hostfs"))?;
        assert!(!hostfs.needs_idmap());
        assert_eq!(hostfs.image_path(), "machine/bootkit/rootfs");
        Ok(())
    }

    #[test]
    fn rejects_bad_manifests() -> Result<()> {
        let good = InstallFile::parse(INSTALL.as_bytes())?;

        let mut m = good.clone();
        m.version = 2;
        assert!(matches!(m.validate(), Err(ManifestError::Version(2))));

        let mut m = good.clone();
        m.product.clear();
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));

        let mut m = good.clone();
        m.targets[1].service_name = "hostfs".into();
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));

        let mut m = good.clone();
        m.targets[0].version.clear();
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));

        let mut m = good.clone();
        m.targets[1].network.address = Some("10.0.3".into());
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));

        let mut m = good;
        m.targets[0].network.ports.push(Port { host: 80, container: 80 });
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn image_sources() -> Result<()> {
        assert_eq!(
            ImageSource::parse("docker://10.0.2.2:5000/machine/livecd:1.0")?,
            ImageSource::Docker {
                addr: "10.0.2.2:5000".into(),
                name: "machine/livecd".into(),
                tag: Some("1.0".into()),
            }
        );
        assert_eq!(
            ImageSource::parse("oci:/srv/oci:rootfs")?,
            ImageSource::Oci {
                dir: "/srv/oci".into(),
                name: "rootfs".into(),
                tag: None,
            }
        );
        for bad in ["http://x/y", "oci:/dir", "docker://host", "rootfs"] {
            assert!(matches!(
                ImageSource::parse(bad),
                Err(ManifestError::Source(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn system_manifest_json_shape() -> Result<()> {
        let install = InstallFile::parse(INSTALL.as_bytes())?;
        let sys = SysManifest {
            uidmaps: vec![IdmapSet {
                name: "zot".into(),
                id: 100000,
                range: 65536,
            }],
            sys_targets: install
                .targets
                .iter()
                .map(|t| SysTarget::new(t, "abcd.yaml"))
                .collect(),
            update_type: UpdateType::Complete,
        };
        let json: serde_json::Value = serde_json::from_slice(&sys.to_json()?)?;
        assert_eq!(json["uidmaps"][0]["id"], 100000);
        assert_eq!(json["sys_targets"][1]["source_file"], "abcd.yaml");
        assert_eq!(json["sys_targets"][0]["service_type"], "hostfs");
        assert_eq!(json["update_type"], "complete");
        assert_eq!(SysManifest::from_json(&sys.to_json()?)?, sys);
        assert_eq!(sys.sys_targets[1].target(), install.targets[1]);
        Ok(())
    }
}
