//! OCI image layouts on disk, and the slice of the distribution API used to
//! publish and fetch signed install manifests.
use crate::paths::{self, PathError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

pub const INSTALL_ARTIFACT: &str = "vnd.machine.install";
pub const SIGNATURE_ARTIFACT: &str = "vnd.machine.signature";
pub const CERT_ARTIFACT: &str = "vnd.machine.pubkeycrt";

/// The `{}` config every artifact manifest points at.
pub const EMPTY_CONFIG: &[u8] = b"{}";
pub const EMPTY_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";

#[derive(Error, Debug)]
pub enum OciError {
    #[error("{url}: {source}")]
    Request {
        url: String,
        source: Box<ureq::Error>,
    },
    #[error("{url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("{url}: missing {header} header")]
    Header { url: String, header: &'static str },
    #[error("failed to parse {what}: {source}")]
    Json {
        what: String,
        source: serde_json::Error,
    },
    #[error("bad OCI url {0:?}")]
    Url(String),
    #[error("unsupported digest {0:?}")]
    Digest(String),
    #[error("blob {expected} has digest {found}")]
    DigestMismatch { expected: String, found: String },
    #[error("{0} is not an OCI layout")]
    NotLayout(PathBuf),
    #[error("no image {reference:?} in {layout}")]
    NoImage { layout: PathBuf, reference: String },
    #[error("{reference:?} is ambiguous in {layout}")]
    Ambiguous { layout: PathBuf, reference: String },
    #[error("expected exactly one layer in {0}, found {1}")]
    Layers(String, usize),
    #[error("no {artifact_type} referrer for {digest}")]
    NoReferrer {
        artifact_type: String,
        digest: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type Result<T, E = OciError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe `data` as a blob of `media_type`.
    pub fn of(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: sha256_digest(data),
            size: data.len() as u64,
            artifact_type: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// A single-layer manifest with the empty config.
    pub fn artifact(layer: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            artifact_type: None,
            config: Descriptor {
                media_type: MEDIA_TYPE_EMPTY.to_string(),
                digest: EMPTY_DIGEST.to_string(),
                size: EMPTY_CONFIG.len() as u64,
                artifact_type: None,
                annotations: BTreeMap::new(),
            },
            layers: vec![layer],
            subject: None,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: vec![],
        }
    }
}

fn to_json<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| OciError::Json {
        what: what.to_string(),
        source,
    })
}

fn from_json<T: DeserializeOwned>(what: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|source| OciError::Json {
        what: what.to_string(),
        source,
    })
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Strip a `docker://`, `http://` or `https://` scheme.
pub fn drop_url_prefix(url: &str) -> &str {
    ["docker://", "http://", "https://"]
        .iter()
        .find_map(|p| url.strip_prefix(p))
        .unwrap_or(url)
}

/// Strip the algorithm from a digest.
pub fn drop_hash_prefix(digest: &str) -> &str {
    ["sha256:", "sha512:"]
        .iter()
        .find_map(|p| digest.strip_prefix(p))
        .unwrap_or(digest)
}

/// An image layout directory: `oci-layout`, `index.json` and `blobs/sha256/`.
#[derive(Debug, Clone)]
pub struct OciLayout {
    dir: PathBuf,
}

impl OciLayout {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join(INDEX_FILE).is_file() {
            return Err(OciError::NotLayout(dir.to_path_buf()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Open `dir`, initializing an empty layout there first if needed.
    pub fn create(dir: &Path) -> Result<Self> {
        paths::create_dir_mode(&dir.join("blobs").join("sha256"), 0o755)?;
        if !dir.join(LAYOUT_FILE).exists() {
            paths::write_mode(
                &dir.join(LAYOUT_FILE),
                br#"{"imageLayoutVersion":"1.0.0"}"#,
                0o644,
            )?;
        }
        let layout = Self {
            dir: dir.to_path_buf(),
        };
        if !dir.join(INDEX_FILE).exists() {
            layout.write_index(&Index::default())?;
        }
        Ok(layout)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> Result<Index> {
        from_json(
            &self.dir.join(INDEX_FILE).display().to_string(),
            &paths::read(&self.dir.join(INDEX_FILE))?,
        )
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        Ok(paths::write_mode(
            &self.dir.join(INDEX_FILE),
            &to_json("index", index)?,
            0o644,
        )?)
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| OciError::Digest(digest.to_string()))?;
        Ok(self.dir.join("blobs").join("sha256").join(hex))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Read a blob, checking it against its digest.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let data = paths::read(&self.blob_path(digest)?)?;
        let found = sha256_digest(&data);
        if found != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                found,
            });
        }
        Ok(data)
    }

    /// Store `data`, returning its digest. Existing blobs are left alone.
    pub fn write_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        let path = self.blob_path(&digest)?;
        if !path.exists() {
            paths::write_mode(&path, data, 0o644)?;
        }
        Ok(digest)
    }

    /// The index entry annotated with `reference`.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let mut found = self
            .index()?
            .manifests
            .into_iter()
            .filter(|d| d.ref_name() == Some(reference));
        let desc = found.next().ok_or_else(|| OciError::NoImage {
            layout: self.dir.clone(),
            reference: reference.to_string(),
        })?;
        if found.next().is_some() {
            return Err(OciError::Ambiguous {
                layout: self.dir.clone(),
                reference: reference.to_string(),
            });
        }
        Ok(desc)
    }

    pub fn read_manifest(&self, desc: &Descriptor) -> Result<ImageManifest> {
        from_json(&desc.digest, &self.read_blob(&desc.digest)?)
    }

    /// Point `reference` at `desc`, replacing any previous holder of the name.
    pub fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        let mut index = self.index()?;
        index.manifests.retain(|d| d.ref_name() != Some(reference));
        index
            .manifests
            .push(desc.clone().with_annotation(ANNOTATION_REF_NAME, reference));
        self.write_index(&index)
    }

    /// Copy the image `reference` and all its blobs into `dest`, tagged there
    /// as `dest_ref`.
    pub fn copy_image(&self, reference: &str, dest: &OciLayout, dest_ref: &str) -> Result<Descriptor> {
        let desc = self.resolve(reference)?;
        let manifest = self.read_manifest(&desc)?;
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if !dest.has_blob(&blob.digest) {
                dest.write_blob(&self.read_blob(&blob.digest)?)?;
            }
        }
        dest.write_blob(&self.read_blob(&desc.digest)?)?;
        let mut desc = desc;
        desc.annotations.remove(ANNOTATION_REF_NAME);
        dest.tag(&desc, dest_ref)?;
        log::debug!(
            "copied {reference} from {} to {}:{dest_ref}",
            self.dir.display(),
            dest.dir.display()
        );
        Ok(desc)
    }
}

/// `<host>/<name>:<tag>` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistUrl {
    pub addr: String,
    pub name: String,
    pub tag: String,
}

impl DistUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let bad = || OciError::Url(url.to_string());
        let (addr, rest) = drop_url_prefix(url).split_once('/').ok_or_else(bad)?;
        let (name, tag) = rest.rsplit_once(':').ok_or_else(bad)?;
        if addr.is_empty() || name.is_empty() || tag.is_empty() || tag.contains('/') {
            return Err(bad());
        }
        Ok(Self {
            addr: addr.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

/// Digests of a single-layer artifact image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    pub digest: String,
    pub size: u64,
    pub layer_digest: String,
}

/// The install manifest and its detached signature and certificate.
#[derive(Debug, Clone)]
pub struct InstallArtifacts {
    pub manifest: Vec<u8>,
    pub signature: Vec<u8>,
    pub cert: Vec<u8>,
}

/// Client for a registry. Loopback and IP-literal hosts are spoken to over
/// plain http, named hosts over https.
pub struct DistRepo {
    addr: String,
    scheme: &'static str,
    agent: ureq::Agent,
}

pub fn registry_scheme(addr: &str) -> &'static str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "localhost" || host.parse::<std::net::IpAddr>().is_ok() {
        "http"
    } else {
        "https"
    }
}

fn check(url: &str, result: core::result::Result<ureq::Response, ureq::Error>) -> Result<ureq::Response> {
    match result {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(status, _)) => Err(OciError::Status {
            url: url.to_string(),
            status,
        }),
        Err(e) => Err(OciError::Request {
            url: url.to_string(),
            source: Box::new(e),
        }),
    }
}

fn read_body(resp: ureq::Response) -> Result<Vec<u8>> {
    let mut body = vec![];
    resp.into_reader().read_to_end(&mut body)?;
    Ok(body)
}

impl DistRepo {
    /// Connect to the registry at `addr` (`host:port`), checking it answers.
    pub fn connect(addr: &str) -> Result<Self> {
        let addr = drop_url_prefix(addr).trim_end_matches('/');
        let repo = Self {
            addr: addr.to_string(),
            scheme: registry_scheme(addr),
            agent: ureq::AgentBuilder::new().build(),
        };
        repo.ping()?;
        Ok(repo)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}/v2/{path}", self.scheme, self.addr)
    }

    fn get(&self, url: &str) -> Result<ureq::Response> {
        let resp = check(url, self.agent.get(url).call())?;
        if resp.status() != 200 {
            return Err(OciError::Status {
                url: url.to_string(),
                status: resp.status(),
            });
        }
        Ok(resp)
    }

    pub fn ping(&self) -> Result<()> {
        self.get(&self.url("")).map(|_| ())
    }

    /// Digest and size of the manifest `name:tag`, and the digest of its only layer.
    pub fn manifest_digest(&self, name: &str, tag: &str) -> Result<ManifestInfo> {
        let url = self.url(&format!("{name}/manifests/{tag}"));
        let resp = check(
            &url,
            self.agent
                .get(&url)
                .set("Accept", MEDIA_TYPE_IMAGE_MANIFEST)
                .call(),
        )?;
        let header = |header: &'static str| {
            resp.header(header)
                .map(str::to_string)
                .ok_or_else(|| OciError::Header {
                    url: url.clone(),
                    header,
                })
        };
        let digest = header("Docker-Content-Digest")?;
        let size = header("Content-Length")?
            .parse::<u64>()
            .map_err(|_| OciError::Header {
                url: url.clone(),
                header: "Content-Length",
            })?;
        let manifest: ImageManifest = from_json(&url, &read_body(resp)?)?;
        match &manifest.layers[..] {
            [layer] => Ok(ManifestInfo {
                digest,
                size,
                layer_digest: layer.digest.clone(),
            }),
            layers => Err(OciError::Layers(url, layers.len())),
        }
    }

    /// The raw manifest `name:reference`.
    pub fn fetch_manifest(&self, name: &str, reference: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("{name}/manifests/{reference}"));
        let resp = check(
            &url,
            self.agent
                .get(&url)
                .set("Accept", MEDIA_TYPE_IMAGE_MANIFEST)
                .call(),
        )?;
        read_body(resp)
    }

    pub fn referrers(&self, name: &str, digest: &str, artifact_type: &str) -> Result<Index> {
        let url = self.url(&format!(
            "{name}/referrers/{digest}?artifactType={artifact_type}"
        ));
        from_json(&url, &read_body(self.get(&url)?)?)
    }

    pub fn fetch_blob(&self, name: &str, digest: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("{name}/blobs/{digest}"));
        let data = read_body(self.get(&url)?)?;
        let found = sha256_digest(&data);
        if digest.starts_with("sha256:") && found != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                found,
            });
        }
        Ok(data)
    }

    /// Monolithic blob upload. Returns the blob's digest.
    pub fn post_blob(&self, name: &str, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        let url = self.url(&format!("{name}/blobs/uploads/?digest={digest}"));
        let resp = check(
            &url,
            self.agent
                .post(&url)
                .set("Content-Type", "application/octet-stream")
                .send_bytes(data),
        )?;
        if resp.status() != 201 {
            return Err(OciError::Status {
                url,
                status: resp.status(),
            });
        }
        Ok(digest)
    }

    /// Upload `manifest` as `name:reference`, returning its descriptor.
    pub fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> Result<Descriptor> {
        self.put_manifest_bytes(name, reference, &to_json("manifest", manifest)?)
    }

    /// Upload an already serialized manifest, keeping its digest.
    pub fn put_manifest_bytes(&self, name: &str, reference: &str, body: &[u8]) -> Result<Descriptor> {
        let url = self.url(&format!("{name}/manifests/{reference}"));
        let resp = check(
            &url,
            self.agent
                .put(&url)
                .set("Content-Type", MEDIA_TYPE_IMAGE_MANIFEST)
                .send_bytes(body),
        )?;
        if resp.status() != 201 {
            return Err(OciError::Status {
                url,
                status: resp.status(),
            });
        }
        Ok(Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, body))
    }

    /// The first layer of the first `artifact_type` referrer of `digest`.
    pub fn fetch_artifact(&self, name: &str, digest: &str, artifact_type: &str) -> Result<Vec<u8>> {
        let referrers = self.referrers(name, digest, artifact_type)?;
        if referrers.manifests.len() > 1 {
            log::warn!("multiple {artifact_type} referrers for {digest}, using the first");
        }
        let referrer = referrers
            .manifests
            .first()
            .ok_or_else(|| OciError::NoReferrer {
                artifact_type: artifact_type.to_string(),
                digest: digest.to_string(),
            })?;
        let manifest: ImageManifest =
            from_json(&referrer.digest, &self.fetch_blob(name, &referrer.digest)?)?;
        let layer = manifest
            .layers
            .first()
            .ok_or_else(|| OciError::Layers(referrer.digest.clone(), 0))?;
        self.fetch_blob(name, &layer.digest)
    }

    /// Fetch a published install manifest with its signature and certificate.
    pub fn fetch_install(&self, name: &str, tag: &str) -> Result<InstallArtifacts> {
        let info = self.manifest_digest(name, tag)?;
        Ok(InstallArtifacts {
            manifest: self.fetch_blob(name, &info.layer_digest)?,
            signature: self.fetch_artifact(name, &info.digest, SIGNATURE_ARTIFACT)?,
            cert: self.fetch_artifact(name, &info.digest, CERT_ARTIFACT)?,
        })
    }

    /// Publish an install manifest as `name:tag`, with the signature and
    /// certificate attached as referrers.
    pub fn publish_install(
        &self,
        name: &str,
        tag: &str,
        manifest: &Path,
        signature: &Path,
        cert: &Path,
    ) -> Result<Descriptor> {
        self.post_blob(name, EMPTY_CONFIG)?;
        let subject = self.put_manifest(
            name,
            tag,
            &ImageManifest::artifact(self.upload_file(name, manifest, INSTALL_ARTIFACT)?),
        )?;
        for (file, artifact_type) in [(signature, SIGNATURE_ARTIFACT), (cert, CERT_ARTIFACT)] {
            let mut artifact =
                ImageManifest::artifact(self.upload_file(name, file, artifact_type)?);
            artifact.artifact_type = Some(artifact_type.to_string());
            artifact.subject = Some(subject.clone());
            let body = to_json("manifest", &artifact)?;
            self.put_manifest(name, &sha256_digest(&body), &artifact)?;
        }
        log::info!("published {name}:{tag} to {}", self.addr);
        Ok(subject)
    }

    fn upload_file(&self, name: &str, file: &Path, media_type: &str) -> Result<Descriptor> {
        let data = paths::read(file)?;
        self.post_blob(name, &data)?;
        let title = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Descriptor::of(media_type, &data).with_annotation(ANNOTATION_TITLE, &title))
    }

    /// Copy the image `name:tag` and its blobs to `dest` as `dest_name:dest_tag`.
    /// The manifest is sent byte for byte so its digest is unchanged.
    pub fn copy_image_to(
        &self,
        name: &str,
        tag: &str,
        dest: &DistRepo,
        dest_name: &str,
        dest_tag: &str,
    ) -> Result<Descriptor> {
        let body = self.fetch_manifest(name, tag)?;
        let manifest: ImageManifest = from_json(&format!("{name}:{tag}"), &body)?;
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            dest.post_blob(dest_name, &self.fetch_blob(name, &blob.digest)?)?;
        }
        let desc = dest.put_manifest_bytes(dest_name, dest_tag, &body)?;
        log::info!(
            "copied {name}:{tag} from {} to {}/{dest_name}:{dest_tag}",
            self.addr,
            dest.addr
        );
        Ok(desc)
    }

    /// Pull the image `name:tag` with all its blobs into `layout` as `dest_ref`.
    pub fn pull_image(&self, name: &str, tag: &str, layout: &OciLayout, dest_ref: &str) -> Result<Descriptor> {
        let body = self.fetch_manifest(name, tag)?;
        let manifest: ImageManifest = from_json(&format!("{name}:{tag}"), &body)?;
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if !layout.has_blob(&blob.digest) {
                layout.write_blob(&self.fetch_blob(name, &blob.digest)?)?;
            }
        }
        layout.write_blob(&body)?;
        let desc = Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &body);
        layout.tag(&desc, dest_ref)?;
        log::info!("pulled {name}:{tag} from {}", self.addr);
        Ok(desc)
    }

    /// Push the image `reference` of `layout` with its blobs as `name:tag`.
    pub fn push_image(&self, layout: &OciLayout, reference: &str, name: &str, tag: &str) -> Result<Descriptor> {
        let desc = layout.resolve(reference)?;
        let body = layout.read_blob(&desc.digest)?;
        let manifest: ImageManifest = from_json(reference, &body)?;
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            self.post_blob(name, &layout.read_blob(&blob.digest)?)?;
        }
        let desc = self.put_manifest_bytes(name, tag, &body)?;
        log::info!("pushed {reference} from {} to {}/{name}:{tag}", layout.path().display(), self.addr);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn empty_config_digest() {
        assert_eq!(sha256_digest(EMPTY_CONFIG), EMPTY_DIGEST);
    }

    #[test]
    fn url_helpers() -> Result<()> {
        assert_eq!(drop_url_prefix("docker://10.0.2.2:5000/a"), "10.0.2.2:5000/a");
        assert_eq!(drop_url_prefix("http://h/a"), "h/a");
        assert_eq!(drop_url_prefix("oci:/x"), "oci:/x");
        assert_eq!(drop_hash_prefix("sha256:abc"), "abc");
        assert_eq!(drop_hash_prefix("sha512:abc"), "abc");
        assert_eq!(registry_scheme("127.0.0.1:20001"), "http");
        assert_eq!(registry_scheme("10.0.2.2:5000"), "http");
        assert_eq!(registry_scheme("localhost:5000"), "http");
        assert_eq!(registry_scheme("[::1]:5000"), "http");
        assert_eq!(registry_scheme("zothub.io"), "https");
        assert_eq!(registry_scheme("registry.example.com:443"), "https");

        let url = DistUrl::parse("docker://127.0.0.1:18080/machine/install:1.0.0")?;
        assert_eq!(
            url,
            DistUrl {
                addr: "127.0.0.1:18080".into(),
                name: "machine/install".into(),
                tag: "1.0.0".into(),
            }
        );
        for bad in ["docker://host", "host/name", "host/:tag", "/name:tag"] {
            assert!(DistUrl::parse(bad).is_err(), "{bad}");
        }
        Ok(())
    }

    fn image(layout: &OciLayout, content: &[u8]) -> Result<Descriptor> {
        let layer = layout.write_blob(content)?;
        layout.write_blob(EMPTY_CONFIG)?;
        let manifest = ImageManifest::artifact(Descriptor {
            digest: layer,
            ..Descriptor::of("application/vnd.oci.image.layer.v1.tar", content)
        });
        let body = serde_json::to_vec(&manifest)?;
        layout.write_blob(&body)?;
        Ok(Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &body))
    }

    #[test]
    fn layout_tag_and_copy() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = OciLayout::create(&tmp.path().join("src"))?;
        assert!(OciLayout::open(&tmp.path().join("src")).is_ok());
        assert!(matches!(
            OciLayout::open(tmp.path()),
            Err(OciError::NotLayout(_))
        ));

        let v1 = image(&src, b"one")?;
        let v2 = image(&src, b"two")?;
        src.tag(&v1, "svc:1.0")?;
        src.tag(&v2, "svc:1.0")?;
        assert_eq!(src.index()?.manifests.len(), 1);
        assert_eq!(src.resolve("svc:1.0")?.digest, v2.digest);
        assert!(matches!(
            src.resolve("svc:2.0"),
            Err(OciError::NoImage { .. })
        ));

        let dest = OciLayout::create(&tmp.path().join("dest"))?;
        let copied = src.copy_image("svc:1.0", &dest, "1.0")?;
        assert_eq!(copied.digest, v2.digest);
        assert_eq!(dest.resolve("1.0")?.digest, v2.digest);
        let manifest = dest.read_manifest(&copied)?;
        assert_eq!(dest.read_blob(&manifest.layers[0].digest)?, b"two");
        Ok(())
    }

    #[test]
    fn corrupt_blob_detected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = OciLayout::create(tmp.path())?;
        let digest = layout.write_blob(b"data")?;
        std::fs::write(layout.blob_path(&digest)?, b"tampered")?;
        assert!(matches!(
            layout.read_blob(&digest),
            Err(OciError::DigestMismatch { .. })
        ));
        assert!(matches!(
            layout.blob_path("md5:abcd"),
            Err(OciError::Digest(_))
        ));
        Ok(())
    }

    #[test]
    fn artifact_manifest_shape() -> Result<()> {
        let mut m = ImageManifest::artifact(
            Descriptor::of(SIGNATURE_ARTIFACT, b"sig").with_annotation(ANNOTATION_TITLE, "install.yaml.signed"),
        );
        m.artifact_type = Some(SIGNATURE_ARTIFACT.into());
        let json: serde_json::Value = serde_json::from_slice(&serde_json::to_vec(&m)?)?;
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["config"]["digest"], EMPTY_DIGEST);
        assert_eq!(json["config"]["size"], 2);
        assert_eq!(json["artifactType"], SIGNATURE_ARTIFACT);
        assert_eq!(
            json["layers"][0]["annotations"][ANNOTATION_TITLE],
            "install.yaml.signed"
        );
        assert!(json.get("subject").is_none());
        Ok(())
    }
}
