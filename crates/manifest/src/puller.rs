//! Artifact pulling: OCI registries over HTTP, or a local directory tree.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{parse, Manifest};

const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// A pulled artifact's files. Scratch directories are removed when this is dropped.
#[derive(Debug)]
pub struct Artifact {
    dir: PathBuf,
    _scratch: Option<tempfile::TempDir>,
}

impl Artifact {
    /// A directory owned by someone else; left in place on drop.
    pub fn borrowed(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into(), _scratch: None } }

    fn scratch(dir: tempfile::TempDir) -> Self { Self { dir: dir.path().to_path_buf(), _scratch: Some(dir) } }

    pub fn path(&self) -> &Path { &self.dir }
}

/// Fetches an artifact by path and tag into a local directory.
#[async_trait::async_trait]
pub trait ArtifactPuller: Send + Sync {
    async fn load(&self, path: &str, tag: &str) -> Result<Artifact>;
}

/// Where the extension manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Inline manifest document, used instead of pulling.
    Override(String),
    Remote { path: String, tag: String },
}

/// Resolve and parse the manifest.
pub async fn resolve(source: &ManifestSource, puller: &dyn ArtifactPuller) -> Result<Manifest> {
    match source {
        ManifestSource::Override(doc) => {
            info!("using manifest override");
            Ok(parse(doc)?)
        }
        ManifestSource::Remote { path, tag } => {
            let artifact = puller.load(path, tag).await.with_context(|| format!("pulling manifest {}:{}", path, tag))?;
            let files = yaml_files(artifact.path()).await?;
            let first = files.first().ok_or_else(|| anyhow!("manifest artifact {}:{} has no yaml file", path, tag))?;
            let doc = tokio::fs::read_to_string(first).await.with_context(|| format!("reading {}", first.display()))?;
            info!(path = %path, tag = %tag, file = %first.display(), "manifest pulled");
            Ok(parse(&doc)?)
        }
    }
}

/// `*.yaml` / `*.yml` files directly under `dir`, sorted by name.
pub async fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await.with_context(|| format!("listing {}", dir.display()))?;
    while let Some(entry) = rd.next_entry().await? {
        let p = entry.path();
        let is_yaml = matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        if is_yaml && entry.file_type().await?.is_file() {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

// ---- local ----

/// Resolves `<root>/<path>/<tag>`; for air-gapped installs and tests.
pub struct LocalPuller {
    root: PathBuf,
}

impl LocalPuller {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

#[async_trait::async_trait]
impl ArtifactPuller for LocalPuller {
    async fn load(&self, path: &str, tag: &str) -> Result<Artifact> {
        let dir = self.root.join(path.trim_matches('/')).join(tag);
        let meta = tokio::fs::metadata(&dir).await.with_context(|| format!("artifact {}:{} not found under {}", path, tag, self.root.display()))?;
        if !meta.is_dir() {
            bail!("artifact {}:{} is not a directory", path, tag);
        }
        Ok(Artifact::borrowed(dir))
    }
}

// ---- OCI ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciManifest {
    #[serde(default)]
    layers: Vec<OciDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    digest: String,
    #[serde(default)]
    annotations: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Pulls OCI artifacts (one file per layer, named by the title annotation)
/// from a registry speaking the distribution v2 API. Anonymous bearer
/// challenges are answered automatically.
pub struct OciPuller {
    base_url: String,
    http: reqwest::Client,
    work_dir: PathBuf,
}

impl OciPuller {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url: base_url.into(), http, work_dir: std::env::temp_dir() }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn url(&self, suffix: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if base.starts_with("http://") || base.starts_with("https://") { base.to_string() } else { format!("https://{}", base) };
        format!("{}/v2/{}", base, suffix)
    }

    async fn get(&self, url: &str, accept: Option<&str>) -> Result<reqwest::Response> {
        let mut req = self.http.get(url);
        if let Some(a) = accept { req = req.header(reqwest::header::ACCEPT, a); }
        let resp = req.send().await.with_context(|| format!("GET {}", url))?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let challenge = resp
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("GET {} unauthorized without challenge", url))?;
        let token = self.anonymous_token(&challenge).await?;
        let mut req = self.http.get(url).bearer_auth(token);
        if let Some(a) = accept { req = req.header(reqwest::header::ACCEPT, a); }
        req.send().await.with_context(|| format!("GET {} (authorized)", url))
    }

    async fn anonymous_token(&self, challenge: &str) -> Result<String> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| anyhow!("unsupported auth challenge: {}", challenge))?;
        let realm = params.iter().find(|(k, _)| k == "realm").map(|(_, v)| v.clone()).ok_or_else(|| anyhow!("auth challenge without realm"))?;
        let query: Vec<(String, String)> = params.into_iter().filter(|(k, _)| k != "realm").collect();
        let resp = self.http.get(&realm).query(&query).send().await.context("requesting registry token")?;
        if !resp.status().is_success() {
            bail!("registry token request failed ({})", resp.status());
        }
        let tok: TokenResponse = resp.json().await.context("decoding registry token")?;
        tok.token.or(tok.access_token).ok_or_else(|| anyhow!("registry token response without token"))
    }
}

/// Parse `Bearer realm="..",service="..",scope=".."` into key/value pairs.
fn parse_bearer_challenge(h: &str) -> Option<Vec<(String, String)>> {
    let rest = h.trim().strip_prefix("Bearer ")?;
    let mut out = Vec::new();
    let mut s = rest.trim();
    while !s.is_empty() {
        let (key, after) = s.split_once('=')?;
        let after = after.trim_start();
        let (val, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after.find(',') {
                Some(i) => (&after[..i], &after[i..]),
                None => (after, ""),
            }
        };
        out.push((key.trim().to_string(), val.to_string()));
        s = tail.trim_start().trim_start_matches(',').trim_start();
    }
    Some(out)
}

fn safe_file_name(title: &str) -> Option<&str> {
    let ok = !title.is_empty() && title != "." && title != ".." && !title.contains('/') && !title.contains('\\');
    ok.then_some(title)
}

#[async_trait::async_trait]
impl ArtifactPuller for OciPuller {
    async fn load(&self, path: &str, tag: &str) -> Result<Artifact> {
        let t0 = Instant::now();
        counter!("artifact_pulls_total", 1u64);
        let repo = path.trim_matches('/');
        let manifest_url = self.url(&format!("{}/manifests/{}", repo, tag));
        let resp = self.get(&manifest_url, Some(OCI_MANIFEST)).await?;
        if !resp.status().is_success() {
            bail!("artifact {}:{} manifest fetch failed ({})", repo, tag, resp.status());
        }
        let manifest: OciManifest = resp.json().await.context("decoding OCI manifest")?;

        tokio::fs::create_dir_all(&self.work_dir).await.with_context(|| format!("creating {}", self.work_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("tenant-artifact-")
            .tempdir_in(&self.work_dir)
            .with_context(|| format!("creating scratch dir under {}", self.work_dir.display()))?;
        let dir = scratch.path().to_path_buf();
        let mut written = 0usize;
        for layer in manifest.layers.iter() {
            let Some(name) = layer.annotations.get(TITLE_ANNOTATION).and_then(|t| safe_file_name(t)) else {
                debug!(digest = %layer.digest, "skipping layer without usable title");
                continue;
            };
            let blob_url = self.url(&format!("{}/blobs/{}", repo, layer.digest));
            let resp = self.get(&blob_url, None).await?;
            if !resp.status().is_success() {
                bail!("blob {} fetch failed ({})", layer.digest, resp.status());
            }
            let bytes = resp.bytes().await.context("reading blob")?;
            tokio::fs::write(dir.join(name), &bytes).await.with_context(|| format!("writing {}", name))?;
            written += 1;
        }
        histogram!("artifact_pull_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(repo = %repo, tag = %tag, files = written, took_ms = %t0.elapsed().as_millis(), "artifact pulled");
        Ok(Artifact::scratch(scratch))
    }
}
