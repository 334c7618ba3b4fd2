use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::model::{
    Container, Digest, ImageConfig, ImageLayer, ImageSummary, Manifest, PullToken,
};
use crate::overlay;

const DEFAULT_BASE: &str = ".carton";

type TokenMap = HashMap<String, HashMap<String, PullToken>>;
type ImageIndex = HashMap<String, ImageSummary>;

/// Content-addressed file store under the base path (default `~/.carton`).
/// Manifests, configs and extracted layers are immutable once written,
/// keyed by digest; the JSON indexes are rewritten in full on mutation.
pub struct FileStorage {
    base: PathBuf,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_str(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

// atomic write: land fully on disk, then rename into place
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

impl FileStorage {
    pub fn open(base: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base).with_context(|| format!("creating {}", base.display()))?;
        Ok(Self { base })
    }

    pub fn open_default() -> Result<Self> {
        let home = std::env::var_os("HOME").context("HOME is not set")?;
        Self::open(PathBuf::from(home).join(DEFAULT_BASE))
    }

    fn images_index_path(&self) -> PathBuf {
        self.base.join("images.json")
    }

    fn tokens_path(&self) -> PathBuf {
        self.base.join("pull_tokens.json")
    }

    fn containers_path(&self) -> PathBuf {
        self.base.join("containers.json")
    }

    fn image_dir(&self, digest: &Digest) -> PathBuf {
        self.base.join("images").join(digest.hex())
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.base.join("containers").join(id)
    }

    // pull tokens

    /// Stored tokens found expired are deleted on read.
    pub fn pull_token(&self, registry: &str, repo: &str) -> Result<Option<PullToken>> {
        let Some(mut tokens) = read_json::<TokenMap>(&self.tokens_path())? else {
            return Ok(None);
        };
        let Some(token) = tokens.get(registry).and_then(|repos| repos.get(repo)) else {
            return Ok(None);
        };
        if token.is_expired() {
            trace!("dropping expired pull token for {registry}/{repo}");
            if let Some(repos) = tokens.get_mut(registry) {
                repos.remove(repo);
            }
            write_json(&self.tokens_path(), &tokens)?;
            return Ok(None);
        }
        Ok(Some(token.clone()))
    }

    pub fn store_pull_token(&self, registry: &str, repo: &str, token: &PullToken) -> Result<()> {
        let mut tokens = read_json::<TokenMap>(&self.tokens_path())?.unwrap_or_default();
        tokens
            .entry(registry.to_string())
            .or_default()
            .insert(repo.to_string(), token.clone());
        write_json(&self.tokens_path(), &tokens)
    }

    // images

    pub fn manifest(&self, digest: &Digest) -> Result<Option<Manifest>> {
        read_json(&self.image_dir(digest).join("manifest.json"))
    }

    /// Persist the manifest and upsert its images.json summary, merging in
    /// the tag the reference resolved from.
    pub fn store_manifest(&self, manifest: &Manifest, tags: &[String]) -> Result<()> {
        let dir = self.image_dir(&manifest.digest);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        write_json(&dir.join("manifest.json"), manifest)?;

        let mut index = read_json::<ImageIndex>(&self.images_index_path())?.unwrap_or_default();
        let summary = index
            .entry(manifest.digest.0.clone())
            .or_insert_with(|| ImageSummary {
                digest: manifest.digest.clone(),
                registry: manifest.registry.clone(),
                name: manifest.name.clone(),
                tags: Vec::new(),
            });
        for tag in tags {
            if !summary.tags.contains(tag) {
                summary.tags.push(tag.clone());
            }
        }
        write_json(&self.images_index_path(), &index)
    }

    pub fn image_config(&self, manifest: &Manifest) -> Result<Option<ImageConfig>> {
        read_json(&self.image_dir(&manifest.digest).join("config.json"))
    }

    pub fn store_image_config(&self, manifest: &Manifest, config: &ImageConfig) -> Result<()> {
        let dir = self.image_dir(&manifest.digest);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join("config.json"), config)
    }

    pub fn image_layer(&self, manifest: &Manifest, digest: &Digest) -> Option<ImageLayer> {
        let path = self
            .image_dir(&manifest.digest)
            .join("layers")
            .join(digest.hex());
        path.is_dir().then(|| ImageLayer {
            digest: digest.clone(),
            path,
        })
    }

    /// Extract a gzipped layer tarball into its content-addressed
    /// directory. The blob is fully in memory, so a failed download never
    /// reaches this point and the cache stays clean.
    pub fn store_image_layer(
        &self,
        manifest: &Manifest,
        digest: &Digest,
        blob: &[u8],
    ) -> Result<ImageLayer> {
        let path = self
            .image_dir(&manifest.digest)
            .join("layers")
            .join(digest.hex());
        fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;

        let mut archive = tar::Archive::new(GzDecoder::new(blob));
        archive.set_preserve_permissions(true);
        archive
            .unpack(&path)
            .with_context(|| format!("extracting layer {digest}"))?;
        debug!("extracted layer {} to {}", digest.short(), path.display());
        Ok(ImageLayer {
            digest: digest.clone(),
            path,
        })
    }

    pub fn image_index(&self) -> Result<Vec<ImageSummary>> {
        let index = read_json::<ImageIndex>(&self.images_index_path())?.unwrap_or_default();
        let mut summaries: Vec<ImageSummary> = index.into_values().collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Digest a `registry/repo:tag` reference resolves to, if cached.
    pub fn lookup_tag(&self, registry: &str, repo: &str, tag: &str) -> Result<Option<Digest>> {
        let index = read_json::<ImageIndex>(&self.images_index_path())?.unwrap_or_default();
        Ok(index
            .into_values()
            .find(|summary| {
                summary.registry == registry
                    && summary.name == repo
                    && summary.tags.iter().any(|t| t == tag)
            })
            .map(|summary| summary.digest))
    }

    // containers: a small ordered list, rewritten in full on each change

    pub fn containers(&self) -> Result<Vec<Container>> {
        Ok(read_json(&self.containers_path())?.unwrap_or_default())
    }

    pub fn container(&self, id: &str) -> Result<Option<Container>> {
        Ok(self
            .containers()?
            .into_iter()
            .find(|container| container.id == id))
    }

    pub fn store_container(&self, container: &Container) -> Result<()> {
        let mut containers = self.containers()?;
        match containers.iter_mut().find(|c| c.id == container.id) {
            Some(existing) => *existing = container.clone(),
            None => containers.push(container.clone()),
        }
        write_json(&self.containers_path(), &containers)
    }

    /// Drop the record and the container's directory tree.
    pub fn remove_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers()?;
        containers.retain(|container| container.id != id);
        write_json(&self.containers_path(), &containers)?;

        let dir = self.container_dir(id);
        if dir.exists() {
            overlay::remove_tree(&dir)?;
        }
        Ok(())
    }
}
