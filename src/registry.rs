use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::model::{Digest, Image, ImageConfig, ImageLayer, Manifest, MediaType, PullToken};
use crate::storage::FileStorage;

pub const DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";
pub const DOCKER_AUTH_URL: &str = "https://auth.docker.io";
pub const DOCKER_REGISTRY: &str = "docker.io";

const MANIFEST_INDEX_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.oci.image.index.v1+json";
const TARGET_ARCHITECTURE: &str = "amd64";

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
}

#[derive(Deserialize)]
struct IndexEntry {
    digest: Digest,
    #[serde(rename = "mediaType")]
    media_type: MediaType,
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct IndexResponse {
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct BlobRef {
    digest: Digest,
    #[serde(rename = "mediaType")]
    media_type: MediaType,
}

#[derive(Deserialize)]
struct ManifestResponse {
    config: BlobRef,
    layers: Vec<BlobRef>,
}

/// OCI Distribution v2 client with bearer-token auth. Endpoints are
/// configurable so tests can point at a stub.
pub struct RegistryClient {
    http: reqwest::blocking::Client,
    registry_url: String,
    auth_url: String,
}

impl RegistryClient {
    pub fn docker() -> Self {
        Self::with_endpoints(DOCKER_REGISTRY_URL, DOCKER_AUTH_URL)
    }

    pub fn with_endpoints(registry_url: &str, auth_url: &str) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            registry_url: registry_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
        }
    }

    /// Cached token, or a fresh one from the auth endpoint. Expired tokens
    /// were already dropped at read time, which makes refresh silent.
    fn pull_token(&self, storage: &FileStorage, repo: &str) -> Result<PullToken> {
        if let Some(token) = storage.pull_token(DOCKER_REGISTRY, repo)? {
            return Ok(token);
        }

        let url = format!(
            "{}/token?service=registry.docker.io&scope=repository:{repo}:pull",
            self.auth_url,
        );
        let resp: TokenResponse = self
            .http
            .get(url)
            .send()
            .context("requesting pull token")?
            .error_for_status()
            .context("pull token request rejected")?
            .json()
            .context("parsing pull token")?;

        let token = PullToken {
            token: resp.token,
            expires_in: resp.expires_in.unwrap_or(300),
            issued_at: resp.issued_at.unwrap_or_else(Utc::now),
        };
        storage.store_pull_token(DOCKER_REGISTRY, repo, &token)?;
        Ok(token)
    }

    /// Resolve a tag through the manifest index, selecting the amd64
    /// platform entry.
    fn find_image_digest(
        &self,
        repo: &str,
        tag: &str,
        token: &PullToken,
    ) -> Result<(Digest, MediaType)> {
        let index: IndexResponse = self
            .http
            .get(format!("{}/v2/{repo}/manifests/{tag}", self.registry_url))
            .header("Accept", MANIFEST_INDEX_ACCEPT)
            .bearer_auth(token)
            .send()
            .context("requesting manifest index")?
            .error_for_status()
            .context("manifest index request rejected")?
            .json()
            .context("parsing manifest index")?;

        index
            .manifests
            .into_iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|platform| platform.architecture == TARGET_ARCHITECTURE)
            })
            .map(|entry| (entry.digest, entry.media_type))
            .ok_or_else(|| anyhow!("manifest for {TARGET_ARCHITECTURE} not found"))
    }

    fn manifest(
        &self,
        storage: &FileStorage,
        repo: &str,
        digest: &Digest,
        media_type: Option<&str>,
        tags: &[String],
        token: &PullToken,
    ) -> Result<Manifest> {
        if let Some(manifest) = storage.manifest(digest)? {
            return Ok(manifest);
        }

        let mut request = self
            .http
            .get(format!("{}/v2/{repo}/manifests/{digest}", self.registry_url))
            .bearer_auth(token);
        if let Some(media_type) = media_type {
            request = request.header("Accept", media_type);
        }
        let resp: ManifestResponse = request
            .send()
            .context("requesting manifest")?
            .error_for_status()
            .context("manifest request rejected")?
            .json()
            .context("parsing manifest")?;

        let manifest = Manifest {
            registry: DOCKER_REGISTRY.to_string(),
            name: repo.to_string(),
            digest: digest.clone(),
            config: (resp.config.digest, resp.config.media_type),
            layers: resp
                .layers
                .into_iter()
                .map(|layer| (layer.digest, layer.media_type))
                .collect(),
        };
        storage.store_manifest(&manifest, tags)?;
        Ok(manifest)
    }

    fn fetch_blob(&self, repo: &str, digest: &Digest, accept: &str, token: &PullToken) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(format!("{}/v2/{repo}/blobs/{digest}", self.registry_url))
            .header("Accept", accept)
            .bearer_auth(token)
            .send()
            .with_context(|| format!("requesting blob {digest}"))?
            .error_for_status()
            .with_context(|| format!("blob request for {digest} rejected"))?;
        Ok(resp.bytes().context("reading blob")?.to_vec())
    }

    fn image_config(
        &self,
        storage: &FileStorage,
        manifest: &Manifest,
        token: &PullToken,
    ) -> Result<ImageConfig> {
        if let Some(config) = storage.image_config(manifest)? {
            return Ok(config);
        }
        let (digest, media_type) = &manifest.config;
        let blob = self.fetch_blob(&manifest.name, digest, media_type, token)?;
        let config: ImageConfig =
            serde_json::from_slice(&blob).context("parsing image config")?;
        storage.store_image_config(manifest, &config)?;
        Ok(config)
    }

    fn image_layers(
        &self,
        storage: &FileStorage,
        manifest: &Manifest,
        token: &PullToken,
    ) -> Result<Vec<ImageLayer>> {
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (digest, media_type) in &manifest.layers {
            let layer = match storage.image_layer(manifest, digest) {
                Some(layer) => layer,
                None => {
                    debug!("fetching layer {}", digest.short());
                    let blob = self.fetch_blob(&manifest.name, digest, media_type, token)?;
                    storage.store_image_layer(manifest, digest, &blob)?
                }
            };
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Fetch manifest, config and layers for `repo` at `reference`, going
    /// to the network only for pieces the store is missing. A digest
    /// reference skips tag resolution.
    pub fn pull(&self, storage: &FileStorage, repo: &str, reference: &str) -> Result<Image> {
        let token = self.pull_token(storage, repo)?;

        let (digest, media_type, tags) = if reference.starts_with("sha256:") {
            (Digest(reference.to_string()), None, Vec::new())
        } else {
            match storage.lookup_tag(DOCKER_REGISTRY, repo, reference)? {
                Some(digest) => (digest, None, vec![reference.to_string()]),
                None => {
                    let (digest, media_type) =
                        self.find_image_digest(repo, reference, &token)?;
                    (digest, Some(media_type), vec![reference.to_string()])
                }
            }
        };

        let manifest = self.manifest(
            storage,
            repo,
            &digest,
            media_type.as_deref(),
            &tags,
            &token,
        )?;
        let config = self.image_config(storage, &manifest, &token)?;
        let layers = self.image_layers(storage, &manifest, &token)?;
        info!("pulled {repo}:{reference} ({})", manifest.digest.short());

        Ok(Image {
            registry: DOCKER_REGISTRY.to_string(),
            manifest,
            config,
            layers,
        })
    }
}

/// Split `repo[:tag]`, defaulting the tag to `latest`. A `sha256:` digest
/// reference is passed through whole.
pub fn split_reference(name: &str) -> (String, String) {
    if let Some((repo, digest)) = name.split_once("@") {
        return (repo.to_string(), digest.to_string());
    }
    match name.split_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (name.to_string(), "latest".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_splitting() {
        assert_eq!(
            split_reference("library/alpine"),
            ("library/alpine".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("library/alpine:3.19"),
            ("library/alpine".to_string(), "3.19".to_string())
        );
        assert_eq!(
            split_reference("library/alpine@sha256:abcd"),
            ("library/alpine".to_string(), "sha256:abcd".to_string())
        );
    }
}
