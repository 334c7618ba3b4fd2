use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Content identifier, textually `sha256:<hex>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Digest(pub String);

impl Digest {
    /// The hex part without the algorithm prefix, used for directory names.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
    }

    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type MediaType = String;

fn default_expires_in() -> u64 {
    300
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PullToken {
    pub token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    pub issued_at: DateTime<Utc>,
}

impl PullToken {
    // expire tokens 60 seconds before they normally would, so that
    // they are still usable for enough time for us to actually use them
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.expires_in as i64 - 60)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at()
    }
}

impl fmt::Display for PullToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// An image manifest. Layer order is significant: index 0 is the bottom layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Manifest {
    pub registry: String,
    pub name: String,
    pub digest: Digest,
    pub config: (Digest, MediaType),
    pub layers: Vec<(Digest, MediaType)>,
}

/// The `config` object inside an image config blob.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RunConfig {
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,
}

/// An image config blob, plus the uid/gid sets discovered after pull.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub config: RunConfig,
    pub rootfs: serde_json::Value,
    pub history: serde_json::Value,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageLayer {
    pub digest: Digest,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub registry: String,
    pub manifest: Manifest,
    pub config: ImageConfig,
    pub layers: Vec<ImageLayer>,
}

/// The images.json index record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageSummary {
    pub digest: Digest,
    pub registry: String,
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Container {
    pub id: String,
    pub pid: Option<i32>,
    pub image_registry: String,
    pub image_name: String,
}

/// Launch parameters for `run`.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image_name: String,
    pub entrypoint: Option<String>,
    pub command: Option<String>,
    pub name: Option<String>,
    pub daemon: bool,
    pub remove: bool,
    pub volumes: Vec<String>,
}

/// Ids found in the merged rootfs by the pre-flight child, written to
/// `containers/<id>/container.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DiscoveredIds {
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
}
