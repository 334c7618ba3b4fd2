use std::fs;

use anyhow::{bail, Result};
use tracing::debug;

use crate::model::{Image, ImageLayer};
use crate::registry::{split_reference, RegistryClient};
use crate::storage::FileStorage;

const REGISTRY_PREFIX: &str = "docker.io/";

/// Third colon-separated field of each passwd/group line.
pub(crate) fn parse_id_file(content: &str) -> Vec<u32> {
    let mut ids: Vec<u32> = content
        .lines()
        .filter_map(|line| line.split(':').nth(2))
        .filter_map(|field| field.parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn first_id_file(layers: &[ImageLayer], name: &str) -> Option<Vec<u32>> {
    // top-down: the topmost layer carrying the file wins
    for layer in layers.iter().rev() {
        let path = layer.path.join("etc").join(name);
        if let Ok(content) = fs::read_to_string(&path) {
            debug!("discovered ids from {}", path.display());
            return Some(parse_id_file(&content));
        }
    }
    None
}

/// Discover the uid/gid sets a container image will reference, from the
/// first layer (top-down) that carries /etc/passwd and /etc/group.
pub fn discover_image_ids(layers: &[ImageLayer]) -> (Vec<u32>, Vec<u32>) {
    let uids = first_id_file(layers, "passwd").unwrap_or_default();
    let gids = first_id_file(layers, "group").unwrap_or_default();
    (uids, gids)
}

/// Resolve `docker.io/<repo>[:<tag>]` to a stored image, pulling whatever
/// pieces the store is missing. After a fresh pull the discovered id sets
/// are persisted into the stored config.
pub fn resolve(storage: &FileStorage, client: &RegistryClient, name: &str) -> Result<Image> {
    let Some(reference) = name.strip_prefix(REGISTRY_PREFIX) else {
        bail!("unknown image reference: {name}");
    };
    let (repo, reference) = split_reference(reference);

    let mut image = client.pull(storage, &repo, &reference)?;

    if image.config.uids.is_empty() && image.config.gids.is_empty() {
        let (uids, gids) = discover_image_ids(&image.layers);
        image.config.uids = uids;
        image.config.gids = gids;
        storage.store_image_config(&image.manifest, &image.config)?;
    }
    Ok(image)
}

pub fn cmd_pull(storage: &FileStorage, client: &RegistryClient, names: &[String]) -> Result<()> {
    for name in names {
        let image = resolve(storage, client, name)?;
        println!(
            "{}: {}",
            name,
            image.manifest.digest,
        );
    }
    Ok(())
}

pub fn cmd_images(storage: &FileStorage) -> Result<()> {
    let summaries = storage.image_index()?;
    println!("{:<14} {:<10} {:<30} TAGS", "DIGEST", "REGISTRY", "NAME");
    for summary in summaries {
        println!(
            "{:<14} {:<10} {:<30} {}",
            summary.digest.short(),
            summary.registry,
            summary.name,
            summary.tags.join(","),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Digest;
    use std::path::{Path, PathBuf};

    fn layer_with(dir: &Path, name: &str, passwd: Option<&str>, group: Option<&str>) -> ImageLayer {
        let root = dir.join(name);
        fs::create_dir_all(root.join("etc")).unwrap();
        if let Some(content) = passwd {
            fs::write(root.join("etc/passwd"), content).unwrap();
        }
        if let Some(content) = group {
            fs::write(root.join("etc/group"), content).unwrap();
        }
        ImageLayer {
            digest: Digest(format!("sha256:{name}")),
            path: root,
        }
    }

    #[test]
    fn parses_third_field() {
        let ids = parse_id_file("root:x:0:0:root:/root:/bin/sh\nguest:x:405:100::/:/sbin/nologin\nbad:line\n");
        assert_eq!(ids, vec![0, 405]);
    }

    #[test]
    fn topmost_layer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let bottom = layer_with(dir.path(), "bottom", Some("root:x:0:0::/:/bin/sh\n"), None);
        let top = layer_with(
            dir.path(),
            "top",
            Some("root:x:0:0::/:/bin/sh\napp:x:1234:1234::/:/bin/sh\n"),
            Some("root:x:0:\nwheel:x:10:\n"),
        );

        let (uids, gids) = discover_image_ids(&[bottom, top]);
        assert_eq!(uids, vec![0, 1234]);
        assert_eq!(gids, vec![0, 10]);
    }

    #[test]
    fn missing_files_give_empty_sets() {
        let layer = ImageLayer {
            digest: Digest("sha256:x".to_string()),
            path: PathBuf::from("/nonexistent"),
        };
        let (uids, gids) = discover_image_ids(&[layer]);
        assert!(uids.is_empty());
        assert!(gids.is_empty());
    }
}
