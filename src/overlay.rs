use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use nix::unistd::{chdir, chroot};
use tracing::{debug, trace};

use crate::model::ImageLayer;

/// Per-container overlay tree: a writable upper layer atop the image's
/// read-only layers, with hardlinked volumes as an extra bottom layer.
pub struct ContainerFs {
    pub upper: PathBuf,
    pub workdir: PathBuf,
    pub chroot_dir: PathBuf,
    pub volumes: PathBuf,
}

impl ContainerFs {
    pub fn prepare(container_dir: &Path) -> Result<Self> {
        let fs = Self {
            upper: container_dir.join("upper"),
            workdir: container_dir.join("workdir"),
            chroot_dir: container_dir.join("chroot"),
            volumes: container_dir.join("volumes"),
        };
        for dir in [&fs.upper, &fs.workdir, &fs.chroot_dir, &fs.volumes] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(fs)
    }

    /// Materialize a `source:target` volume by hardlinking the source file
    /// under the volumes layer.
    pub fn link_volume(&self, spec: &str) -> Result<()> {
        let Some((source, target)) = spec.split_once(':') else {
            bail!("volume {spec:?} is not source:target");
        };
        let target = self.volumes.join(target.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::hard_link(source, &target)
            .with_context(|| format!("linking {source} into {}", target.display()))?;
        trace!("volume {source} -> {}", target.display());
        Ok(())
    }

    /// The overlay data string: lower layers are listed top-to-bottom (the
    /// last applied image layer first), with the volumes layer at the very
    /// bottom when present.
    fn mount_data(&self, layers: &[ImageLayer], with_volumes: bool) -> String {
        let mut lower: Vec<String> = layers
            .iter()
            .rev()
            .map(|layer| layer.path.display().to_string())
            .collect();
        if with_volumes {
            lower.push(self.volumes.display().to_string());
        }
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            self.upper.display(),
            self.workdir.display(),
        )
    }

    /// Mount the overlay. Must run inside the mount namespace owned by the
    /// supervised process tree; mounting on the host would leak the mount.
    pub fn mount(&self, layers: &[ImageLayer], with_volumes: bool) -> Result<()> {
        let data = self.mount_data(layers, with_volumes);
        debug!("mounting overlay: {data}");
        nix::mount::mount(
            Some("overlay"),
            &self.chroot_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_context(|| format!("mounting overlay at {}", self.chroot_dir.display()))?;
        Ok(())
    }

    /// Change root into the merged tree.
    pub fn enter(&self) -> Result<()> {
        chroot(&self.chroot_dir)
            .with_context(|| format!("chroot to {}", self.chroot_dir.display()))?;
        chdir("/").context("chdir to /")?;
        Ok(())
    }
}

/// Remove a container directory out of process. Unmount and unlink
/// sequencing in the same process is unreliable while layers may still be
/// referenced, so this shells out.
pub fn remove_tree(container_dir: &Path) -> Result<()> {
    let status = Command::new("rm")
        .arg("-rf")
        .arg(container_dir)
        .status()
        .context("running rm")?;
    if !status.success() {
        bail!("rm -rf {} failed: {status}", container_dir.display());
    }
    Ok(())
}
