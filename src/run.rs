use std::ffi::CString;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::execvpe;
use tracing::{debug, info, warn};

use crate::barrier::ForkBarrier;
use crate::idmap::IdMapper;
use crate::images;
use crate::model::{Container, ContainerConfig, DiscoveredIds, Image};
use crate::net::{stack, tun};
use crate::overlay::ContainerFs;
use crate::registry::RegistryClient;
use crate::storage::FileStorage;

const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

fn container_namespaces() -> CloneFlags {
    CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWCGROUP
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
}

fn generate_id() -> Result<String> {
    use std::io::Read;
    let mut bytes = [0u8; 6];
    fs::File::open("/dev/urandom")
        .and_then(|mut urandom| urandom.read_exact(&mut bytes))
        .context("reading /dev/urandom")?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// The command line the init will exec. An entrypoint override is joined
/// with the command override and split with shell-quoting rules; without
/// one, the image's Entrypoint (falling back to the head of Cmd) runs with
/// the rest of Cmd appended, and the command override has no effect.
fn derive_command(config: &ContainerConfig, image: &Image) -> Result<Vec<String>> {
    if let Some(entrypoint) = &config.entrypoint {
        let joined = match &config.command {
            Some(command) => format!("{entrypoint} {command}"),
            None => entrypoint.clone(),
        };
        return shlex::split(&joined)
            .filter(|argv| !argv.is_empty())
            .with_context(|| format!("unparsable entrypoint: {joined:?}"));
    }

    let run_config = &image.config.config;
    let entrypoint = run_config.entrypoint.clone().unwrap_or_default();
    let cmd = run_config.cmd.clone().unwrap_or_default();

    let argv: Vec<String> = if entrypoint.is_empty() {
        cmd
    } else {
        entrypoint.into_iter().chain(cmd).collect()
    };
    if argv.is_empty() {
        bail!("image defines no entrypoint or command");
    }
    Ok(argv)
}

fn container_env(image: &Image) -> Vec<String> {
    image
        .config
        .config
        .env
        .clone()
        .unwrap_or_else(|| vec![DEFAULT_PATH_ENV.to_string()])
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

/// Pre-flight child: unshare, mount the overlay once the minimal map is in
/// place, read the id files from the merged root and leave the result in
/// container.json for the parent.
fn preflight_child(
    barrier: &ForkBarrier,
    fs_tree: &ContainerFs,
    image: &Image,
    with_volumes: bool,
    container_dir: &Path,
) -> Result<()> {
    unshare(container_namespaces()).context("unshare")?;
    barrier.signal()?;
    barrier.wait()?;

    fs_tree.mount(&image.layers, with_volumes)?;

    let read_ids = |name: &str| -> Vec<u32> {
        fs::read_to_string(fs_tree.chroot_dir.join("etc").join(name))
            .map(|content| images::parse_id_file(&content))
            .unwrap_or_default()
    };
    let ids = DiscoveredIds {
        uids: read_ids("passwd"),
        gids: read_ids("group"),
    };
    let json = serde_json::to_string_pretty(&ids)?;
    fs::write(container_dir.join("container.json"), json)?;
    Ok(())
}

/// Fork the discovery child and return the ids it found in the merged
/// rootfs, falling back to the sets discovered from the layers at pull
/// time.
fn discover_container_ids(
    mapper: &IdMapper,
    fs_tree: &ContainerFs,
    image: &Image,
    with_volumes: bool,
    container_dir: &Path,
) -> Result<DiscoveredIds> {
    let barrier = ForkBarrier::fork()?;
    if barrier.is_child() {
        let code = match preflight_child(&barrier, fs_tree, image, with_volumes, container_dir) {
            Ok(()) => 0,
            Err(e) => {
                warn!("pre-flight discovery failed: {e:#}");
                // never leave the parent stuck on the barrier
                let _ = barrier.signal();
                1
            }
        };
        std::process::exit(code);
    }

    barrier.wait()?;
    let child = barrier.peer().expect("forked");
    // minimal root-only map: just enough to let the child mount
    mapper.apply(child, &[], &[])?;
    barrier.signal()?;

    let status = waitpid(child, None).context("waiting for pre-flight child")?;
    if exit_code(status) != 0 {
        bail!("pre-flight discovery child failed");
    }

    let mut ids: DiscoveredIds = serde_json::from_str(
        &fs::read_to_string(container_dir.join("container.json"))
            .context("reading container.json")?,
    )?;
    if ids.uids.is_empty() {
        ids.uids = image.config.uids.clone();
    }
    if ids.gids.is_empty() {
        ids.gids = image.config.gids.clone();
    }
    Ok(ids)
}

/// Init child: unshare, wait for maps and the TUN device, then mount,
/// chroot and exec the payload.
fn container_init(
    barrier: &ForkBarrier,
    fs_tree: &ContainerFs,
    image: &Image,
    with_volumes: bool,
    argv: &[String],
    env: &[String],
) -> Result<()> {
    unshare(container_namespaces()).context("unshare")?;
    barrier.signal()?;
    barrier.wait()?;

    fs_tree.mount(&image.layers, with_volumes)?;
    fs_tree.enter()?;

    let cargv: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("argv contains a NUL byte")?;
    let cenv: Vec<CString> = env
        .iter()
        .map(|var| CString::new(var.as_str()))
        .collect::<Result<_, _>>()
        .context("environment contains a NUL byte")?;

    // the payload must not start with SIGUSR1 blocked
    crate::barrier::release_signal()?;

    debug!("exec {argv:?}");
    execvpe(&cargv[0], &cargv, &cenv).context("execvpe")?;
    unreachable!();
}

/// Launch a container: resolve the image, build the overlay tree, fork the
/// init into fresh namespaces, wire up maps and the userspace network
/// stack, then (foregrounded) wait for the init and report its exit code.
pub fn run(storage: &FileStorage, config: &ContainerConfig) -> Result<i32> {
    if config.daemon && config.remove {
        bail!("--daemon and --rm cannot be combined");
    }

    // the registry client's background thread must be gone before the
    // forks below; keep it scoped to the resolve
    let image = {
        let client = RegistryClient::docker();
        images::resolve(storage, &client, &config.image_name)?
    };
    let mapper = IdMapper::for_current_user()?;

    let container_id = match &config.name {
        Some(name) => name.clone(),
        None => generate_id()?,
    };
    let mut container = Container {
        id: container_id.clone(),
        pid: None,
        image_registry: image.registry.clone(),
        image_name: image.manifest.name.clone(),
    };
    storage.store_container(&container)?;

    let container_dir = storage.container_dir(&container_id);
    let fs_tree = ContainerFs::prepare(&container_dir)?;
    for volume in &config.volumes {
        fs_tree.link_volume(volume)?;
    }
    let with_volumes = !config.volumes.is_empty();

    let argv = derive_command(config, &image)?;
    let env = container_env(&image);

    let ids = discover_container_ids(&mapper, &fs_tree, &image, with_volumes, &container_dir)?;
    debug!("discovered {} uids, {} gids", ids.uids.len(), ids.gids.len());

    let barrier = ForkBarrier::fork()?;
    if barrier.is_child() {
        let code = match container_init(&barrier, &fs_tree, &image, with_volumes, &argv, &env) {
            Ok(()) => 0,
            Err(e) => {
                warn!("container init failed: {e:#}");
                // never leave the parent stuck on the barrier
                let _ = barrier.signal();
                127
            }
        };
        std::process::exit(code);
    }

    barrier.wait()?;
    let child = barrier.peer().expect("forked");
    container.pid = Some(child.as_raw());
    storage.store_container(&container)?;

    mapper.apply(child, &ids.uids, &ids.gids)?;

    let tun_fd = tun::fetch_container_tun(child)?;
    let _stack = stack::start(tun_fd)?;

    barrier.signal()?;
    info!("container {container_id} started (pid {child})");

    if config.daemon {
        return Ok(0);
    }

    // keep Ctrl+C pointed at the child while we wait for it
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let previous = unsafe { sigaction(Signal::SIGINT, &ignore)? };
    let status = {
        let _restore = scopeguard::guard((), |_| unsafe {
            let _ = sigaction(Signal::SIGINT, &previous);
        });
        waitpid(child, None).context("waiting for container init")?
    };

    let code = exit_code(status);
    debug!("container {container_id} exited with {code}");

    if config.remove {
        storage.remove_container(&container_id)?;
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Digest, ImageConfig, Manifest, RunConfig};

    fn image_with(entrypoint: Option<Vec<&str>>, cmd: Option<Vec<&str>>) -> Image {
        let own = |v: Vec<&str>| v.into_iter().map(str::to_string).collect::<Vec<_>>();
        Image {
            registry: "docker.io".to_string(),
            manifest: Manifest {
                registry: "docker.io".to_string(),
                name: "library/alpine".to_string(),
                digest: Digest("sha256:aaaa".to_string()),
                config: (Digest("sha256:bbbb".to_string()), "mt".to_string()),
                layers: vec![],
            },
            config: ImageConfig {
                config: RunConfig {
                    entrypoint: entrypoint.map(own),
                    cmd: cmd.map(own),
                    env: None,
                },
                ..ImageConfig::default()
            },
            layers: vec![],
        }
    }

    #[test]
    fn entrypoint_override_is_shell_tokenized() {
        let config = ContainerConfig {
            entrypoint: Some("/bin/sh -c".to_string()),
            command: Some("'echo hi there'".to_string()),
            ..ContainerConfig::default()
        };
        let argv = derive_command(&config, &image_with(None, Some(vec!["/bin/true"]))).unwrap();
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo hi there"]);
    }

    #[test]
    fn image_entrypoint_runs_with_cmd_appended() {
        let config = ContainerConfig::default();
        let image = image_with(Some(vec!["/entry"]), Some(vec!["--flag", "value"]));
        assert_eq!(
            derive_command(&config, &image).unwrap(),
            vec!["/entry", "--flag", "value"]
        );
    }

    #[test]
    fn cmd_head_is_the_fallback_entrypoint() {
        let config = ContainerConfig::default();
        let image = image_with(None, Some(vec!["/bin/sh", "-c", "true"]));
        assert_eq!(
            derive_command(&config, &image).unwrap(),
            vec!["/bin/sh", "-c", "true"]
        );
    }

    #[test]
    fn command_override_needs_an_entrypoint_override() {
        // without --entrypoint, the image command line is used verbatim
        let config = ContainerConfig {
            command: Some("ls -la /tmp".to_string()),
            ..ContainerConfig::default()
        };
        let image = image_with(Some(vec!["/entry"]), Some(vec!["default"]));
        assert_eq!(
            derive_command(&config, &image).unwrap(),
            vec!["/entry", "default"]
        );

        // combined with --entrypoint, it is appended before tokenizing
        let config = ContainerConfig {
            entrypoint: Some("/entry".to_string()),
            command: Some("ls -la /tmp".to_string()),
            ..ContainerConfig::default()
        };
        assert_eq!(
            derive_command(&config, &image).unwrap(),
            vec!["/entry", "ls", "-la", "/tmp"]
        );
    }

    #[test]
    fn empty_image_config_is_an_error() {
        let config = ContainerConfig::default();
        assert!(derive_command(&config, &image_with(None, None)).is_err());
    }

    #[test]
    fn daemon_and_remove_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("store")).unwrap();
        let config = ContainerConfig {
            image_name: "docker.io/library/alpine".to_string(),
            daemon: true,
            remove: true,
            ..ContainerConfig::default()
        };
        assert!(run(&storage, &config).is_err());
    }
}
