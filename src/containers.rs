use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::storage::FileStorage;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_ATTEMPTS: u32 = 50;

fn process_alive(pid: i32) -> bool {
    // signal 0: existence probe
    kill(Pid::from_raw(pid), None).is_ok()
}

/// SIGTERM, poll for up to five seconds, then SIGKILL.
fn stop_container_process(pid: i32) -> Result<()> {
    let pid = Pid::from_raw(pid);
    kill(pid, Signal::SIGTERM)?;
    for _ in 0..STOP_POLL_ATTEMPTS {
        if kill(pid, None).is_err() {
            return Ok(());
        }
        sleep(STOP_POLL_INTERVAL);
    }
    debug!("container pid {pid} survived SIGTERM, sending SIGKILL");
    kill(pid, Signal::SIGKILL)?;
    Ok(())
}

pub fn cmd_ps(storage: &FileStorage) -> Result<()> {
    let containers = storage.containers()?;
    println!("{:<24} {:<30} {:<8} STATUS", "CONTAINER ID", "IMAGE", "PID");
    for container in containers {
        let (pid, status) = match container.pid {
            Some(pid) if process_alive(pid) => (pid.to_string(), "running"),
            Some(pid) => (pid.to_string(), "exited"),
            None => ("-".to_string(), "created"),
        };
        println!(
            "{:<24} {:<30} {:<8} {}",
            container.id,
            format!("{}/{}", container.image_registry, container.image_name),
            pid,
            status,
        );
    }
    Ok(())
}

pub fn cmd_rm(storage: &FileStorage, container_id: &str, force: bool) -> Result<()> {
    let Some(container) = storage.container(container_id)? else {
        bail!("container {container_id} not found");
    };

    if let Some(pid) = container.pid {
        if process_alive(pid) {
            if !force {
                bail!("container {container_id} is running; stop it first or use --force");
            }
            stop_container_process(pid)?;
        }
    }
    storage.remove_container(container_id)?;
    Ok(())
}
