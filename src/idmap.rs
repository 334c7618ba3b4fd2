use std::fs;
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::unistd::{getgid, getuid, Pid, User};
use tracing::{debug, trace};

const SUBUID_PATH: &str = "/etc/subuid";
const SUBGID_PATH: &str = "/etc/subgid";

/// Subordinate-range id mapper for the invoking user. Maps are applied to
/// a target pid through the setuid `newuidmap`/`newgidmap` helpers.
pub struct IdMapper {
    uid: u32,
    gid: u32,
    subuid_base: u32,
    subgid_base: u32,
}

/// First `name:start:count` line matching the user (by name or numeric id)
/// supplies the base of the subordinate range.
fn parse_subid(content: &str, name: &str, numeric: u32) -> Option<u32> {
    let numeric = numeric.to_string();
    for line in content.lines() {
        let mut fields = line.split(':');
        let owner = fields.next()?;
        if owner != name && owner != numeric {
            continue;
        }
        if let Some(start) = fields.next().and_then(|s| s.parse().ok()) {
            return Some(start);
        }
    }
    None
}

/// Argument list for newuidmap/newgidmap, alternating
/// `inside outside length`. Root always maps to the invoker; the rest of
/// the container-interior ids map onto the subordinate range.
fn format_map(outer_root: u32, base: u32, ids: &[u32]) -> Vec<String> {
    let mut args = vec!["0".to_string(), outer_root.to_string(), "1".to_string()];
    let inner: Vec<u32> = ids.iter().copied().filter(|&id| id != 0).collect();
    if let (Some(&min), Some(&max)) = (inner.iter().min(), inner.iter().max()) {
        args.push(min.to_string());
        args.push(base.to_string());
        args.push((max - min + 1).to_string());
    }
    args
}

impl IdMapper {
    pub fn for_current_user() -> Result<Self> {
        let uid = getuid();
        let gid = getgid();
        let name = User::from_uid(uid)
            .context("looking up current user")?
            .map(|user| user.name)
            .unwrap_or_default();

        let subuid = fs::read_to_string(SUBUID_PATH)
            .with_context(|| format!("reading {SUBUID_PATH}"))?;
        let subgid = fs::read_to_string(SUBGID_PATH)
            .with_context(|| format!("reading {SUBGID_PATH}"))?;

        // both files are keyed by user name (or numeric uid)
        let subuid_base = parse_subid(&subuid, &name, uid.as_raw())
            .with_context(|| format!("no {SUBUID_PATH} entry for {name}"))?;
        let subgid_base = parse_subid(&subgid, &name, uid.as_raw())
            .with_context(|| format!("no {SUBGID_PATH} entry for {name}"))?;

        debug!("subordinate ranges: uid base {subuid_base}, gid base {subgid_base}");
        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            subuid_base,
            subgid_base,
        })
    }

    pub fn uid_map_args(&self, container_uids: &[u32]) -> Vec<String> {
        format_map(self.uid, self.subuid_base, container_uids)
    }

    pub fn gid_map_args(&self, container_gids: &[u32]) -> Vec<String> {
        format_map(self.gid, self.subgid_base, container_gids)
    }

    /// Install uid and gid maps for `pid`. The child cannot proceed until
    /// its maps are in place, so failures are fatal.
    pub fn apply(&self, pid: Pid, uids: &[u32], gids: &[u32]) -> Result<()> {
        run_map_helper("newuidmap", pid, &self.uid_map_args(uids))?;
        run_map_helper("newgidmap", pid, &self.gid_map_args(gids))?;
        Ok(())
    }
}

fn run_map_helper(helper: &str, pid: Pid, map_args: &[String]) -> Result<()> {
    trace!("{helper} {pid}: {map_args:?}");
    let status = Command::new(helper)
        .arg(pid.to_string())
        .args(map_args)
        .status()
        .with_context(|| format!("running {helper}"))?;
    if !status.success() {
        bail!("{helper} for pid {pid} failed: {status}");
    }
    Ok(())
}
