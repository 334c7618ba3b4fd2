use std::fs::{File, OpenOptions};
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{anyhow, Context, Result};
use nix::ioctl_write_ptr_bad;
use nix::sched::{setns, CloneFlags};
use nix::sys::socket::{
    recvmsg, sendmsg, socket, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, RecvMsg, SockFlag, SockType,
};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::barrier::ForkBarrier;

pub const TUN_DEV: &str = "tun0";
/// Fixed interface address; the container routes via this.
pub const TUN_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 1);
pub const TUN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

mod ioctl {
    use super::*;
    ioctl_write_ptr_bad!(tunsetiff, libc::TUNSETIFF, libc::ifreq);
    ioctl_write_ptr_bad!(siocsifflags, libc::SIOCSIFFLAGS, libc::ifreq);
    ioctl_write_ptr_bad!(siocsifaddr, libc::SIOCSIFADDR, libc::ifreq);
    ioctl_write_ptr_bad!(siocsifnetmask, libc::SIOCSIFNETMASK, libc::ifreq);
}

fn ifreq_named(name: &str) -> libc::ifreq {
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    req
}

fn inet_sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    };
    // sockaddr and sockaddr_in are the same size on Linux
    unsafe { mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn bring_up(sock: RawFd, name: &str) -> Result<()> {
    let mut req = ifreq_named(name);
    req.ifr_ifru.ifru_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    unsafe { ioctl::siocsifflags(sock, &req) }
        .with_context(|| format!("bringing up {name}"))?;
    Ok(())
}

/// Open /dev/net/tun and register `tun0` in the current (joined) netns.
fn create_tun() -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .context("opening /dev/net/tun")?;
    let mut req = ifreq_named(TUN_DEV);
    req.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
    unsafe { ioctl::tunsetiff(file.as_raw_fd(), &req) }.context("TUNSETIFF")?;
    Ok(file)
}

/// Configure lo and tun0 inside the container's namespaces.
fn configure_interfaces() -> Result<()> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .context("opening config socket")?;
    let fd = sock.as_raw_fd();

    bring_up(fd, "lo")?;
    bring_up(fd, TUN_DEV)?;

    let mut req = ifreq_named(TUN_DEV);
    req.ifr_ifru.ifru_addr = inet_sockaddr(TUN_ADDR);
    unsafe { ioctl::siocsifaddr(fd, &req) }.context("SIOCSIFADDR")?;

    let mut req = ifreq_named(TUN_DEV);
    req.ifr_ifru.ifru_netmask = inet_sockaddr(TUN_NETMASK);
    unsafe { ioctl::siocsifnetmask(fd, &req) }.context("SIOCSIFNETMASK")?;

    Ok(())
}

fn enter_namespaces(pid: Pid) -> Result<()> {
    let userns = File::open(format!("/proc/{pid}/ns/user")).context("opening user ns")?;
    let netns = File::open(format!("/proc/{pid}/ns/net")).context("opening net ns")?;
    setns(&userns, CloneFlags::CLONE_NEWUSER).context("joining user ns")?;
    setns(&netns, CloneFlags::CLONE_NEWNET).context("joining net ns")?;
    Ok(())
}

fn send_tun_fd(sock: &OwnedFd, tun: &File) -> Result<()> {
    let fds = [tun.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(b"ok")];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .context("sending tun fd")?;
    Ok(())
}

fn recv_tun_fd(sock: &OwnedFd) -> Result<OwnedFd> {
    let mut buf = [0u8; 16];
    let mut cmsgspace = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg: RecvMsg<()> = recvmsg(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsgspace),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .context("receiving tun fd")?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(anyhow!("helper sent no tun fd"))
}

/// Helper child body: join the init child's user and net namespaces,
/// create and configure tun0, hand the fd back over the socketpair.
fn helper_child(pid: Pid, barrier: &ForkBarrier, sock: &OwnedFd) -> Result<()> {
    enter_namespaces(pid)?;
    let tun = create_tun()?;
    configure_interfaces()?;
    trace!("tun0 configured in netns of {pid}");

    barrier.signal()?;
    send_tun_fd(sock, &tun)?;
    barrier.wait()?;
    Ok(())
}

/// Obtain a TUN fd bound inside the container's network namespace. Forks a
/// transient helper that joins the namespaces of `pid`, creates `tun0` and
/// passes the fd back over SCM_RIGHTS.
pub fn fetch_container_tun(pid: Pid) -> Result<OwnedFd> {
    let (parent_sock, child_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("creating socketpair")?;

    let barrier = ForkBarrier::fork()?;
    if barrier.is_child() {
        drop(parent_sock);
        let code = match helper_child(pid, &barrier, &child_sock) {
            Ok(()) => 0,
            Err(e) => {
                warn!("tun setup failed: {e:#}");
                // release the parent's wait; it will see the closed socket
                let _ = barrier.signal();
                1
            }
        };
        std::process::exit(code);
    }

    drop(child_sock);
    barrier.wait()?;
    let fd = recv_tun_fd(&parent_sock)?;
    barrier.signal()?;
    let helper = barrier.peer().expect("forked");
    waitpid(helper, None).context("reaping tun helper")?;
    drop(parent_sock);
    debug!("received tun fd for container pid {pid}");
    Ok(fd)
}
