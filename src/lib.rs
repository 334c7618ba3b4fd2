use std::os::fd::RawFd;

use nix::errno::Errno;

pub mod barrier;
pub mod containers;
pub mod idmap;
pub mod images;
pub mod model;
pub mod net;
pub mod overlay;
pub mod registry;
pub mod run;
pub mod storage;

pub fn err<T: IsMinusOne>(ret: T) -> nix::Result<T> {
    if ret.is_minus_one() {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}
