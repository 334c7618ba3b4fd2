use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::set_nonblocking;

/// The TUN character device, registered with the reactor. Each read yields
/// one IP datagram from the container; each write injects one. The stack
/// splits the device with `try_clone`: the packet loop reads one handle
/// while the writer task drains outbound datagrams through the other.
pub struct TunDevice {
    inner: AsyncFd<File>,
}

enum Wait {
    Readable,
    Writable,
}

impl TunDevice {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(File::from(fd))?,
        })
    }

    /// Duplicate the device handle so reader and writer tasks can own
    /// their own registration.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let file = self.inner.get_ref().try_clone()?;
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    /// One readiness loop for both directions: wait for the fd, run the
    /// non-blocking op, retry when the readiness flag turns out stale.
    fn poll_io<T>(
        &self,
        cx: &mut Context<'_>,
        wait: Wait,
        mut op: impl FnMut(&File) -> std::io::Result<T>,
    ) -> Poll<std::io::Result<T>> {
        loop {
            let mut guard = match wait {
                Wait::Readable => ready!(self.inner.poll_read_ready(cx))?,
                Wait::Writable => ready!(self.inner.poll_write_ready(cx))?,
            };
            match guard.try_io(|inner| op(inner.get_ref())) {
                Ok(Err(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> i32 {
        self.inner.as_raw_fd()
    }
}

impl AsyncRead for TunDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = ready!(self.poll_io(cx, Wait::Readable, |mut file| {
            file.read(buf.initialize_unfilled())
        }))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.poll_io(cx, Wait::Writable, |mut file| file.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
