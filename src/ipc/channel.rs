//! Async message channel over a `SOCK_SEQPACKET` Unix socket pair.
//!
//! Sequenced packets keep message boundaries like datagrams, and a closed
//! peer reads as end-of-stream, which is how each side notices the other's
//! death.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use super::fd::{recv_message, send_message};

/// Largest message either side sends
pub const MAX_MESSAGE_LEN: usize = 4096;

#[cfg(target_os = "linux")]
const SOCKET_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const SOCKET_FLAGS: libc::c_int = 0;

/// One end of a master ↔ worker channel
#[derive(Debug)]
pub struct Channel {
    inner: AsyncFd<OwnedFd>,
}

impl Channel {
    /// Create a connected pair: an async end for this process and a raw end
    /// for a child. Both are close-on-exec.
    pub fn pair() -> io::Result<(Channel, OwnedFd)> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: socketpair writes two descriptors into the array on success.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | SOCKET_FLAGS,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (local, remote) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(local.as_raw_fd(), true)?;
        set_cloexec(remote.as_raw_fd(), true)?;

        Ok((Channel::from_owned(local)?, remote))
    }

    /// Wrap an owned channel descriptor for async use.
    pub fn from_owned(fd: OwnedFd) -> io::Result<Channel> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Channel {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Send a message without a descriptor.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.send_inner(payload, None).await
    }

    /// Send a message carrying a duplicate of `fd`.
    pub async fn send_with_fd(&self, payload: &[u8], fd: RawFd) -> io::Result<()> {
        self.send_inner(payload, Some(fd)).await
    }

    /// Send a message carrying a duplicate of `fd` without waiting for
    /// buffer space. Fails with `WouldBlock` when the peer is not draining
    /// its end.
    pub fn try_send_with_fd(&self, payload: &[u8], fd: RawFd) -> io::Result<()> {
        let sent = send_message(self.inner.get_ref().as_raw_fd(), payload, Some(fd))?;
        complete(sent, payload.len())
    }

    /// Receive one message. `Ok((0, _))` means the peer closed its end.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| recv_message(inner.as_raw_fd(), &mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_inner(&self, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| send_message(inner.as_raw_fd(), payload, fd)) {
                Ok(result) => return complete(result?, payload.len()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn complete(sent: usize, len: usize) -> io::Result<()> {
    if sent != len {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short message: {} of {} bytes", sent, len),
        ));
    }
    Ok(())
}

/// Toggle close-on-exec. Only calls `fcntl`, so it is safe between fork and exec.
pub fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor, no memory is touched.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let updated = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, updated) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor the caller owns.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
