//! Raw `sendmsg`/`recvmsg` with `SCM_RIGHTS` descriptor passing.
//!
//! The kernel duplicates a passed descriptor into the receiving process, so
//! the sender keeps its own copy.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

use tracing::warn;

/// Control buffer sized and aligned for a handful of descriptors.
type ControlBuffer = [u64; 16];

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Send one message, optionally with a descriptor attached.
pub(crate) fn send_message(socket: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let mut control: ControlBuffer = [0; 16];
    let fd_len = mem::size_of::<RawFd>() as libc::c_uint;

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: msghdr is plain old data; every pointer field set below points
    // at locals that outlive the sendmsg call.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_len) } as _;

        // SAFETY: the control buffer is 8-byte aligned and larger than
        // CMSG_SPACE(sizeof(int)), so the first header and its data fit.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "control buffer too small",
                ));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    // SAFETY: msg is fully initialised and borrows live buffers.
    let sent = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Receive one message and any descriptors that came with it.
pub(crate) fn recv_message(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut control: ControlBuffer = [0; 16];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: see send_message.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of::<ControlBuffer>() as _;

    // SAFETY: msg points at live, writable buffers of the advertised sizes.
    let received = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel wrote msg_controllen bytes of well-formed control
    // messages; CMSG_FIRSTHDR/CMSG_NXTHDR stay within that range.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header_len = data as usize - cmsg as usize;
                let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let count = data_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let raw = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                    // Received descriptors are ours to close.
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!("Ancillary data truncated, descriptors may have been lost");
    }
    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        warn!(len = received, "Message truncated");
    }

    Ok((received as usize, fds))
}
