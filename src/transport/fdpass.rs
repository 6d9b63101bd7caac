//! File descriptor transfer over a Unix stream socket.
//!
//! `SCM_RIGHTS` ancillary data has at-most-once delivery: once `sendmsg`
//! accepts the message, the kernel owns a duplicate of the descriptor and
//! will hand it to the peer together with the bytes it rode on. The sender
//! closes its copy immediately after; no revocation protocol is needed.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Send bytes, optionally attaching one descriptor as ancillary data.
///
/// Returns the number of bytes accepted; the descriptor (if any) is in
/// flight once the call returns a non-zero count.
pub(crate) fn send_with_fd(
    sock: RawFd,
    buf: &[u8],
    fd: Option<RawFd>,
) -> std::io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let fd_slot;
    let cmsg_slot;
    let cmsgs: &[ControlMessage<'_>] = match fd {
        Some(raw) => {
            fd_slot = [raw];
            cmsg_slot = [ControlMessage::ScmRights(&fd_slot)];
            &cmsg_slot
        }
        None => &[],
    };
    sendmsg::<UnixAddr>(sock, &iov, cmsgs, MsgFlags::empty(), None).map_err(errno_to_io)
}

/// Receive bytes, capturing one descriptor if the segment carries any.
///
/// Returns `(bytes_read, descriptor)`. Extra descriptors beyond the first
/// are closed on the spot so nothing leaks.
pub(crate) fn recv_with_fd(
    sock: RawFd,
    buf: &mut [u8],
) -> std::io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);
    let msg = recvmsg::<UnixAddr>(
        sock,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(errno_to_io)?;

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs().map_err(errno_to_io)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                // SAFETY: the kernel has just transferred ownership of this
                // descriptor to us; nothing else holds it.
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                if received.is_none() {
                    received = Some(fd);
                }
            }
        }
    }

    Ok((msg.bytes, received))
}
