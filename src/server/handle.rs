//! Handle transfer: turning a callback's open result into a descriptor the
//! writer can ship to the peer.
//!
//! [`TransferredHandle`] is the only path that can place a descriptor on
//! the wire. It owns the descriptor until the response frame is enqueued;
//! from there the endpoint writer either gets it in flight (kernel owns a
//! duplicate, our copy closes) or drops it with the queue. No state ever
//! leaks a kernel object on an error path.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::error::Status;
use crate::server::service::OpenSource;
use crate::types::OpenFlags;

/// A descriptor cleared for transfer to one specific peer.
#[derive(Debug)]
pub(crate) struct TransferredHandle {
    fd: OwnedFd,
}

impl TransferredHandle {
    /// Normalize a callback's open result against the granted flags.
    ///
    /// Paths are opened here with access derived from the flags; ready
    /// descriptors are verified to actually cover the granted access
    /// (a shortfall is [`Status::ServerImpl`], never a silent downgrade).
    pub fn prepare(source: OpenSource, flags: OpenFlags) -> Result<Self, Status> {
        let fd = match source {
            OpenSource::Path(path) => {
                let wants_write = flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND);
                let mut options = std::fs::OpenOptions::new();
                options
                    // An open with no base flags still needs an access mode:
                    // `OpenOptions` rejects zero-access opens with
                    // InvalidInput, and open(2) has no metadata-only mode
                    // short of O_PATH. O_RDONLY is the zero bit pattern in
                    // O_ACCMODE, so read access is what a literal
                    // zero-access open(2) would grant anyway; the client
                    // cannot use it for more, since every data operation is
                    // gated on the granted flags.
                    .read(flags.contains(OpenFlags::READ) || !wants_write)
                    .write(flags.contains(OpenFlags::WRITE))
                    .append(flags.contains(OpenFlags::APPEND));
                let file = options.open(&path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => Status::NotFound,
                    std::io::ErrorKind::PermissionDenied => Status::Perm,
                    std::io::ErrorKind::InvalidInput => Status::ServerImpl,
                    _ => Status::System,
                })?;
                OwnedFd::from(file)
            }
            OpenSource::Fd(fd) => fd,
        };

        verify_access(&fd, flags)?;
        Ok(TransferredHandle { fd })
    }

    /// The 32-bit wire value: the descriptor's low bits, not sign-extended.
    pub fn wire_value(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }

    /// Release the descriptor for shipment.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

/// Check that a descriptor's access mode covers every granted base flag.
fn verify_access(fd: &OwnedFd, flags: OpenFlags) -> Result<(), Status> {
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(|_| Status::System)?;
    let acc = raw & OFlag::O_ACCMODE.bits();
    let readable = acc == OFlag::O_RDONLY.bits() || acc == OFlag::O_RDWR.bits();
    let writable = acc == OFlag::O_WRONLY.bits() || acc == OFlag::O_RDWR.bits();

    if flags.contains(OpenFlags::READ) && !readable {
        return Err(Status::ServerImpl);
    }
    if (flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::APPEND)) && !writable {
        return Err(Status::ServerImpl);
    }
    Ok(())
}
