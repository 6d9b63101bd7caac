//! Client-side resource handle.
//!
//! A `Resource` owns the descriptor the server transferred; all I/O here
//! is direct kernel I/O with no broker round-trips. The granted open flags
//! gate each operation client-side, mirroring what the server enforced
//! when it produced the handle.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;

use crate::error::{Error, Result, Status};
use crate::types::OpenFlags;

/// An open resource, backed by a descriptor owned exclusively by this
/// process.
#[derive(Debug)]
pub struct Resource {
    file: std::fs::File,
    flags: OpenFlags,
}

impl Resource {
    pub(crate) fn new(fd: OwnedFd, flags: OpenFlags) -> Self {
        Resource {
            file: std::fs::File::from(fd),
            flags,
        }
    }

    /// The flags the server granted.
    #[inline]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Read into `buf`, returning the byte count (0 at end of stream).
    ///
    /// Requires [`OpenFlags::READ`]; otherwise [`Status::Perm`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require(OpenFlags::READ)?;
        Ok(self.file.read(buf)?)
    }

    /// Fill `buf` completely or fail.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.require(OpenFlags::READ)?;
        Ok(self.file.read_exact(buf)?)
    }

    /// Write from `buf`, returning the byte count accepted.
    ///
    /// Requires [`OpenFlags::WRITE`]; otherwise [`Status::Perm`].
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.require(OpenFlags::WRITE)?;
        Ok(self.file.write(buf)?)
    }

    /// Write all of `buf` or fail.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.require(OpenFlags::WRITE)?;
        Ok(self.file.write_all(buf)?)
    }

    /// Reposition the stream. Requires [`OpenFlags::SEEK`].
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.require(OpenFlags::SEEK)?;
        Ok(self.file.seek(pos)?)
    }

    /// Current stream position. Requires [`OpenFlags::SEEK`].
    pub fn tell(&mut self) -> Result<u64> {
        self.require(OpenFlags::SEEK)?;
        Ok(self.file.stream_position()?)
    }

    /// Close the handle. Equivalent to dropping it.
    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    /// Unwrap into the underlying file, leaving flag gating behind.
    pub fn into_file(self) -> std::fs::File {
        self.file
    }

    fn require(&self, needed: OpenFlags) -> Result<()> {
        if self.flags.contains(needed) {
            Ok(())
        } else {
            Err(Error::Status(Status::Perm))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::OwnedFd;

    fn fixture(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn test_read_with_read_flag() {
        let mut res = Resource::new(fixture(b"hello"), OpenFlags::READ);
        let mut buf = [0u8; 128];
        let n = res.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_read_without_read_flag_is_perm() {
        let mut res = Resource::new(fixture(b"hello"), OpenFlags::WRITE);
        let mut buf = [0u8; 8];
        let err = res.read(&mut buf).unwrap_err();
        assert_eq!(err.status(), Status::Perm);
    }

    #[test]
    fn test_write_without_write_flag_is_perm() {
        let mut res = Resource::new(fixture(b""), OpenFlags::READ);
        let err = res.write(b"nope").unwrap_err();
        assert_eq!(err.status(), Status::Perm);
    }

    #[test]
    fn test_seek_and_tell_gated_on_seek_flag() {
        let mut res = Resource::new(fixture(b"abcdef"), OpenFlags::READ);
        assert_eq!(res.seek(SeekFrom::Start(3)).unwrap_err().status(), Status::Perm);
        assert_eq!(res.tell().unwrap_err().status(), Status::Perm);

        let mut res = Resource::new(fixture(b"abcdef"), OpenFlags::READ | OpenFlags::SEEK);
        assert_eq!(res.seek(SeekFrom::Start(3)).unwrap(), 3);
        assert_eq!(res.tell().unwrap(), 3);
        let mut buf = [0u8; 8];
        let n = res.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"def");
    }

    #[test]
    fn test_write_then_read_back() {
        let mut res = Resource::new(
            fixture(b""),
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::SEEK,
        );
        res.write_all(b"payload").unwrap();
        res.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 16];
        let n = res.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn test_flags_accessor() {
        let res = Resource::new(fixture(b""), OpenFlags::READ | OpenFlags::USER1);
        assert!(res.flags().contains(OpenFlags::USER1));
    }
}
