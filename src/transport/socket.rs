//! Rendezvous socket: path composition, listening, connecting.
//!
//! The rendezvous name is 1-63 bytes of printable ASCII; the broker
//! composes `mwrs_<name>.sock` under the system temporary directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::types::SERVER_NAME_MAX;

/// How long a connecting client waits out a busy or restarting server
/// before reporting it unavailable.
pub(crate) const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(2);

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Compose the filesystem path of a server's rendezvous socket.
///
/// Fails with an argument error when the name is empty, too long, or
/// contains anything but printable ASCII (path separators included).
pub fn endpoint_path(server_name: &str) -> Result<PathBuf> {
    if server_name.is_empty() {
        return Err(Error::InvalidArgument("server name is empty"));
    }
    if server_name.len() > SERVER_NAME_MAX {
        return Err(Error::InvalidArgument("server name too long"));
    }
    if !server_name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'/')
    {
        return Err(Error::InvalidArgument(
            "server name must be printable ASCII without '/'",
        ));
    }
    Ok(std::env::temp_dir().join(format!("mwrs_{server_name}.sock")))
}

/// Listening rendezvous socket.
///
/// Binding unlinks any stale socket file first; dropping the listener
/// removes the file again.
pub(crate) struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let inner = UnixListener::bind(path)?;
        Ok(Listener {
            inner,
            path: path.to_owned(),
        })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to a server's rendezvous socket.
///
/// A missing socket means no server: [`Error::Unavailable`] immediately.
/// A refused connection (stale file, backlog full during a restart) is
/// retried within a bounded window before giving up.
pub(crate) async fn connect(server_name: &str) -> Result<UnixStream> {
    let path = endpoint_path(server_name)?;
    let deadline = tokio::time::Instant::now() + CONNECT_RETRY_WINDOW;

    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Unavailable);
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Unavailable);
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}
