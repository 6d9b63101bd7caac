//! Process-global client, for embedders that want exactly one broker
//! connection per process.
//!
//! The connection itself is an ordinary [`Client`]; this module only adds
//! the init-once storage and the matching teardown. Double-init fails with
//! [`Error::AlreadyInitialized`]; using the accessors before `init` (or
//! after `shutdown`) fails with [`Error::Unavailable`].

use parking_lot::Mutex;

use super::Client;
use crate::error::{Error, Result};

static INSTANCE: Mutex<Option<Client>> = Mutex::new(None);

/// Connect to `server_name` and store the client process-wide.
pub async fn init(server_name: &str, argv: &[&str]) -> Result<()> {
    if INSTANCE.lock().is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let client = Client::connect(server_name, argv).await?;
    let mut slot = INSTANCE.lock();
    if slot.is_some() {
        // Lost an init race; the fresh connection drops.
        return Err(Error::AlreadyInitialized);
    }
    *slot = Some(client);
    Ok(())
}

/// A clone of the process-global client.
pub fn client() -> Result<Client> {
    INSTANCE.lock().clone().ok_or(Error::Unavailable)
}

/// Drop the process-global client.
///
/// Outstanding [`crate::client::Resource`] handles stay valid — they own
/// their descriptors — but watchers die with the connection.
pub fn shutdown() -> Result<()> {
    match INSTANCE.lock().take() {
        Some(client) => {
            client.close();
            Ok(())
        }
        None => Err(Error::Unavailable),
    }
}
