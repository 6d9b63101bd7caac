//! # reswire
//!
//! A local, single-host resource broker. Client processes request
//! resources by opaque identifier from a server process that publishes
//! them; the server answers by **transferring an open OS handle** into the
//! client, which then reads and writes directly against the kernel — the
//! broker stays out of the data path. Long-lived **watchers** deliver
//! asynchronous READY / UPDATE / MOVE / DELETE events per resource.
//!
//! ## Architecture
//!
//! - **Wire**: length-prefixed little-endian frames over an AF_UNIX
//!   stream socket, rendezvous at `mwrs_<server-name>.sock`.
//! - **Handle transfer**: `SCM_RIGHTS` ancillary data attached to the
//!   response frame; delivery is at-most-once, so there is nothing to
//!   revoke.
//! - **Server**: one accept task, workers multiplexing up to 16 sessions
//!   each, a callback [`server::Service`] supplied by the embedder, and a
//!   watcher registry with first-watcher/last-watcher edge notifications.
//! - **Client**: serialized request/response round-trips plus an event
//!   queue ([`client::Client::poll_event`] / `wait_event`).
//!
//! ## Example
//!
//! ```ignore
//! use reswire::{client::Client, OpenFlags};
//!
//! #[tokio::main]
//! async fn main() -> reswire::Result<()> {
//!     let client = Client::connect("assets", &[]).await?;
//!     let mut res = client.open("config.toml", OpenFlags::READ).await?;
//!     // Direct kernel I/O from here on.
//!     let mut buf = [0u8; 4096];
//!     let n = res.read(&mut buf)?;
//!     println!("read {n} bytes");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{Client, Event, OpenWatch, Resource, StatWatch, Watcher};
pub use error::{Error, Result, Status};
pub use server::{OpenSource, Server, ServerHandle, Service, SessionInfo};
pub use types::{EventKind, OpenFlags, ResourceId, ResourceState, ResourceStatus, WatcherId};
