//! Framed duplex endpoint over a connected Unix stream.
//!
//! The reader side is strictly two-phase: read exactly the 8-byte
//! preamble, then exactly the declared body. The writer side is a
//! dedicated task fed by a bounded queue, draining frames in enqueue
//! order; a frame is one scheduled write from the sender's perspective,
//! reassembled by length on the far side if the kernel splits it.
//!
//! ```text
//! Session ─┐
//! Events  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! Server  ─┘
//! ```
//!
//! Any I/O error other than would-block terminates the affected side and
//! the endpoint counts as disconnected: the writer drops its queue, the
//! reader yields no more frames.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::fdpass;
use crate::error::{Error, Result};
use crate::protocol::{decode_preamble, PREAMBLE_SIZE};

/// Writer queue depth per endpoint.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// One frame queued for sending, optionally carrying a descriptor.
///
/// The descriptor is attached to the frame's first byte segment; once any
/// bytes of the frame are accepted by the kernel the local copy is closed.
/// If the frame never reaches the socket (endpoint already dead), dropping
/// the queue closes the descriptor instead. Either way exactly one side
/// ends up owning the underlying kernel object.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub bytes: Bytes,
    pub fd: Option<OwnedFd>,
}

impl OutboundFrame {
    pub fn new(bytes: Bytes) -> Self {
        OutboundFrame { bytes, fd: None }
    }

    pub fn with_fd(bytes: Bytes, fd: OwnedFd) -> Self {
        OutboundFrame {
            bytes,
            fd: Some(fd),
        }
    }
}

/// One complete inbound frame.
///
/// The type value is kept raw so unknown types can be reported as protocol
/// errors by the message decoder after the frame has been drained.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub raw_type: u32,
    pub body: Bytes,
    pub fd: Option<OwnedFd>,
}

/// Cheaply cloneable handle for enqueueing frames.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Enqueue a frame; fails with [`Error::Broken`] once the endpoint is
    /// disconnected.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::Broken)
    }
}

/// Exclusive reading half of an endpoint.
pub(crate) struct EndpointReader {
    io: Arc<UnixStream>,
}

/// Split a connected stream into a framed reader and a writer-task handle.
pub(crate) fn split(stream: UnixStream) -> (EndpointReader, WriterHandle, JoinHandle<()>) {
    let io = Arc::new(stream);
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let writer_io = io.clone();
    let task = tokio::spawn(writer_loop(writer_io, rx));
    (EndpointReader { io }, WriterHandle { tx }, task)
}

impl EndpointReader {
    /// Receive one complete frame.
    ///
    /// Returns `Ok(None)` on a clean close (EOF on a frame boundary).
    /// EOF inside a frame is [`Error::Broken`]; a bad preamble is a
    /// protocol error.
    pub async fn recv(&mut self) -> Result<Option<InboundFrame>> {
        let mut fds: Vec<OwnedFd> = Vec::new();

        let mut preamble = [0u8; PREAMBLE_SIZE];
        if !self.fill(&mut preamble, &mut fds, true).await? {
            return Ok(None);
        }

        let (raw_type, body_len) = decode_preamble(&preamble)?;
        let mut body = vec![0u8; body_len];
        self.fill(&mut body, &mut fds, false).await?;

        Ok(Some(InboundFrame {
            raw_type,
            body: Bytes::from(body),
            fd: fds.into_iter().next(),
        }))
    }

    /// Read exactly `buf.len()` bytes, collecting any descriptors that
    /// arrive along the way.
    ///
    /// Returns `false` when `eof_ok` and the stream ended before the first
    /// byte.
    async fn fill(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, eof_ok: bool) -> Result<bool> {
        let raw = self.io.as_raw_fd();
        let mut filled = 0;
        while filled < buf.len() {
            let (n, fd) = self
                .io
                .async_io(Interest::READABLE, || {
                    fdpass::recv_with_fd(raw, &mut buf[filled..])
                })
                .await?;
            if let Some(fd) = fd {
                fds.push(fd);
            }
            if n == 0 {
                if eof_ok && filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Broken);
            }
            filled += n;
        }
        Ok(true)
    }
}

/// Drain the write queue in order until it closes or the socket fails.
async fn writer_loop(io: Arc<UnixStream>, mut rx: mpsc::Receiver<OutboundFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&io, frame).await {
            tracing::debug!("endpoint write failed: {}", e);
            break;
        }
    }
    // Dropping rx frees queued frames, closing any attached descriptors.
}

async fn write_frame(io: &UnixStream, frame: OutboundFrame) -> std::io::Result<()> {
    let OutboundFrame { bytes, mut fd } = frame;
    let raw = io.as_raw_fd();
    let mut sent = 0;
    while sent < bytes.len() {
        let pass = fd.as_ref().map(|f| f.as_raw_fd());
        let n = io
            .async_io(Interest::WRITABLE, || {
                fdpass::send_with_fd(raw, &bytes[sent..], pass)
            })
            .await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "sendmsg accepted 0 bytes",
            ));
        }
        // The descriptor rode the segment just accepted; close our copy.
        fd = None;
        sent += n;
    }
    Ok(())
}
