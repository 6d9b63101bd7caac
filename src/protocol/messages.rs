//! The fixed message set and its codec.
//!
//! Bodies are packed little-endian structs. Variable-length fields
//! (resource id, handshake argv) occupy the body tail and are accounted
//! for in the preamble length. Encoding always produces a complete frame,
//! preamble included; decoding consumes a body that has already been
//! separated from its preamble.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{encode_preamble, MessageType, PREAMBLE_SIZE};
use crate::error::{Error, Result, Status};
use crate::types::{EventKind, OpenFlags, ResourceId, ResourceState, ResourceStatus, WatcherId};

/// Resource-request operation selector.
///
/// The five resource requests share one body layout; only the message type
/// differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Open,
    Watch,
    OpenWatch,
    Stat,
    StatWatch,
}

impl ResourceOp {
    fn message_type(self) -> MessageType {
        match self {
            ResourceOp::Open => MessageType::ClOpen,
            ResourceOp::Watch => MessageType::ClWatch,
            ResourceOp::OpenWatch => MessageType::ClOpenWatch,
            ResourceOp::Stat => MessageType::ClStat,
            ResourceOp::StatWatch => MessageType::ClStatWatch,
        }
    }

    /// True when the request registers a watcher.
    pub fn registers_watcher(self) -> bool {
        matches!(
            self,
            ResourceOp::Watch | ResourceOp::OpenWatch | ResourceOp::StatWatch
        )
    }
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Connection handshake; must be the first frame on a session.
    Handshake {
        version: u32,
        pid: u32,
        argv: Vec<String>,
    },
    /// One of the five resource requests (open / watch / open-watch /
    /// stat / stat-watch).
    Resource {
        op: ResourceOp,
        flags: OpenFlags,
        id: ResourceId,
    },
    /// Open the resource a previously created watcher points at.
    WatcherOpen {
        watcher_id: WatcherId,
        flags: OpenFlags,
    },
    /// Destroy a watcher owned by this session.
    CloseWatcher { watcher_id: WatcherId },
}

/// Body of `SV_COMMON_RESPONSE`, the single response shape for every
/// resource and watcher request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonResponse {
    pub status: Status,
    /// Flags granted with a transferred handle; empty otherwise.
    pub open_flags: OpenFlags,
    /// Lower 32 bits of the transferred descriptor, 0 when none was sent.
    /// The descriptor itself travels as socket ancillary data.
    pub handle: u32,
    /// Stat result; zeroed for non-stat requests.
    pub stat: ResourceStatus,
    /// Watcher created by this request, 0 when none.
    pub watcher_id: WatcherId,
}

impl CommonResponse {
    /// A response carrying only a status, everything else zeroed.
    pub fn with_status(status: Status) -> Self {
        CommonResponse {
            status,
            open_flags: OpenFlags::empty(),
            handle: 0,
            stat: ResourceStatus::default(),
            watcher_id: 0,
        }
    }
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake result; the only frame a rejected session ever sees.
    HandshakeAck { status: Status },
    /// Response to any post-handshake request.
    CommonResponse(CommonResponse),
    /// Asynchronous watcher event.
    Event {
        watcher_id: WatcherId,
        kind: EventKind,
    },
}

impl ClientMessage {
    /// Encode into a complete frame.
    pub fn encode(&self) -> Bytes {
        match self {
            ClientMessage::Handshake { version, pid, argv } => {
                let blob_len: usize = argv.iter().map(|a| a.len() + 1).sum();
                let mut buf = frame(MessageType::ClHandshake, 12 + blob_len);
                buf.put_u32_le(*version);
                buf.put_u32_le(*pid);
                buf.put_u32_le(argv.len() as u32);
                for arg in argv {
                    buf.put_slice(arg.as_bytes());
                    buf.put_u8(0);
                }
                buf.freeze()
            }
            ClientMessage::Resource { op, flags, id } => {
                let mut buf = frame(op.message_type(), 4 + id.as_str().len() + 1);
                buf.put_u32_le(flags.bits());
                buf.put_slice(id.as_str().as_bytes());
                buf.put_u8(0);
                buf.freeze()
            }
            ClientMessage::WatcherOpen { watcher_id, flags } => {
                let mut buf = frame(MessageType::ClWatcherOpen, 12);
                buf.put_u64_le(*watcher_id);
                buf.put_u32_le(flags.bits());
                buf.freeze()
            }
            ClientMessage::CloseWatcher { watcher_id } => {
                let mut buf = frame(MessageType::ClCloseWatcher, 8);
                buf.put_u64_le(*watcher_id);
                buf.freeze()
            }
        }
    }

    /// Decode from a raw type value and a body.
    pub fn decode(raw_type: u32, body: &[u8]) -> Result<Self> {
        let msg_type = MessageType::from_wire(raw_type)
            .ok_or_else(|| Error::Protocol(format!("unknown message type 0x{raw_type:x}")))?;
        let mut rd = BodyReader::new(body);

        let msg = match msg_type {
            MessageType::ClHandshake => {
                let version = rd.u32()?;
                let pid = rd.u32()?;
                let argc = rd.u32()?;
                let argv = parse_argv(rd.remainder(), argc)?;
                return Ok(ClientMessage::Handshake { version, pid, argv });
            }
            MessageType::ClOpen
            | MessageType::ClWatch
            | MessageType::ClOpenWatch
            | MessageType::ClStat
            | MessageType::ClStatWatch => {
                let op = match msg_type {
                    MessageType::ClOpen => ResourceOp::Open,
                    MessageType::ClWatch => ResourceOp::Watch,
                    MessageType::ClOpenWatch => ResourceOp::OpenWatch,
                    MessageType::ClStat => ResourceOp::Stat,
                    _ => ResourceOp::StatWatch,
                };
                let flags = OpenFlags::from_bits_retain(rd.u32()?);
                let id = parse_resource_id(rd.remainder())?;
                return Ok(ClientMessage::Resource { op, flags, id });
            }
            MessageType::ClWatcherOpen => ClientMessage::WatcherOpen {
                watcher_id: rd.u64()?,
                flags: OpenFlags::from_bits_retain(rd.u32()?),
            },
            MessageType::ClCloseWatcher => ClientMessage::CloseWatcher {
                watcher_id: rd.u64()?,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "server message {other:?} on client-to-server path"
                )))
            }
        };

        rd.finish()?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Encode into a complete frame.
    pub fn encode(&self) -> Bytes {
        match self {
            ServerMessage::HandshakeAck { status } => {
                let mut buf = frame(MessageType::SvHandshakeAck, 4);
                buf.put_u32_le(status.to_wire());
                buf.freeze()
            }
            ServerMessage::CommonResponse(resp) => {
                let mut buf = frame(MessageType::SvCommonResponse, 36);
                buf.put_u32_le(resp.status.to_wire());
                buf.put_u32_le(resp.open_flags.bits());
                buf.put_u32_le(resp.handle);
                buf.put_u32_le(resp.stat.state.to_wire());
                buf.put_i64_le(resp.stat.size);
                buf.put_i32_le(resp.stat.mtime);
                buf.put_u64_le(resp.watcher_id);
                buf.freeze()
            }
            ServerMessage::Event { watcher_id, kind } => {
                let mut buf = frame(MessageType::SvEvent, 12);
                buf.put_u64_le(*watcher_id);
                buf.put_u32_le(kind.to_wire());
                buf.freeze()
            }
        }
    }

    /// Decode from a raw type value and a body.
    pub fn decode(raw_type: u32, body: &[u8]) -> Result<Self> {
        let msg_type = MessageType::from_wire(raw_type)
            .ok_or_else(|| Error::Protocol(format!("unknown message type 0x{raw_type:x}")))?;
        let mut rd = BodyReader::new(body);

        let msg = match msg_type {
            MessageType::SvHandshakeAck => ServerMessage::HandshakeAck {
                status: parse_status(rd.u32()?)?,
            },
            MessageType::SvCommonResponse => {
                let status = parse_status(rd.u32()?)?;
                let open_flags = OpenFlags::from_bits_retain(rd.u32()?);
                let handle = rd.u32()?;
                let state = rd.u32()?;
                let state = ResourceState::from_wire(state)
                    .ok_or_else(|| Error::Protocol(format!("unknown resource state {state}")))?;
                let size = rd.i64()?;
                let mtime = rd.i32()?;
                let watcher_id = rd.u64()?;
                ServerMessage::CommonResponse(CommonResponse {
                    status,
                    open_flags,
                    handle,
                    stat: ResourceStatus { state, size, mtime },
                    watcher_id,
                })
            }
            MessageType::SvEvent => {
                let watcher_id = rd.u64()?;
                let raw = rd.u32()?;
                let kind = EventKind::from_wire(raw)
                    .ok_or_else(|| Error::Protocol(format!("unknown event type {raw}")))?;
                ServerMessage::Event { watcher_id, kind }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "client message {other:?} on server-to-client path"
                )))
            }
        };

        rd.finish()?;
        Ok(msg)
    }
}

/// Allocate a frame buffer and write the preamble.
fn frame(msg_type: MessageType, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PREAMBLE_SIZE + body_len);
    buf.put_slice(&encode_preamble(msg_type, body_len));
    buf
}

fn parse_status(raw: u32) -> Result<Status> {
    Status::from_wire(raw).ok_or_else(|| Error::Protocol(format!("unknown status {raw}")))
}

/// Parse the NUL-terminated resource id occupying a body tail.
fn parse_resource_id(tail: &[u8]) -> Result<ResourceId> {
    match tail.split_last() {
        Some((0, id_bytes)) => {
            let id = std::str::from_utf8(id_bytes)
                .map_err(|_| Error::Protocol("resource id is not UTF-8".into()))?;
            ResourceId::new(id)
                .map_err(|e| Error::Protocol(format!("invalid resource id: {e}")))
        }
        _ => Err(Error::Protocol(
            "resource id not NUL-terminated within its extent".into(),
        )),
    }
}

/// Parse `argc` NUL-terminated strings that must exactly consume `blob`.
fn parse_argv(blob: &[u8], argc: u32) -> Result<Vec<String>> {
    let mut argv = Vec::with_capacity(argc as usize);
    let mut rest = blob;
    for _ in 0..argc {
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("argv entry not NUL-terminated".into()))?;
        let arg = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::Protocol("argv entry is not UTF-8".into()))?;
        argv.push(arg.to_owned());
        rest = &rest[nul + 1..];
    }
    if !rest.is_empty() {
        return Err(Error::Protocol("trailing bytes after argv blob".into()));
    }
    Ok(argv)
}

/// Little-endian body cursor with truncation checking.
struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BodyReader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol(format!(
                "body truncated: wanted {n} more bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    /// Consume and return everything left.
    fn remainder(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Fail if unconsumed bytes remain.
    fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} trailing bytes after message body",
                self.buf.len()
            )))
        }
    }
}
