//! Shared identifier, flag, and event types.

use crate::error::{Error, Result};

/// Maximum resource identifier size in bytes, including the trailing NUL.
pub const ID_MAX: usize = 512;

/// Maximum rendezvous name length in bytes.
pub const SERVER_NAME_MAX: usize = 63;

/// Server-assigned session identifier, unique per server instance.
pub type SessionId = u32;

/// Server-assigned watcher identifier, strictly increasing, never reused.
pub type WatcherId = u64;

bitflags::bitflags! {
    /// Access flags requested by a client when opening a resource.
    ///
    /// The four base bits gate client-side operations; the four user bits
    /// are forwarded to the embedder untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ   = 0x0000_0001;
        const WRITE  = 0x0000_0002;
        const APPEND = 0x0000_0004;
        const SEEK   = 0x0000_0008;

        const USER1  = 0x0001_0000;
        const USER2  = 0x0002_0000;
        const USER3  = 0x0004_0000;
        const USER4  = 0x0008_0000;

        // Flags are opaque between client and embedder; unknown bits pass
        // through the wire unmodified.
        const _ = !0;
    }
}

/// Event delivered through a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    /// Resource is now available.
    Ready = 1,
    /// Resource has been updated.
    Update = 2,
    /// Resource has been moved.
    Move = 3,
    /// Resource has been deleted.
    Delete = 4,

    User1 = 0x100,
    User2 = 0x101,
    User3 = 0x102,
    User4 = 0x103,
}

impl EventKind {
    /// Decode an event kind from its wire value.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            1 => EventKind::Ready,
            2 => EventKind::Update,
            3 => EventKind::Move,
            4 => EventKind::Delete,
            0x100 => EventKind::User1,
            0x101 => EventKind::User2,
            0x102 => EventKind::User3,
            0x103 => EventKind::User4,
            _ => return None,
        })
    }

    /// Wire value of this event kind.
    #[inline]
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Availability of a resource as reported by the `stat` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ResourceState {
    /// The identifier maps to nothing.
    #[default]
    NotFound = 0,
    /// The resource exists but cannot be opened yet.
    NotReady = 1,
    /// The resource can be opened.
    Ready = 2,
}

impl ResourceState {
    /// Decode a state from its wire value.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => ResourceState::NotFound,
            1 => ResourceState::NotReady,
            2 => ResourceState::Ready,
            _ => return None,
        })
    }

    /// Wire value of this state.
    #[inline]
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Result of a `stat` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStatus {
    /// Availability of the resource.
    pub state: ResourceState,
    /// Size in bytes, or -1 when unknown.
    pub size: i64,
    /// Modification time as Unix seconds, or 0 when unknown.
    pub mtime: i32,
}

/// Validated resource identifier.
///
/// Identifiers are opaque to the broker: UTF-8, 1 to 511 bytes, no interior
/// NUL. Comparison is byte equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Validate and wrap an identifier.
    pub fn new(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("resource id is empty"));
        }
        if id.len() >= ID_MAX {
            return Err(Error::InvalidArgument("resource id too long"));
        }
        if id.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument("resource id contains NUL"));
        }
        Ok(ResourceId(id.to_owned()))
    }

    /// The identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_wire_passthrough() {
        let flags = OpenFlags::READ | OpenFlags::USER3;
        let raw = flags.bits();
        assert_eq!(OpenFlags::from_bits_retain(raw), flags);

        // Unknown bits survive a round-trip untouched.
        let exotic = OpenFlags::from_bits_retain(0x4000_0000 | 0x1);
        assert_eq!(exotic.bits(), 0x4000_0001);
        assert!(exotic.contains(OpenFlags::READ));
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in [
            EventKind::Ready,
            EventKind::Update,
            EventKind::Move,
            EventKind::Delete,
            EventKind::User1,
            EventKind::User4,
        ] {
            assert_eq!(EventKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(EventKind::from_wire(0), None);
        assert_eq!(EventKind::from_wire(5), None);
        assert_eq!(EventKind::from_wire(0x104), None);
    }

    #[test]
    fn test_resource_state_roundtrip() {
        for state in [
            ResourceState::NotFound,
            ResourceState::NotReady,
            ResourceState::Ready,
        ] {
            assert_eq!(ResourceState::from_wire(state.to_wire()), Some(state));
        }
        assert_eq!(ResourceState::from_wire(3), None);
    }

    #[test]
    fn test_resource_id_validation() {
        assert!(ResourceId::new("textures/grass.png").is_ok());
        assert!(ResourceId::new("").is_err());
        assert!(ResourceId::new("a\0b").is_err());
        assert!(ResourceId::new(&"x".repeat(511)).is_ok());
        assert!(ResourceId::new(&"x".repeat(512)).is_err());
    }
}
