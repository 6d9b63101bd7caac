//! Error types and wire status codes.

use thiserror::Error;

/// Status code carried in response frames.
///
/// The numeric values are part of the wire protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    /// Operation succeeded.
    Success = 0,
    /// Input argument(s) are invalid.
    Args = 1,
    /// Server is unavailable.
    Unavail = 2,
    /// Resource not found.
    NotFound = 3,
    /// Resource exists but is not ready.
    NotReady = 4,
    /// Access to resource denied (check open flags).
    Perm = 5,
    /// Server-side callback reported failure.
    ServerErr = 6,
    /// No data available right now, try again later.
    Again = 7,
    /// Underlying OS error.
    System = 8,
    /// Already initialized.
    Already = 9,
    /// Peer disconnected mid-call.
    Broken = 10,
    /// Handle is not open.
    NotOpen = 11,
    /// Connection refused by the server application.
    Refused = 12,
    /// Protocol version mismatch.
    NotSupported = 13,
    /// Malformed frame or unexpected message.
    Protocol = 14,
    /// Server callback produced inconsistent output.
    ServerImpl = 15,
}

impl Status {
    /// Decode a status from its wire value.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => Status::Success,
            1 => Status::Args,
            2 => Status::Unavail,
            3 => Status::NotFound,
            4 => Status::NotReady,
            5 => Status::Perm,
            6 => Status::ServerErr,
            7 => Status::Again,
            8 => Status::System,
            9 => Status::Already,
            10 => Status::Broken,
            11 => Status::NotOpen,
            12 => Status::Refused,
            13 => Status::NotSupported,
            14 => Status::Protocol,
            15 => Status::ServerImpl,
            _ => return None,
        })
    }

    /// Wire value of this status.
    #[inline]
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// True for [`Status::Success`].
    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Main error type for all broker operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, unexpected message type, or oversized frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer reported a non-success status.
    #[error("peer reported status {0:?}")]
    Status(Status),

    /// Connection closed while a call was outstanding.
    #[error("connection broken")]
    Broken,

    /// No server is listening on the rendezvous endpoint.
    #[error("server unavailable")]
    Unavailable,

    /// A second initialization of process-global state.
    #[error("already initialized")]
    AlreadyInitialized,

    /// Caller-supplied argument rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Collapse this error onto the stable wire status taxonomy.
    pub fn status(&self) -> Status {
        match self {
            Error::Io(_) => Status::System,
            Error::Protocol(_) => Status::Protocol,
            Error::Status(status) => *status,
            Error::Broken => Status::Broken,
            Error::Unavailable => Status::Unavail,
            Error::AlreadyInitialized => Status::Already,
            Error::InvalidArgument(_) => Status::Args,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
