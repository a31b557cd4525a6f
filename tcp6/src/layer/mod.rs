//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! The packet logic is contained in `wire` and the processing part in this module. A namespace
//! represents the local state of the protocol: the tables of listening, half-open, connected and
//! time-wait records. This state can be used to process segments. It is open to modifications by
//! the user program (binding, listening, configuring keys) similar to reconfiguration on the OS
//! level.
//!
//! ## Receiving
//!
//! Received segments arrive with the addresses of the network layer but without its header. The
//! layer below is expected to have validated the IP header itself. All further validation, from
//! the addresses over the checksum to the connection state, happens here.
//!
//! ## Sending
//!
//! Segments produced by the state machine are handed to an `Egress` collaborator together with
//! the network layer metadata (addresses, hop limit, traffic class, flow label) required to wrap
//! them.
use core::fmt;

pub mod tcp;

/// The result type of layer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type of namespace and socket operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the socket is in a state that does not allow the operation, e.g. connecting
    /// a socket that is already listening.
    Illegal,

    /// Not enough space for the requested packet.
    BadSize,

    /// Unable to find a route towards the destination address.
    Unreachable,

    /// The action could not be completed because there were not enough resources.
    ///
    /// The main difference towards `Illegal` is that implies that it would have been legal with
    /// more resources, e.g. after some time-wait entries have expired.
    Exhausted,

    /// The requested local address and port are bound already.
    AddressInUse,

    /// The address can not be used as requested.
    ///
    /// For example a link-local destination without an interface.
    InvalidAddress,

    /// There is no record matching the request.
    NotFound,

    /// The connection failed with an error that is reported to the owner.
    Socket(SocketError),
}

/// Terminal errors of a connection, as observed by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketError {
    /// The peer reset the connection.
    Reset,
    /// The peer refused the connection attempt.
    Refused,
    /// Retransmissions were exhausted.
    TimedOut,
    /// A segment did not fit the path MTU.
    MessageTooLarge,
    /// The network of the peer is unreachable.
    NetUnreachable,
    /// The peer host is unreachable.
    HostUnreachable,
    /// The path refused our traffic by policy.
    PermissionDenied,
    /// The peer or the path reported a protocol error.
    Protocol,
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Reset => write!(f, "connection reset"),
            SocketError::Refused => write!(f, "connection refused"),
            SocketError::TimedOut => write!(f, "connection timed out"),
            SocketError::MessageTooLarge => write!(f, "message too large"),
            SocketError::NetUnreachable => write!(f, "network unreachable"),
            SocketError::HostUnreachable => write!(f, "host unreachable"),
            SocketError::PermissionDenied => write!(f, "permission denied"),
            SocketError::Protocol => write!(f, "protocol error"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Illegal => write!(f, "operation not permitted"),
            Error::BadSize => write!(f, "bad size"),
            Error::Unreachable => write!(f, "destination unreachable"),
            Error::Exhausted => write!(f, "resources exhausted"),
            Error::AddressInUse => write!(f, "address in use"),
            Error::InvalidAddress => write!(f, "invalid address"),
            Error::NotFound => write!(f, "no such connection"),
            Error::Socket(err) => write!(f, "{}", err),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Can convert from a wire error.
///
/// This indicates some layer tried to operate on a packet but failed.
impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Self {
        Error::Illegal
    }
}

impl From<SocketError> for Error {
    fn from(err: SocketError) -> Self {
        Error::Socket(err)
    }
}
