//! The TCP connection core.
//!
//! Establishes, tracks and tears down connections over IPv6, with IPv4 peers served through
//! IPv4-mapped addresses. The byte stream itself (buffers, reassembly, congestion control) is not
//! handled here but delegated to a [`SegmentEngine`].
//!
//! ## Structure
//!
//! A [`Namespace`] stores all records. Every received segment is looked up by its four tuple and
//! processed by exactly one of them:
//!
//! * a [`Listener`] for unknown tuples on a listening port,
//! * a half-open request, stored inside its listener until the handshake completes,
//! * a [`Socket`] holding a full connection,
//! * a time-wait record of a connection closed by both sides.
//!
//! Segments for no record at all are answered with a reset. Segments that fail validation are
//! dropped and counted, the [`Disposition`] returned by `receive` tells the caller what happened.
//!
//! [`SegmentEngine`]: provider/trait.SegmentEngine.html
//! [`Namespace`]: struct.Namespace.html
//! [`Listener`]: struct.Listener.html
//! [`Socket`]: struct.Socket.html
//! [`Disposition`]: enum.Disposition.html
//!
//! ## Accepting connections
//!
//! A SYN on a listener creates a request and is answered with a SYN-ACK. When the request table
//! is full the listener answers with a SYN cookie instead and keeps no state, depending on the
//! configured cookie policy. The final ACK of the handshake turns the request (or the cookie) into
//! a connection that waits in the accept queue of the listener.
//!
//! ## Ownership
//!
//! A user can take exclusive ownership of a socket with `Namespace::own`. Segments arriving
//! meanwhile are queued to a bounded backlog and timer or error work is deferred. Releasing the
//! socket processes the backlog in arrival order before clearing the owner flag.
//!
//! ## Deviations
//!
//! Only in-order data is handed to the engine, out-of-order segments are acknowledged and
//! dropped. Connections established through a cookie never use timestamps or selective
//! acknowledgments, the cookie has no room for them.
mod auth;
mod config;
mod connection;
mod cookie;
mod dispatch;
mod feedback;
mod handshake;
mod listener;
mod mapped;
mod namespace;
pub mod provider;
mod registry;
mod request;
mod responder;
mod siphash;
mod stats;
mod timer;
mod timewait;


pub use auth::{
    sign,
    verify,
    AuthFailure,
    AuthKey,
    KeyTable,
    MAX_KEY_LEN};

pub use config::{
    Config,
    Keepalive,
    SynCookies as CookiePolicy};

pub use connection::{
    ConnectionInfo,
    FlowMeta,
    Socket,
    SocketId,
    SocketOptions,
    State};

pub use cookie::{
    CookieOptions,
    SynCookies,
    MSS_TABLE};

pub use dispatch::{
    Disposition,
    DropReason,
    ErrorClass,
    Inbound};

pub use feedback::{
    ErrorKind,
    Notification};

pub use listener::{
    ListenOptions,
    Listener};

pub use mapped::{
    map,
    Family,
    Inbound4,
    MAPPED_ANY,
    MAPPED_LOOPBACK,
    MIN_MSS};

pub use namespace::{
    Namespace,
    Owned,
    RecordKind,
    Secrets,
    SnapshotEntry};

pub use registry::FourTuple;

pub use stats::{
    Counter,
    StatsSnapshot};
