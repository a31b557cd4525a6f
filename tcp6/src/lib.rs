//! Connection establishment, state tracking and teardown for TCP over IPv6.
//!
//! ## Table of contents
//!
//! 1. [Design](#design)
//! 2. [The wire module](wire/index.html)
//!    1. [Addresses and checksums](wire/ip/index.html)
//!    1. [Tcp segments](wire/tcp/index.html)
//!    1. [Icmpv6 error messages](wire/icmpv6/index.html)
//! 3. [The tcp layer](layer/tcp/index.html)
//!    1. [Namespaces](layer/tcp/struct.Namespace.html)
//!    1. [Collaborators](layer/tcp/provider/index.html)
//!
//! ## Design
//!
//! The crate implements the connection core of a TCP stack: the handshake (with SYN cookies under
//! pressure), the segment state machine, time-wait handling, resets, keyed segment signatures and
//! the reaction to network error reports. Everything that concerns the byte stream itself is
//! delegated to a [`SegmentEngine`], routing to a [`Routing`] provider and actual transmission to
//! an [`Egress`]. IPv4 peers are served through IPv4-mapped addresses, the tables are shared.
//!
//! All state lives in an explicitly created [`Namespace`]. There are no globals. Connections are
//! shared between the receive path, timers and the owner of the socket and each one carries an
//! owner flag with a backlog of segments queued while the owner holds it.
//!
//! [`SegmentEngine`]: layer/tcp/provider/trait.SegmentEngine.html
//! [`Routing`]: layer/tcp/provider/trait.Routing.html
//! [`Egress`]: layer/tcp/provider/trait.Egress.html
//! [`Namespace`]: layer/tcp/struct.Namespace.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use] mod macros;
pub mod layer;
pub mod time;
pub mod wire;
