//! The collaborators of a namespace.
//!
//! The connection core does not buffer the byte stream, resolve routes or put packets on a wire.
//! These concerns are reached through the traits of this module, bundled in [`Providers`]. Each
//! trait has a minimal default implementation so that a namespace can run stand-alone, for tests
//! and the loopback demo.
//!
//! All collaborators are called while the locks of the affected socket are held. They must not
//! call back into the namespace. In particular an `Egress` must queue the packet instead of
//! delivering it synchronously to another namespace.
//!
//! [`Providers`]: struct.Providers.html
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use blake2::VarBlake2s;
use blake2::digest::{Update, VariableOutputDirty};

use crate::layer::{Error, Result};
use crate::time::Instant;
use crate::wire::{Ipv6Address, PseudoHeader, TcpSeqNumber};
use crate::wire::ip::checksum;

use super::connection::{SocketId, State};
use super::mapped::Family;
use super::registry::FourTuple;

/// Primitives for segment checksums and signatures.
pub trait Hasher: Send + Sync {
    /// The complemented internet checksum of pseudo header and segment.
    ///
    /// Zero for a segment whose checksum field is correct.
    fn checksum(&self, pseudo: &PseudoHeader, data: &[u8]) -> u16;

    /// A 16 octet keyed digest over the concatenation of `parts`.
    fn keyed_hash(&self, key: &[u8], parts: &[&[u8]]) -> [u8; 16];
}

/// The default hasher: RFC 1071 checksum and keyed BLAKE2s with 16 octets output.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake2Hasher;

impl Hasher for Blake2Hasher {
    fn checksum(&self, pseudo: &PseudoHeader, data: &[u8]) -> u16 {
        checksum::transport(pseudo, data)
    }

    fn keyed_hash(&self, key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
        // BLAKE2s takes at most 32 octets of key.
        let mut long = [0u8; 32];
        let key = if key.len() > 32 {
            let mut hasher = VarBlake2s::new_keyed(&[], 32);
            hasher.update(key);
            hasher.finalize_variable_dirty(|cb| long.copy_from_slice(cb));
            &long[..]
        } else {
            key
        };

        let mut keyed = VarBlake2s::new_keyed(key, 16);
        for part in parts {
            keyed.update(part);
        }
        let mut output = [0u8; 16];
        keyed.finalize_variable_dirty(|cb| output.copy_from_slice(cb));
        output
    }
}

/// A cached route.
///
/// Connections hold a strong reference. The routing provider keeps whatever it wants and signals
/// changes only through the validity flag and the path MTU.
#[derive(Debug)]
pub struct Route {
    /// The first hop towards the destination.
    pub next_hop: Ipv6Address,
    /// The preferred source address.
    pub source: Ipv6Address,
    /// The outgoing interface.
    pub iface: Option<u32>,
    mtu: AtomicU32,
    valid: AtomicBool,
}

impl Route {
    /// Create a valid route.
    pub fn new(next_hop: Ipv6Address, source: Ipv6Address, iface: Option<u32>, mtu: u32) -> Self {
        Route {
            next_hop,
            source,
            iface,
            mtu: AtomicU32::new(mtu),
            valid: AtomicBool::new(true),
        }
    }

    /// The current path MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Replace the path MTU.
    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Relaxed)
    }

    /// Whether the route may still be used.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the route stale, users resolve it again on next use.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release)
    }
}

/// The parameters of a route lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteQuery {
    /// The remote address.
    pub destination: Ipv6Address,
    /// The bound local address, if any.
    pub source: Option<Ipv6Address>,
    /// The bound interface, if any.
    pub iface: Option<u32>,
    /// The network layer that will carry the flow.
    pub family: Family,
}

/// Route resolution and path MTU bookkeeping.
pub trait Routing: Send + Sync {
    /// Find a route, or fail with `Error::Unreachable`.
    fn resolve(&self, query: &RouteQuery) -> Result<Arc<Route>>;

    /// Record a reduced path MTU reported by the network.
    fn update_pmtu(&self, route: &Route, mtu: u32) {
        if mtu < route.mtu() {
            route.set_mtu(mtu);
        }
    }

    /// A router told us about a better first hop.
    fn redirect(&self, route: &Route, _target: Ipv6Address) {
        route.invalidate()
    }
}

/// Every destination is on-link, with one source address per family.
#[derive(Clone, Copy, Debug)]
pub struct OnLink {
    /// The source of native IPv6 flows.
    pub source: Ipv6Address,
    /// The (mapped) source of IPv4 flows.
    pub source_v4: Option<Ipv6Address>,
    /// The link MTU.
    pub mtu: u32,
}

impl Routing for OnLink {
    fn resolve(&self, query: &RouteQuery) -> Result<Arc<Route>> {
        let source = match (query.family, query.source) {
            (_, Some(source)) => source,
            (Family::Inet6, None) => self.source,
            (Family::Mapped, None) => self.source_v4.ok_or(Error::Unreachable)?,
        };
        Ok(Arc::new(Route::new(query.destination, source, query.iface, self.mtu)))
    }
}

/// The byte stream half of a connection.
///
/// Receives notifications from the state machine and hands back data that must be sent again.
pub trait SegmentEngine: Send + Sync {
    /// The connection changed its state.
    fn transition(&self, socket: SocketId, from: State, to: State);

    /// In-order data starting at `seq` arrived.
    ///
    /// Returns the number of octets accepted, by which the receive sequence advances.
    fn receive(&self, socket: SocketId, seq: TcpSeqNumber, data: &[u8]) -> usize;

    /// The peer acknowledged everything before `ack`.
    fn acknowledged(&self, socket: SocketId, ack: TcpSeqNumber);

    /// The oldest unacknowledged data, at most `max_len` octets.
    fn oldest_unacked(&self, socket: SocketId, max_len: usize) -> Option<Vec<u8>>;

    /// A range was sent again, e.g. after the path MTU dropped.
    fn retransmit(&self, socket: SocketId, seq: TcpSeqNumber, len: usize);

    /// A zero window probe was sent.
    fn probe(&self, socket: SocketId);

    /// The effective segment size changed.
    fn mss_changed(&self, socket: SocketId, mss: u16);
}

/// An engine that accepts all data and never has anything to retransmit.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEngine;

impl SegmentEngine for NullEngine {
    fn transition(&self, _: SocketId, _: State, _: State) { }

    fn receive(&self, _: SocketId, _: TcpSeqNumber, data: &[u8]) -> usize {
        data.len()
    }

    fn acknowledged(&self, _: SocketId, _: TcpSeqNumber) { }

    fn oldest_unacked(&self, _: SocketId, _: usize) -> Option<Vec<u8>> {
        None
    }

    fn retransmit(&self, _: SocketId, _: TcpSeqNumber, _: usize) { }

    fn probe(&self, _: SocketId) { }

    fn mss_changed(&self, _: SocketId, _: u16) { }
}

/// A segment ready to be wrapped in a network layer header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Whether to send as IPv6 or, for mapped addresses, as IPv4.
    pub family: Family,
    /// The source address.
    pub src: Ipv6Address,
    /// The destination address.
    pub dst: Ipv6Address,
    /// The first hop, the destination itself when it is on-link.
    pub next_hop: Ipv6Address,
    /// The hop limit or time to live.
    pub hop_limit: u8,
    /// The traffic class or type of service.
    pub traffic_class: u8,
    /// The flow label, ignored for IPv4.
    pub flow_label: u32,
    /// Local queueing priority.
    pub priority: u32,
    /// The interface to send on.
    pub iface: Option<u32>,
    /// The full TCP segment, checksum included.
    pub segment: Vec<u8>,
}

/// The output of a namespace.
pub trait Egress: Send + Sync {
    /// Send a segment. Failure is not reported, TCP recovers from loss.
    fn transmit(&self, packet: Outbound);
}

/// The reason an admission check is performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admit {
    /// An inbound SYN on a listener.
    Syn,
    /// A local connect.
    Connect,
}

/// A policy hook consulted before any state is allocated for a new connection.
pub trait Admission: Send + Sync {
    /// Return `false` to refuse the attempt.
    fn admit(&self, tuple: &FourTuple, kind: Admit) -> bool;
}

/// Admit everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Admission for AllowAll {
    fn admit(&self, _: &FourTuple, _: Admit) -> bool {
        true
    }
}

/// The source of initial sequence numbers.
///
/// Without one a namespace derives them from its secret, following RFC 6528. Replacing it makes
/// handshakes reproducible.
pub trait SequenceSource: Send + Sync {
    /// The initial sequence number of a new connection on `tuple`.
    fn initial(&self, tuple: &FourTuple, now: Instant) -> TcpSeqNumber;
}

/// The set of collaborators of a namespace.
pub struct Providers {
    pub(crate) routing: Box<dyn Routing>,
    pub(crate) hasher: Box<dyn Hasher>,
    pub(crate) engine: Box<dyn SegmentEngine>,
    pub(crate) egress: Box<dyn Egress>,
    pub(crate) admission: Box<dyn Admission>,
    pub(crate) sequence: Option<Box<dyn SequenceSource>>,
}

impl Providers {
    /// Collaborators with the default hasher, a `NullEngine` and no admission policy.
    pub fn new(routing: impl Routing + 'static, egress: impl Egress + 'static) -> Self {
        Providers {
            routing: Box::new(routing),
            hasher: Box::new(Blake2Hasher),
            engine: Box::new(NullEngine),
            egress: Box::new(egress),
            admission: Box::new(AllowAll),
            sequence: None,
        }
    }

    /// Replace the segment engine.
    pub fn with_engine(self, engine: impl SegmentEngine + 'static) -> Self {
        Providers { engine: Box::new(engine), ..self }
    }

    /// Replace the hasher.
    pub fn with_hasher(self, hasher: impl Hasher + 'static) -> Self {
        Providers { hasher: Box::new(hasher), ..self }
    }

    /// Replace the admission policy.
    pub fn with_admission(self, admission: impl Admission + 'static) -> Self {
        Providers { admission: Box::new(admission), ..self }
    }

    /// Replace the keyed initial sequence numbers.
    pub fn with_sequence(self, sequence: impl SequenceSource + 'static) -> Self {
        Providers { sequence: Some(Box::new(sequence)), ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_hash_depends_on_key_and_data() {
        let hasher = Blake2Hasher;
        let a = hasher.keyed_hash(b"secret", &[b"abc", b"def"]);
        assert_eq!(a, hasher.keyed_hash(b"secret", &[b"abcdef"]));
        assert_ne!(a, hasher.keyed_hash(b"secreT", &[b"abcdef"]));
        assert_ne!(a, hasher.keyed_hash(b"secret", &[b"abcdeF"]));
    }

    #[test]
    fn long_keys() {
        let hasher = Blake2Hasher;
        let long = [0x33; 80];
        let mut other = long;
        other[79] = 0x34;
        assert_ne!(hasher.keyed_hash(&long, &[b"x"]), hasher.keyed_hash(&other, &[b"x"]));
    }

    #[test]
    fn route_flags() {
        let routes = OnLink { source: Ipv6Address::LOOPBACK, source_v4: None, mtu: 1500 };
        let query = RouteQuery {
            destination: Ipv6Address::LOOPBACK,
            source: None,
            iface: None,
            family: Family::Inet6,
        };
        let route = routes.resolve(&query).unwrap();
        routes.update_pmtu(&route, 1400);
        routes.update_pmtu(&route, 1450);
        assert_eq!(route.mtu(), 1400);
        routes.redirect(&route, Ipv6Address::UNSPECIFIED);
        assert!(!route.is_valid());

        let mapped = RouteQuery { family: Family::Mapped, ..query };
        assert_eq!(routes.resolve(&mapped).err(), Some(Error::Unreachable));
    }
}
