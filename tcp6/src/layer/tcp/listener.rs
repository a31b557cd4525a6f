//! Listening sockets.
//!
//! A listener owns the half-open requests of its port and the queue of promoted connections not
//! yet accepted. Requests are reachable only through it. Its state lock comes before any socket
//! lock and before the registry.
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::time::Instant;
use crate::wire::Ipv6Address;

use super::auth::KeyTable;
use super::connection::{FlowMeta, Socket, SocketId};
use super::registry::FourTuple;
use super::request::RequestSocket;

/// Options of a new listener.
#[derive(Clone, Debug)]
pub struct ListenOptions {
    /// The local address, unspecified for all addresses.
    pub local: Ipv6Address,
    /// The local port.
    pub port: u16,
    /// Bind to an interface.
    pub iface: Option<u32>,
    /// Refuse IPv4-mapped peers.
    pub v6only: bool,
    /// Capacity of the accept queue.
    pub backlog: usize,
    /// Keys shared with accepted connections.
    pub keys: Arc<KeyTable>,
    /// Metadata of sent segments.
    pub meta: FlowMeta,
    /// Drop segments with a lower hop limit.
    pub min_hopcount: u8,
}

/// A socket in LISTEN state.
pub struct Listener {
    id: SocketId,
    local: Ipv6Address,
    port: u16,
    iface: Option<u32>,
    v6only: bool,
    keys: Arc<KeyTable>,
    backlog: usize,
    min_hopcount: AtomicU8,
    meta: FlowMeta,
    pub(crate) state: Mutex<ListenState>,
}

pub(crate) struct ListenState {
    /// Cleared when the listener is closed, no new requests are accepted afterwards.
    pub(crate) open: bool,
    pub(crate) requests: BTreeMap<FourTuple, RequestSocket>,
    pub(crate) accept: VecDeque<Arc<Socket>>,
    /// The last time a SYN was answered with a cookie.
    pub(crate) last_overflow: Option<Instant>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        ListenOptions {
            local: Ipv6Address::UNSPECIFIED,
            port: 0,
            iface: None,
            v6only: false,
            backlog: 128,
            keys: Arc::new(KeyTable::new()),
            meta: FlowMeta::default(),
            min_hopcount: 0,
        }
    }
}

impl Listener {
    pub(crate) fn new(id: SocketId, options: ListenOptions) -> Self {
        Listener {
            id,
            local: options.local,
            port: options.port,
            iface: options.iface,
            v6only: options.v6only,
            keys: options.keys,
            backlog: options.backlog,
            min_hopcount: AtomicU8::new(options.min_hopcount),
            meta: options.meta,
            state: Mutex::new(ListenState {
                open: true,
                requests: BTreeMap::new(),
                accept: VecDeque::new(),
                last_overflow: None,
            }),
        }
    }

    /// The identifier within the namespace.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The bound address.
    pub fn local(&self) -> Ipv6Address {
        self.local
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The bound interface.
    pub fn iface(&self) -> Option<u32> {
        self.iface
    }

    /// Whether IPv4-mapped peers are refused.
    pub fn v6only(&self) -> bool {
        self.v6only
    }

    /// The signature keys, shared with accepted connections.
    pub fn keys(&self) -> &Arc<KeyTable> {
        &self.keys
    }

    /// Capacity of the accept queue.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub(crate) fn meta(&self) -> FlowMeta {
        self.meta
    }

    /// Drop SYNs and handshake completions that arrive with a lower hop limit.
    pub fn set_min_hopcount(&self, hops: u8) {
        self.min_hopcount.store(hops, Ordering::Relaxed)
    }

    /// The current hop limit floor.
    pub fn min_hopcount(&self) -> u8 {
        self.min_hopcount.load(Ordering::Relaxed)
    }

    /// Half-open requests currently stored.
    pub fn pending(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Connections waiting to be accepted.
    pub fn ready(&self) -> usize {
        self.state.lock().accept.len()
    }
}

impl ListenState {
    pub(crate) fn accept_full(&self, backlog: usize) -> bool {
        self.accept.len() >= backlog
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("port", &self.port)
            .finish()
    }
}
