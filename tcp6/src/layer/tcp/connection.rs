//! Full connections.
//!
//! A [`Socket`] is shared between its user and the namespace. It has two locks. The control lock
//! protects the owner flag, the backlog of segments that arrived while the socket was owned and
//! markers for work deferred until release. The connection lock protects the protocol state. The
//! control lock is always taken first.
//!
//! [`Socket`]: struct.Socket.html
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::layer::SocketError;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv6Address, TcpFlags, TcpRepr, TcpSeqNumber, TcpTimestamp};

use super::auth::{AuthKey, KeyTable};
use super::dispatch::Inbound;
use super::handshake;
use super::mapped::Family;
use super::namespace::Namespace;
use super::provider::Route;
use super::registry::{FourTuple, Record};
use super::responder::{self, Path};
use super::stats::Counter;
use super::timer::{Target, TimerHandle, TimerKind};

/// Identifies a socket or listener within its namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u64);

/// The state of a connection, RFC 793 naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection.
    Closed,
    /// Waiting for SYNs.
    Listen,
    /// Our SYN is out.
    SynSent,
    /// Both SYNs seen, waiting for the acknowledgment of ours.
    SynReceived,
    /// The data transfer state.
    Established,
    /// Our FIN is out.
    FinWait1,
    /// Our FIN was acknowledged, waiting for the peer's.
    FinWait2,
    /// Both FINs crossed, waiting for the acknowledgment of ours.
    Closing,
    /// Both sides closed, lingering for stray segments.
    TimeWait,
    /// The peer closed, waiting for our user to close.
    CloseWait,
    /// Waiting for the acknowledgment of our FIN after the peer closed.
    LastAck,
}

impl State {
    /// Whether both sides have seen the initial sequence number of the other.
    pub fn is_synchronized(self) -> bool {
        match self {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }

    /// Whether we already sent our FIN.
    pub(crate) fn fin_sent(self) -> bool {
        match self {
            State::FinWait1 | State::FinWait2 | State::Closing
            | State::TimeWait | State::LastAck => true,
            _ => false,
        }
    }

    /// Whether data from the peer is still accepted.
    pub(crate) fn receives(self) -> bool {
        match self {
            State::SynReceived | State::Established | State::FinWait1 | State::FinWait2 => true,
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::Closing => write!(f, "CLOSING"),
            State::TimeWait => write!(f, "TIME-WAIT"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::LastAck => write!(f, "LAST-ACK"),
        }
    }
}

/// Traffic class, flow label and queueing priority of the segments of a flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowMeta {
    /// The IPv6 traffic class or IPv4 type of service.
    pub traffic_class: u8,
    /// The IPv6 flow label, 20 bits.
    pub flow_label: u32,
    /// Local queueing priority.
    pub priority: u32,
}

/// Options of a new socket.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// The local address, unspecified to choose by route.
    pub local: Ipv6Address,
    /// The local port, zero for an ephemeral port.
    pub local_port: u16,
    /// Bind to an interface.
    pub iface: Option<u32>,
    /// Refuse IPv4-mapped peers.
    pub v6only: bool,
    /// The signature keys of the socket.
    pub keys: Arc<KeyTable>,
    /// Metadata of sent segments.
    pub meta: FlowMeta,
    /// Drop segments with a lower hop limit.
    pub min_hopcount: u8,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            local: Ipv6Address::UNSPECIFIED,
            local_port: 0,
            iface: None,
            v6only: false,
            keys: Arc::new(KeyTable::new()),
            meta: FlowMeta::default(),
            min_hopcount: 0,
        }
    }
}

/// A copy of the interesting variables of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConnectionInfo {
    pub state: State,
    pub tuple: FourTuple,
    pub family: Family,
    pub iss: TcpSeqNumber,
    pub irs: TcpSeqNumber,
    pub snd_una: TcpSeqNumber,
    pub snd_nxt: TcpSeqNumber,
    /// The scaled send window.
    pub snd_window: u32,
    pub rcv_nxt: TcpSeqNumber,
    pub rcv_window: u32,
    /// Shift of the windows the peer sends.
    pub snd_wscale: u8,
    /// Shift of the windows we send.
    pub rcv_wscale: u8,
    /// The effective segment size.
    pub mss: u16,
    pub timestamps: bool,
    pub sack: bool,
    pub rto: Duration,
    pub backoff: u32,
    /// The last error that did not fail the connection.
    pub soft_error: Option<SocketError>,
}

/// A connection, shared between its user and the namespace.
///
/// Dropping the last reference without `close` or `abort` forgets the connection silently. Its
/// table record and timers are removed on the next call into the namespace.
pub struct Socket {
    id: SocketId,
    keys: Arc<KeyTable>,
    min_hopcount: AtomicU8,
    released: Released,
    pub(crate) control: Mutex<Control>,
    pub(crate) conn: Mutex<Connection>,
}

/// What a socket dropped by its user left in the namespace.
pub(crate) struct Leftover {
    pub(crate) tuple: FourTuple,
    pub(crate) registered: bool,
    pub(crate) timers: Vec<TimerHandle>,
}

/// Collects the leftovers of dropped sockets until the namespace removes them.
#[derive(Clone, Default)]
pub(crate) struct Released(Arc<Mutex<Vec<Leftover>>>);

pub(crate) struct Control {
    pub(crate) owned: bool,
    pub(crate) backlog: VecDeque<QueuedSegment>,
    pub(crate) deferred: Deferred,
}

/// Work postponed while the socket is owned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Deferred {
    pub(crate) mtu_reduced: bool,
    pub(crate) abort: Option<SocketError>,
    pub(crate) timers: u8,
}

/// A segment in the backlog, already validated and authenticated.
pub(crate) struct QueuedSegment {
    pub(crate) src: Ipv6Address,
    pub(crate) dst: Ipv6Address,
    pub(crate) hop_limit: u8,
    pub(crate) traffic_class: u8,
    pub(crate) flow_label: u32,
    pub(crate) iface: Option<u32>,
    pub(crate) family: Family,
    pub(crate) bytes: Vec<u8>,
}

pub(crate) struct Connection {
    pub(crate) state: State,
    pub(crate) previous: State,
    pub(crate) tuple: FourTuple,
    pub(crate) iface: Option<u32>,
    pub(crate) family: Family,
    pub(crate) v6only: bool,
    pub(crate) send: SendSequence,
    pub(crate) recv: RecvSequence,
    /// Window scaling was negotiated (or is being offered on our SYN).
    pub(crate) scaling: bool,
    pub(crate) mss: Mss,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) sack: bool,
    pub(crate) route: Option<Arc<Route>>,
    pub(crate) timers: Timers,
    pub(crate) rto: Duration,
    pub(crate) backoff: u32,
    pub(crate) retries: u32,
    pub(crate) error: Option<SocketError>,
    pub(crate) soft_error: Option<SocketError>,
    pub(crate) orphan: bool,
    pub(crate) meta: FlowMeta,
    pub(crate) hop_limit: u8,
    pub(crate) mtu_info: Option<u32>,
    pub(crate) last_received: Instant,
    pub(crate) probes: u32,
    pub(crate) registered: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SendSequence {
    pub(crate) iss: TcpSeqNumber,
    pub(crate) una: TcpSeqNumber,
    pub(crate) nxt: TcpSeqNumber,
    /// The scaled window of the peer.
    pub(crate) window: u32,
    pub(crate) wl1: TcpSeqNumber,
    pub(crate) wl2: TcpSeqNumber,
    /// Shift applied to window fields we receive.
    pub(crate) scale: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RecvSequence {
    pub(crate) irs: TcpSeqNumber,
    pub(crate) nxt: TcpSeqNumber,
    pub(crate) window: u32,
    /// Shift applied to window fields we send.
    pub(crate) scale: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Mss {
    pub(crate) advertised: u16,
    pub(crate) peer: u16,
    pub(crate) effective: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Timestamps {
    pub(crate) offset: u32,
    pub(crate) recent: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Timers {
    retransmit: Option<TimerHandle>,
    probe: Option<TimerHandle>,
    keepalive: Option<TimerHandle>,
    linger: Option<TimerHandle>,
}

/// The default segment size of a peer that sent no option, RFC 1122.
pub(crate) const DEFAULT_MSS: u16 = 536;

impl Socket {
    pub(crate) fn new(id: SocketId, options: SocketOptions, hop_limit: u8, released: Released) -> Self {
        let conn = Connection::new(&options, hop_limit);
        Self::with_connection(id, options.keys, options.min_hopcount, conn, released)
    }

    pub(crate) fn with_connection(
        id: SocketId,
        keys: Arc<KeyTable>,
        min_hopcount: u8,
        conn: Connection,
        released: Released,
    ) -> Self {
        Socket {
            id,
            keys,
            min_hopcount: AtomicU8::new(min_hopcount),
            released,
            control: Mutex::new(Control {
                owned: false,
                backlog: VecDeque::new(),
                deferred: Deferred::default(),
            }),
            conn: Mutex::new(conn),
        }
    }

    /// The identifier within the namespace.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.conn.lock().state
    }

    /// A copy of the connection variables.
    pub fn info(&self) -> ConnectionInfo {
        self.conn.lock().info()
    }

    /// Take the pending error, if any.
    ///
    /// Soft errors are only reported here after they caused the connection to fail. Until then
    /// they are visible in `info`.
    pub fn take_error(&self) -> Option<SocketError> {
        self.conn.lock().error.take()
    }

    /// The signature keys of this socket.
    pub fn keys(&self) -> &Arc<KeyTable> {
        &self.keys
    }

    /// Drop segments and error notifications that arrive with a lower hop limit.
    pub fn set_min_hopcount(&self, hops: u8) {
        self.min_hopcount.store(hops, Ordering::Relaxed)
    }

    /// The current hop limit floor.
    pub fn min_hopcount(&self) -> u8 {
        self.min_hopcount.load(Ordering::Relaxed)
    }

    /// Whether a user currently owns the socket.
    pub fn is_owned(&self) -> bool {
        self.control.lock().owned
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let conn = self.conn.get_mut();
        let timers = conn.timers.take_all();
        if conn.registered || !timers.is_empty() {
            self.released.0.lock().push(Leftover {
                tuple: conn.tuple,
                registered: conn.registered,
                timers,
            });
        }
    }
}

impl Released {
    pub(crate) fn take(&self) -> Vec<Leftover> {
        core::mem::replace(&mut *self.0.lock(), Vec::new())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .finish()
    }
}

impl Deferred {
    pub(crate) fn is_empty(&self) -> bool {
        *self == Deferred::default()
    }

    pub(crate) fn take(&mut self) -> Option<Deferred> {
        if self.is_empty() {
            None
        } else {
            Some(core::mem::replace(self, Deferred::default()))
        }
    }
}

impl QueuedSegment {
    pub(crate) fn new(packet: &Inbound, family: Family) -> Self {
        QueuedSegment {
            src: packet.src,
            dst: packet.dst,
            hop_limit: packet.hop_limit,
            traffic_class: packet.traffic_class,
            flow_label: packet.flow_label,
            iface: packet.iface,
            family,
            bytes: packet.segment.to_vec(),
        }
    }

    pub(crate) fn inbound(&self) -> Inbound<'_> {
        Inbound {
            src: self.src,
            dst: self.dst,
            hop_limit: self.hop_limit,
            traffic_class: self.traffic_class,
            flow_label: self.flow_label,
            iface: self.iface,
            segment: &self.bytes,
        }
    }
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> Option<&mut Option<TimerHandle>> {
        match kind {
            TimerKind::Retransmit => Some(&mut self.retransmit),
            TimerKind::ZeroWindowProbe => Some(&mut self.probe),
            TimerKind::Keepalive => Some(&mut self.keepalive),
            TimerKind::FinWait2 => Some(&mut self.linger),
            TimerKind::SynAck | TimerKind::TimeWait => None,
        }
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Retransmit => self.retransmit.is_some(),
            TimerKind::ZeroWindowProbe => self.probe.is_some(),
            TimerKind::Keepalive => self.keepalive.is_some(),
            TimerKind::FinWait2 => self.linger.is_some(),
            TimerKind::SynAck | TimerKind::TimeWait => false,
        }
    }

    /// Forget all armed timers, returning their handles.
    pub(crate) fn take_all(&mut self) -> Vec<TimerHandle> {
        let all = [self.retransmit.take(), self.probe.take(), self.keepalive.take(), self.linger.take()];
        all.iter().flatten().cloned().collect()
    }

    /// The earliest pending deadline.
    pub(crate) fn next(&self) -> Option<Instant> {
        [self.retransmit, self.probe, self.keepalive, self.linger].iter()
            .flatten()
            .map(|handle| handle.at())
            .min()
    }
}

impl Connection {
    pub(crate) fn new(options: &SocketOptions, hop_limit: u8) -> Self {
        Connection {
            state: State::Closed,
            previous: State::Closed,
            tuple: FourTuple {
                local: options.local,
                remote: Ipv6Address::UNSPECIFIED,
                local_port: options.local_port,
                remote_port: 0,
            },
            iface: options.iface,
            family: Family::Inet6,
            v6only: options.v6only,
            send: SendSequence::default(),
            recv: RecvSequence::default(),
            scaling: false,
            mss: Mss { advertised: DEFAULT_MSS, peer: DEFAULT_MSS, effective: DEFAULT_MSS },
            timestamps: None,
            sack: false,
            route: None,
            timers: Timers::default(),
            rto: Duration::from_secs(1),
            backoff: 0,
            retries: 0,
            error: None,
            soft_error: None,
            orphan: false,
            meta: options.meta,
            hop_limit,
            mtu_info: None,
            last_received: Instant::from_millis(0),
            probes: 0,
            registered: false,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            tuple: self.tuple,
            family: self.family,
            iss: self.send.iss,
            irs: self.recv.irs,
            snd_una: self.send.una,
            snd_nxt: self.send.nxt,
            snd_window: self.send.window,
            rcv_nxt: self.recv.nxt,
            rcv_window: self.recv.window,
            snd_wscale: self.send.scale,
            rcv_wscale: self.recv.scale,
            mss: self.mss.effective,
            timestamps: self.timestamps.is_some(),
            sack: self.sack,
            rto: self.rto,
            backoff: self.backoff,
            soft_error: self.soft_error,
        }
    }

    pub(crate) fn path(&self) -> Path {
        Path {
            tuple: self.tuple,
            next_hop: self.route.as_ref().map_or(self.tuple.remote, |route| route.next_hop),
            family: self.family,
            iface: self.iface,
            hop_limit: self.hop_limit,
            meta: self.meta,
        }
    }

    /// The window field of an outgoing segment.
    ///
    /// Only segments without SYN carry a scaled window.
    pub(crate) fn advertised_window(&self, syn: bool) -> u16 {
        let window = if syn {
            self.recv.window
        } else {
            self.recv.window >> self.recv.scale
        };
        window.min(u32::from(u16::MAX)) as u16
    }

    pub(crate) fn timestamp(&self, now: Instant) -> Option<TcpTimestamp> {
        self.timestamps.map(|ts| TcpTimestamp {
            tsval: (now.total_millis() as u32).wrapping_add(ts.offset),
            tsecr: ts.recent,
        })
    }

    /// The octets of data sent but not acknowledged, excluding SYN and FIN.
    pub(crate) fn data_in_flight(&self) -> usize {
        if !self.state.is_synchronized() {
            return 0;
        }
        let mut end = self.send.nxt;
        if self.state.fin_sent() {
            end = end - 1;
        }
        end.diff(self.send.una).max(0) as usize
    }

    /// The octets we may still send within the peer's window.
    pub(crate) fn send_window_left(&self) -> usize {
        let used = self.send.nxt.diff(self.send.una).max(0) as u32;
        self.send.window.saturating_sub(used) as usize
    }

    /// Take the negotiated options of a SYN sent by the peer.
    pub(crate) fn peer_syn_options(&mut self, repr: &TcpRepr) {
        self.mss.peer = repr.max_seg_size.unwrap_or(DEFAULT_MSS);
        self.mss.effective = self.mss.effective.min(self.mss.peer);
        match repr.window_scale {
            Some(scale) if self.scaling => self.send.scale = scale,
            _ => {
                self.scaling = false;
                self.send.scale = 0;
                self.recv.scale = 0;
                self.recv.window = self.recv.window.min(u32::from(u16::MAX));
            },
        }
        if !repr.sack_permitted {
            self.sack = false;
        }
        match (repr.timestamp, self.timestamps.as_mut()) {
            (Some(ts), Some(ours)) => ours.recent = ts.tsval,
            _ => self.timestamps = None,
        }
    }
}

/// One socket at one instant, with its namespace.
///
/// Bundles the parameters of all state machine operations on a locked connection.
pub(crate) struct Machine<'a> {
    pub(crate) ns: &'a Namespace,
    pub(crate) socket: &'a Arc<Socket>,
    pub(crate) now: Instant,
}

impl<'a> Machine<'a> {
    pub(crate) fn new(ns: &'a Namespace, socket: &'a Arc<Socket>, now: Instant) -> Self {
        Machine { ns, socket, now }
    }

    pub(crate) fn id(&self) -> SocketId {
        self.socket.id
    }

    pub(crate) fn record(&self) -> Record {
        Record::Connection(Arc::downgrade(self.socket))
    }

    pub(crate) fn set_state(&self, conn: &mut Connection, to: State) {
        if conn.state == to {
            return;
        }
        let from = conn.state;
        net_trace!("tcp {}: {} -> {}", conn.tuple, from, to);
        conn.previous = from;
        conn.state = to;
        self.ns.providers.engine.transition(self.id(), from, to);
    }

    pub(crate) fn key(&self, conn: &Connection) -> Option<Arc<AuthKey>> {
        self.socket.keys.lookup(&conn.tuple.remote, conn.iface)
    }

    /// Resolve the route again if the routing side invalidated it.
    pub(crate) fn refresh_route(&self, conn: &mut Connection) {
        if let Some(route) = conn.route.as_mut() {
            handshake::refresh(self.ns, route, &conn.tuple, conn.family, conn.iface);
        }
    }

    pub(crate) fn output(&self, conn: &mut Connection, repr: TcpRepr, payload: &[u8]) {
        self.refresh_route(conn);
        let key = self.key(conn);
        responder::output(self.ns, &conn.path(), repr, payload, key.as_deref());
    }

    /// A segment at `seq` acknowledging everything received.
    pub(crate) fn segment(&self, conn: &Connection, flags: TcpFlags, seq: TcpSeqNumber) -> TcpRepr {
        TcpRepr {
            flags,
            seq_number: seq,
            ack_number: Some(conn.recv.nxt),
            window_len: conn.advertised_window(false),
            timestamp: conn.timestamp(self.now),
            .. TcpRepr::default()
        }
    }

    /// Send our SYN, or our SYN-ACK on a simultaneous open.
    pub(crate) fn send_syn(&self, conn: &mut Connection) {
        let ack_number = match conn.state {
            State::SynReceived => Some(conn.recv.nxt),
            _ => None,
        };
        let repr = TcpRepr {
            flags: TcpFlags::SYN,
            seq_number: conn.send.iss,
            ack_number,
            window_len: conn.advertised_window(true),
            max_seg_size: Some(conn.mss.advertised),
            window_scale: if conn.scaling { Some(conn.recv.scale) } else { None },
            sack_permitted: conn.sack,
            timestamp: conn.timestamp(self.now),
            .. TcpRepr::default()
        };
        self.output(conn, repr, &[]);
    }

    pub(crate) fn send_ack(&self, conn: &mut Connection) {
        let repr = self.segment(conn, TcpFlags::default(), conn.send.nxt);
        self.output(conn, repr, &[]);
    }

    /// Send our FIN and account for it in the sequence space.
    pub(crate) fn send_fin(&self, conn: &mut Connection) {
        let repr = self.segment(conn, TcpFlags::FIN, conn.send.nxt);
        self.output(conn, repr, &[]);
        conn.send.nxt += 1;
        if !conn.timers.is_armed(TimerKind::Retransmit) {
            self.arm_retransmit(conn);
        }
    }

    /// Send a reset ending the connection from our side.
    pub(crate) fn send_reset(&self, conn: &mut Connection) {
        let repr = TcpRepr {
            flags: TcpFlags::RST,
            seq_number: conn.send.nxt,
            ack_number: None,
            window_len: 0,
            timestamp: conn.timestamp(self.now),
            .. TcpRepr::default()
        };
        self.output(conn, repr, &[]);
    }

    /// Send new data. Returns the number of octets sent.
    pub(crate) fn send_data(&self, conn: &mut Connection, data: &[u8]) -> usize {
        let len = data.len()
            .min(usize::from(conn.mss.effective))
            .min(conn.send_window_left());
        if len == 0 {
            if conn.send.window == 0 && !conn.timers.is_armed(TimerKind::ZeroWindowProbe) {
                let at = self.now + self.backed_off(conn.backoff);
                self.arm(conn, TimerKind::ZeroWindowProbe, at);
            }
            return 0;
        }
        let repr = self.segment(conn, TcpFlags::PSH, conn.send.nxt);
        self.output(conn, repr, &data[..len]);
        conn.send.nxt += len;
        if !conn.timers.is_armed(TimerKind::Retransmit) {
            self.arm_retransmit(conn);
        }
        len
    }

    /// Send the oldest unacknowledged data, or the FIN when no data is outstanding.
    ///
    /// Returns whether anything was sent.
    pub(crate) fn retransmit_oldest(&self, conn: &mut Connection) -> bool {
        let in_flight = conn.data_in_flight().min(usize::from(conn.mss.effective));
        if in_flight > 0 {
            let engine = &self.ns.providers.engine;
            if let Some(mut data) = engine.oldest_unacked(self.id(), in_flight) {
                data.truncate(in_flight);
                if !data.is_empty() {
                    let repr = self.segment(conn, TcpFlags::PSH, conn.send.una);
                    self.output(conn, repr, &data);
                    engine.retransmit(self.id(), conn.send.una, data.len());
                    return true;
                }
            }
        }
        if conn.state.fin_sent() && conn.send.una != conn.send.nxt {
            let repr = self.segment(conn, TcpFlags::FIN, conn.send.nxt - 1);
            self.output(conn, repr, &[]);
            return true;
        }
        false
    }

    pub(crate) fn backed_off(&self, backoff: u32) -> Duration {
        let config = &self.ns.config;
        let millis = config.rto_initial.as_millis()
            .checked_shl(backoff.min(32))
            .unwrap_or(u128::MAX);
        Duration::from_millis(millis.min(config.rto_max.as_millis()) as u64)
    }

    pub(crate) fn arm(&self, conn: &mut Connection, kind: TimerKind, at: Instant) {
        let timers = &self.ns.timers;
        let target = Target::Socket(Arc::downgrade(self.socket));
        if let Some(slot) = conn.timers.slot(kind) {
            if let Some(old) = slot.take() {
                timers.disarm(old);
            }
            *slot = Some(timers.arm(at, target, kind));
        }
    }

    pub(crate) fn arm_retransmit(&self, conn: &mut Connection) {
        conn.rto = self.backed_off(conn.backoff);
        let at = self.now + conn.rto;
        self.arm(conn, TimerKind::Retransmit, at);
    }

    pub(crate) fn disarm(&self, conn: &mut Connection, kind: TimerKind) {
        if let Some(handle) = conn.timers.slot(kind).and_then(Option::take) {
            self.ns.timers.disarm(handle);
        }
    }

    pub(crate) fn disarm_all(&self, conn: &mut Connection) {
        for &kind in TimerKind::SOCKET.iter() {
            self.disarm(conn, kind);
        }
    }

    /// Forget a fired timer.
    pub(crate) fn fired(&self, conn: &mut Connection, kind: TimerKind) {
        if let Some(slot) = conn.timers.slot(kind) {
            *slot = None;
        }
    }

    fn deregister(&self, conn: &mut Connection) {
        if conn.registered {
            self.ns.registry.remove(&conn.tuple, &self.record());
            conn.registered = false;
        }
        self.ns.orphans.lock().remove(&self.id());
    }

    /// Tear the connection down without telling the peer.
    pub(crate) fn close(&self, conn: &mut Connection) {
        self.disarm_all(conn);
        self.deregister(conn);
        self.set_state(conn, State::Closed);
    }

    /// Tear the connection down and report `error` to the owner.
    pub(crate) fn fail(&self, conn: &mut Connection, error: SocketError) {
        if conn.error.is_none() {
            conn.error = Some(error);
        }
        self.close(conn)
    }

    /// Hand the connection over to a time-wait record.
    pub(crate) fn enter_time_wait(&self, conn: &mut Connection) {
        self.disarm_all(conn);
        self.set_state(conn, State::TimeWait);
        if conn.registered && self.ns.time_wait.enter(self.ns, self.socket, conn, self.now) {
            conn.registered = false;
        }
        self.deregister(conn);
    }

    /// Handle an expired timer of an unowned socket.
    pub(crate) fn on_timer(&self, conn: &mut Connection, kind: TimerKind) {
        self.fired(conn, kind);
        match kind {
            TimerKind::Retransmit => self.retransmit_timeout(conn),
            TimerKind::ZeroWindowProbe => self.window_probe(conn),
            TimerKind::Keepalive => self.keepalive(conn),
            TimerKind::FinWait2 => if conn.state == State::FinWait2 {
                net_debug!("tcp {}: orphan lingered too long in FIN-WAIT-2", conn.tuple);
                self.close(conn);
            },
            TimerKind::SynAck | TimerKind::TimeWait => (),
        }
    }

    fn retransmit_timeout(&self, conn: &mut Connection) {
        if conn.send.una == conn.send.nxt || conn.state == State::Closed {
            return;
        }
        let config = &self.ns.config;
        let limit = match conn.state {
            State::SynSent => config.syn_retries,
            State::SynReceived => config.synack_retries,
            _ => config.retries,
        };
        if conn.retries >= limit {
            net_debug!("tcp {}: giving up after {} retransmissions", conn.tuple, conn.retries);
            self.ns.stats.inc(Counter::Timeouts);
            if !conn.state.is_synchronized() {
                self.ns.stats.inc(Counter::AttemptFails);
            }
            let error = conn.soft_error.take().unwrap_or(SocketError::TimedOut);
            self.fail(conn, error);
            return;
        }

        conn.retries += 1;
        conn.backoff += 1;
        self.ns.stats.inc(Counter::Retransmits);
        match conn.state {
            State::SynSent | State::SynReceived => self.send_syn(conn),
            _ => { self.retransmit_oldest(conn); },
        }
        self.arm_retransmit(conn);
    }

    fn window_probe(&self, conn: &mut Connection) {
        let open = match conn.state {
            State::Established | State::CloseWait => conn.send.window == 0,
            _ => false,
        };
        if !open {
            return;
        }
        // An old sequence number forces an acknowledgment carrying the current window.
        let repr = self.segment(conn, TcpFlags::default(), conn.send.una - 1);
        self.output(conn, repr, &[]);
        self.ns.providers.engine.probe(self.id());
        self.ns.stats.inc(Counter::WindowProbes);
        conn.probes += 1;
        let at = self.now + self.backed_off(conn.probes);
        self.arm(conn, TimerKind::ZeroWindowProbe, at);
    }

    pub(crate) fn arm_keepalive(&self, conn: &mut Connection) {
        if let Some(keepalive) = self.ns.config.keepalive {
            let at = conn.last_received + keepalive.idle;
            self.arm(conn, TimerKind::Keepalive, at);
        }
    }

    fn keepalive(&self, conn: &mut Connection) {
        let keepalive = match self.ns.config.keepalive {
            Some(keepalive) => keepalive,
            None => return,
        };
        match conn.state {
            State::Established | State::CloseWait => (),
            _ => return,
        }
        if self.now.saturating_since(conn.last_received) < keepalive.idle {
            let at = conn.last_received + keepalive.idle;
            self.arm(conn, TimerKind::Keepalive, at);
            return;
        }
        if conn.probes >= keepalive.probes {
            net_debug!("tcp {}: keepalive unanswered", conn.tuple);
            self.ns.stats.inc(Counter::Timeouts);
            let error = conn.soft_error.take().unwrap_or(SocketError::TimedOut);
            self.fail(conn, error);
            return;
        }
        let repr = self.segment(conn, TcpFlags::default(), conn.send.una - 1);
        self.output(conn, repr, &[]);
        self.ns.stats.inc(Counter::KeepaliveProbes);
        conn.probes += 1;
        let at = self.now + keepalive.interval;
        self.arm(conn, TimerKind::Keepalive, at);
    }

    /// Apply markers collected while the socket was owned.
    pub(crate) fn apply_deferred(&self, conn: &mut Connection, deferred: Deferred) {
        if let Some(error) = deferred.abort {
            if conn.state != State::Closed {
                self.ns.stats.inc(Counter::IcmpHardErrors);
                self.fail(conn, error);
            }
            return;
        }
        if deferred.mtu_reduced {
            self.mtu_reduced(conn);
        }
        for &kind in TimerKind::SOCKET.iter() {
            // Re-armed by the owner in the meantime.
            if conn.timers.is_armed(kind) {
                continue;
            }
            if deferred.timers & kind.bit() != 0 {
                self.on_timer(conn, kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established() -> Connection {
        let mut conn = Connection::new(&SocketOptions::default(), 64);
        conn.state = State::Established;
        conn.send.iss = TcpSeqNumber(1000);
        conn.send.una = TcpSeqNumber(1001);
        conn.send.nxt = TcpSeqNumber(1101);
        conn.send.window = 150;
        conn.recv.window = 65535 << 7;
        conn.recv.scale = 7;
        conn
    }

    #[test]
    fn windows() {
        let conn = established();
        assert_eq!(conn.advertised_window(false), 65535);
        assert_eq!(conn.advertised_window(true), 65535);
        assert_eq!(conn.send_window_left(), 50);
        assert_eq!(conn.data_in_flight(), 100);
    }

    #[test]
    fn fin_is_not_data() {
        let mut conn = established();
        conn.state = State::FinWait1;
        conn.send.nxt = TcpSeqNumber(1102);
        assert_eq!(conn.data_in_flight(), 100);
        conn.state = State::SynSent;
        assert_eq!(conn.data_in_flight(), 0);
    }

    #[test]
    fn negotiation_falls_back() {
        let mut conn = established();
        conn.scaling = true;
        conn.sack = true;
        conn.timestamps = Some(Timestamps { offset: 5, recent: 0 });
        conn.mss.effective = 1440;
        let repr = TcpRepr {
            flags: TcpFlags::SYN,
            max_seg_size: Some(1220),
            .. TcpRepr::default()
        };
        conn.peer_syn_options(&repr);
        assert_eq!(conn.mss.effective, 1220);
        assert!(!conn.scaling);
        assert_eq!(conn.recv.scale, 0);
        assert!(!conn.sack);
        assert_eq!(conn.timestamps, None);
    }

    #[test]
    fn deferred_markers() {
        let mut deferred = Deferred::default();
        assert!(deferred.take().is_none());
        deferred.timers |= TimerKind::Keepalive.bit();
        let taken = deferred.take().unwrap();
        assert_eq!(taken.timers, TimerKind::Keepalive.bit());
        assert!(deferred.is_empty());
    }
}
