//! Segment validation and dispatch.
//!
//! A received segment passes, in this order, the address checks, the checksum, header parsing, the
//! table lookup and authentication before any state is touched. It then takes one of four paths:
//! listener, half-open request, full connection or time-wait record.
//!
//! Full connections are processed in place when nobody owns the socket and queued otherwise. The
//! processing follows RFC 793 with the RFC 5961 mitigations, preceded by a fast path for the
//! common case of in-order data and pure acknowledgments on an established connection.
use alloc::sync::Arc;
use core::fmt;

use crate::layer::SocketError;
use crate::time::Instant;
use crate::wire::{Ipv6Address, PseudoHeader, TcpPacket, TcpRepr, TcpSeqNumber};

use super::auth::{self, AuthFailure, KeyTable};
use super::connection::{Connection, Machine, QueuedSegment, Socket, State};
use super::handshake;
use super::mapped::Family;
use super::namespace::Namespace;
use super::registry::{FourTuple, Lookup};
use super::responder;
use super::stats::Counter;
use super::timer::TimerKind;
use super::timewait;

/// A received segment with the metadata of its network layer header.
#[derive(Clone, Copy, Debug)]
pub struct Inbound<'a> {
    /// The source address.
    pub src: Ipv6Address,
    /// The destination address.
    pub dst: Ipv6Address,
    /// The remaining hop limit.
    pub hop_limit: u8,
    /// The traffic class.
    pub traffic_class: u8,
    /// The flow label.
    pub flow_label: u32,
    /// The interface the segment arrived on.
    pub iface: Option<u32>,
    /// The TCP segment, header and payload.
    pub segment: &'a [u8],
}

/// What happened to a received segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processed, state may have changed.
    Accepted,
    /// Queued to the backlog of an owned socket.
    Queued,
    /// Not accepted but answered with a control segment.
    Answered,
    /// Dropped without reply.
    Dropped(DropReason),
}

/// Why a segment was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Multicast or unspecified source or destination.
    AddressRejected,
    /// An IPv4-mapped address on the native IPv6 path.
    MappedOnInet6,
    /// The checksum did not verify.
    Checksum,
    /// The header could not be parsed.
    Malformed,
    /// No record matches the segment.
    NoSocket,
    /// The hop limit is below the floor of the record.
    MinHopcount,
    /// The segment failed authentication.
    Auth(AuthFailure),
    /// The backlog of an owned socket is full.
    BacklogFull,
    /// The accept queue of the listener is full.
    ListenOverflow,
    /// The request table of the listener is full and cookies are disabled.
    RequestTableFull,
    /// The admission policy refused the connection.
    AdmissionDenied,
    /// An acknowledgment to a listener carried an invalid cookie.
    CookieFailed,
    /// The timestamp was older than the last one seen.
    Paws,
    /// The sequence number was outside the receive window.
    OutOfWindow,
    /// The acknowledgment number was not acceptable.
    AckUnacceptable,
    /// The control flags were not valid for the state.
    UnexpectedFlags,
    /// No route towards the peer.
    NoRoute,
}

/// The broad class of a drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Could not be parsed or failed the checksum.
    MalformedSegment,
    /// Not matching any state we would expect from a legitimate peer.
    SpoofedOrUnexpected,
    /// Valid syntax but invalid for the state of the connection.
    ProtocolViolation,
    /// A queue or table was full.
    ResourceExhaustion,
    /// The network did not allow an answer.
    NetworkError,
}

impl DropReason {
    /// The class of this reason.
    pub fn class(self) -> ErrorClass {
        match self {
            DropReason::Checksum
            | DropReason::Malformed => ErrorClass::MalformedSegment,
            DropReason::AddressRejected
            | DropReason::MappedOnInet6
            | DropReason::NoSocket
            | DropReason::MinHopcount
            | DropReason::Auth(_)
            | DropReason::CookieFailed
            | DropReason::Paws
            | DropReason::OutOfWindow => ErrorClass::SpoofedOrUnexpected,
            DropReason::AckUnacceptable
            | DropReason::UnexpectedFlags => ErrorClass::ProtocolViolation,
            DropReason::BacklogFull
            | DropReason::ListenOverflow
            | DropReason::RequestTableFull
            | DropReason::AdmissionDenied => ErrorClass::ResourceExhaustion,
            DropReason::NoRoute => ErrorClass::NetworkError,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DropReason::AddressRejected => write!(f, "address rejected"),
            DropReason::MappedOnInet6 => write!(f, "mapped address on native path"),
            DropReason::Checksum => write!(f, "bad checksum"),
            DropReason::Malformed => write!(f, "malformed header"),
            DropReason::NoSocket => write!(f, "no socket"),
            DropReason::MinHopcount => write!(f, "hop limit below floor"),
            DropReason::Auth(AuthFailure::NotFound) => write!(f, "signature missing"),
            DropReason::Auth(AuthFailure::Unexpected) => write!(f, "unexpected signature"),
            DropReason::Auth(AuthFailure::Mismatch) => write!(f, "signature mismatch"),
            DropReason::BacklogFull => write!(f, "backlog full"),
            DropReason::ListenOverflow => write!(f, "accept queue full"),
            DropReason::RequestTableFull => write!(f, "request table full"),
            DropReason::AdmissionDenied => write!(f, "admission denied"),
            DropReason::CookieFailed => write!(f, "invalid cookie"),
            DropReason::Paws => write!(f, "old timestamp"),
            DropReason::OutOfWindow => write!(f, "outside window"),
            DropReason::AckUnacceptable => write!(f, "unacceptable acknowledgment"),
            DropReason::UnexpectedFlags => write!(f, "unexpected flags"),
            DropReason::NoRoute => write!(f, "no route"),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorClass::MalformedSegment => write!(f, "malformed segment"),
            ErrorClass::SpoofedOrUnexpected => write!(f, "spoofed or unexpected"),
            ErrorClass::ProtocolViolation => write!(f, "protocol violation"),
            ErrorClass::ResourceExhaustion => write!(f, "resource exhaustion"),
            ErrorClass::NetworkError => write!(f, "network error"),
        }
    }
}

/// A parsed segment, addresses from the local point of view.
pub(crate) struct Segment<'a> {
    pub(crate) tuple: FourTuple,
    pub(crate) family: Family,
    pub(crate) iface: Option<u32>,
    pub(crate) hop_limit: u8,
    pub(crate) traffic_class: u8,
    pub(crate) flow_label: u32,
    pub(crate) repr: TcpRepr,
    pub(crate) pseudo: PseudoHeader,
    pub(crate) bytes: &'a [u8],
    pub(crate) payload: &'a [u8],
}

impl<'a> Segment<'a> {
    pub(crate) fn parse(packet: &Inbound<'a>, family: Family) -> Result<Self, DropReason> {
        let bytes = packet.segment;
        let tcp = TcpPacket::new_checked(bytes).map_err(|_| DropReason::Malformed)?;
        let repr = TcpRepr::parse(&tcp).map_err(|_| DropReason::Malformed)?;
        let header_len = usize::from(tcp.header_len());
        Ok(Segment {
            tuple: FourTuple {
                local: packet.dst,
                remote: packet.src,
                local_port: repr.dst_port,
                remote_port: repr.src_port,
            },
            family,
            iface: packet.iface,
            hop_limit: packet.hop_limit,
            traffic_class: packet.traffic_class,
            flow_label: packet.flow_label,
            repr,
            pseudo: family.pseudo_header(packet.src, packet.dst, bytes.len()),
            bytes,
            payload: &bytes[header_len..],
        })
    }

    /// The network layer view of the segment, for queueing.
    pub(crate) fn inbound(&self) -> Inbound<'a> {
        Inbound {
            src: self.tuple.remote,
            dst: self.tuple.local,
            hop_limit: self.hop_limit,
            traffic_class: self.traffic_class,
            flow_label: self.flow_label,
            iface: self.iface,
            segment: self.bytes,
        }
    }
}

/// Validate a segment and run it through the state machine.
pub(crate) fn receive(ns: &Namespace, packet: &Inbound, family: Family, now: Instant) -> Disposition {
    ns.stats.inc(Counter::InSegments);
    if !family.is_unicast(&packet.src) || !family.is_unicast(&packet.dst) {
        ns.stats.inc(Counter::AddressRejected);
        return Disposition::Dropped(DropReason::AddressRejected);
    }
    if family == Family::Inet6 && (packet.src.is_ipv4_mapped() || packet.dst.is_ipv4_mapped()) {
        ns.stats.inc(Counter::MappedOnInet6);
        return Disposition::Dropped(DropReason::MappedOnInet6);
    }

    let pseudo = family.pseudo_header(packet.src, packet.dst, packet.segment.len());
    if ns.providers.hasher.checksum(&pseudo, packet.segment) != 0 {
        ns.stats.inc(Counter::ChecksumErrors);
        return Disposition::Dropped(DropReason::Checksum);
    }

    let seg = match Segment::parse(packet, family) {
        Ok(seg) => seg,
        Err(reason) => {
            ns.stats.inc(Counter::Malformed);
            return Disposition::Dropped(reason);
        },
    };
    net_trace!("tcp {}: recv {}", seg.tuple, seg.repr);
    dispatch(ns, &seg, now, None)
}

/// Find the record of a segment and process it there.
///
/// `stale` is a socket whose record turned out to be outdated and must not be chosen again.
fn dispatch(
    ns: &Namespace,
    seg: &Segment,
    now: Instant,
    stale: Option<&Arc<Socket>>,
) -> Disposition {
    match ns.registry.lookup_established(&seg.tuple, seg.iface) {
        Some(Lookup::Connection(socket)) => match stale {
            Some(stale) if Arc::ptr_eq(stale, &socket) => responder::reset_unknown(ns, seg),
            _ => deliver(ns, &socket, seg, now, stale.is_none()),
        },
        Some(Lookup::Request(listener)) => handshake::request(ns, &listener, seg, now),
        Some(Lookup::TimeWait(entry)) => timewait::process(ns, &entry, seg, now),
        None => match ns.registry.lookup_listener(&seg.tuple.local, seg.tuple.local_port, seg.iface) {
            Some(listener) => handshake::listen(ns, &listener, seg, now, None),
            None => responder::reset_unknown(ns, seg),
        },
    }
}

/// Check the signature of a segment against the keys of its record.
pub(crate) fn authenticate(ns: &Namespace, keys: Option<&KeyTable>, seg: &Segment, now: Instant)
    -> Result<(), DropReason>
{
    let result = auth::inbound(
        &*ns.providers.hasher, keys, &seg.tuple.remote, seg.iface, &seg.pseudo, seg.bytes);
    verdict(ns, result, seg, now)
}

/// Count and log the outcome of an authentication check.
pub(crate) fn verdict(
    ns: &Namespace,
    result: Result<(), AuthFailure>,
    seg: &Segment,
    now: Instant,
) -> Result<(), DropReason> {
    let failure = match result {
        Ok(()) => return Ok(()),
        Err(failure) => failure,
    };
    ns.stats.inc(match failure {
        AuthFailure::NotFound => Counter::AuthNotFound,
        AuthFailure::Unexpected => Counter::AuthUnexpected,
        AuthFailure::Mismatch => Counter::AuthFailure,
    });
    if failure == AuthFailure::Mismatch && ns.auth_log.allow(now) {
        net_info!("tcp {}: signature mismatch", seg.tuple);
    }
    Err(DropReason::Auth(failure))
}

fn deliver(ns: &Namespace, socket: &Arc<Socket>, seg: &Segment, now: Instant, retry: bool)
    -> Disposition
{
    if seg.hop_limit < socket.min_hopcount() {
        ns.stats.inc(Counter::MinHopcountDrops);
        return Disposition::Dropped(DropReason::MinHopcount);
    }
    if let Err(reason) = authenticate(ns, Some(socket.keys()), seg, now) {
        return Disposition::Dropped(reason);
    }
    process_on(ns, socket, seg, now, retry)
}

/// Process an accepted segment on a socket, or queue it if the socket is owned.
pub(crate) fn process_on(
    ns: &Namespace,
    socket: &Arc<Socket>,
    seg: &Segment,
    now: Instant,
    retry: bool,
) -> Disposition {
    let mut control = socket.control.lock();
    if control.owned {
        if control.backlog.len() >= ns.config.backlog_limit {
            ns.stats.inc(Counter::BacklogDrops);
            return Disposition::Dropped(DropReason::BacklogFull);
        }
        control.backlog.push_back(QueuedSegment::new(&seg.inbound(), seg.family));
        ns.stats.inc(Counter::BacklogQueued);
        return Disposition::Queued;
    }

    let mut conn = socket.conn.lock();
    match conn.state {
        State::Closed | State::TimeWait => {
            drop(conn);
            drop(control);
            if retry {
                dispatch(ns, seg, now, Some(socket))
            } else {
                responder::reset_unknown(ns, seg)
            }
        },
        _ => Machine::new(ns, socket, now).process(&mut conn, seg),
    }
}

/// Process the backlog and deferred work of a socket, then clear its owner flag.
pub(crate) fn release(ns: &Namespace, socket: &Arc<Socket>, now: Instant) {
    loop {
        let mut control = socket.control.lock();
        if let Some(queued) = control.backlog.pop_front() {
            drop(control);
            replay(ns, socket, &queued, now);
        } else if let Some(deferred) = control.deferred.take() {
            drop(control);
            let mut conn = socket.conn.lock();
            Machine::new(ns, socket, now).apply_deferred(&mut conn, deferred);
        } else {
            control.owned = false;
            return;
        }
    }
}

fn replay(ns: &Namespace, socket: &Arc<Socket>, queued: &QueuedSegment, now: Instant) -> Disposition {
    let packet = queued.inbound();
    let seg = match Segment::parse(&packet, queued.family) {
        Ok(seg) => seg,
        Err(reason) => return Disposition::Dropped(reason),
    };
    let mut conn = socket.conn.lock();
    match conn.state {
        State::Closed | State::TimeWait => {
            drop(conn);
            dispatch(ns, &seg, now, Some(socket))
        },
        _ => Machine::new(ns, socket, now).process(&mut conn, &seg),
    }
}

impl<'a> Machine<'a> {
    /// Run a segment through the state machine of a connection.
    pub(crate) fn process(&self, conn: &mut Connection, seg: &Segment) -> Disposition {
        match conn.state {
            State::Closed | State::Listen | State::TimeWait =>
                Disposition::Dropped(DropReason::NoSocket),
            State::SynSent => self.syn_sent(conn, seg),
            _ => match self.fast_path(conn, seg) {
                Some(disposition) => disposition,
                None => self.synchronized(conn, seg),
            },
        }
    }

    /// In-order data or a pure acknowledgment that changes nothing but the sequence variables.
    fn fast_path(&self, conn: &mut Connection, seg: &Segment) -> Option<Disposition> {
        let repr = &seg.repr;
        let flags = repr.flags;
        if conn.state != State::Established
            || flags.syn() || flags.rst() || flags.fin() || flags.urg()
        {
            return None;
        }
        let ack = repr.ack_number?;
        if repr.seq_number != conn.recv.nxt
            || !ack.is_between(conn.send.una, conn.send.nxt)
            || u32::from(repr.window_len) << conn.send.scale != conn.send.window
            || seg.payload.len() > conn.recv.window as usize
        {
            return None;
        }
        if let Some(ours) = conn.timestamps {
            match repr.timestamp {
                Some(theirs) if theirs.tsval.wrapping_sub(ours.recent) as i32 >= 0 => (),
                _ => return None,
            }
        }

        self.received(conn, seg);
        self.acknowledge(conn, ack);
        if !seg.payload.is_empty() {
            let seq = conn.recv.nxt;
            self.deliver_data(conn, seq, seg.payload);
            self.send_ack(conn);
        }
        Some(Disposition::Accepted)
    }

    fn synchronized(&self, conn: &mut Connection, seg: &Segment) -> Disposition {
        let repr = &seg.repr;
        let flags = repr.flags;
        let seq = repr.seq_number;

        // A retransmitted SYN of a simultaneous open.
        if conn.state == State::SynReceived && flags.syn() && repr.ack_number.is_none()
            && seq == conn.recv.irs
        {
            self.send_syn(conn);
            return Disposition::Answered;
        }

        if let (Some(ours), Some(theirs)) = (conn.timestamps, repr.timestamp) {
            if !flags.rst() && (theirs.tsval.wrapping_sub(ours.recent) as i32) < 0 {
                self.ns.stats.inc(Counter::PawsRejected);
                self.send_ack(conn);
                return Disposition::Answered;
            }
        }

        if !acceptable(conn, seg) {
            self.ns.stats.inc(Counter::OutOfWindow);
            if flags.rst() {
                return Disposition::Dropped(DropReason::OutOfWindow);
            }
            self.send_ack(conn);
            return Disposition::Answered;
        }

        if flags.rst() {
            if seq == conn.recv.nxt {
                self.reset_received(conn);
                return Disposition::Accepted;
            }
            self.ns.stats.inc(Counter::ChallengeAcks);
            self.send_ack(conn);
            return Disposition::Answered;
        }

        if flags.syn() {
            self.ns.stats.inc(Counter::ChallengeAcks);
            self.send_ack(conn);
            return Disposition::Answered;
        }

        let ack = match repr.ack_number {
            Some(ack) => ack,
            None => return Disposition::Dropped(DropReason::UnexpectedFlags),
        };

        if conn.state == State::SynReceived {
            if ack.diff(conn.send.una) > 0 && ack.diff(conn.send.nxt) <= 0 {
                self.set_state(conn, State::Established);
                self.update_window(conn, seq, ack, repr.window_len);
                self.arm_keepalive(conn);
            } else {
                let key = self.key(conn);
                return responder::reset(self.ns, seg, key.as_deref());
            }
        }

        if ack.diff(conn.send.nxt) > 0 {
            self.ns.stats.inc(Counter::AckOfUnsent);
            self.send_ack(conn);
            return Disposition::Answered;
        }

        self.received(conn, seg);
        self.acknowledge(conn, ack);
        if conn.send.wl1.diff(seq) < 0 || (conn.send.wl1 == seq && conn.send.wl2.diff(ack) <= 0) {
            self.update_window(conn, seq, ack, repr.window_len);
        }

        let fin_acked = conn.state.fin_sent() && conn.send.una == conn.send.nxt;
        match conn.state {
            State::FinWait1 if fin_acked => {
                self.set_state(conn, State::FinWait2);
                if conn.orphan {
                    let at = self.now + self.ns.config.fin_timeout;
                    self.arm(conn, TimerKind::FinWait2, at);
                }
            },
            State::Closing if fin_acked => {
                self.enter_time_wait(conn);
                return Disposition::Accepted;
            },
            State::LastAck if fin_acked => {
                self.close(conn);
                return Disposition::Accepted;
            },
            _ => (),
        }

        let mut need_ack = false;
        let mut fin = flags.fin();
        if !seg.payload.is_empty() {
            let have = conn.recv.nxt.diff(seq);
            if !conn.state.receives() {
                // Data after the peer's FIN.
                fin = false;
            } else if have < 0 {
                // Out of order, only in-order data is handed on.
                fin = false;
                need_ack = true;
            } else {
                let have = have as usize;
                if have < seg.payload.len() {
                    let fresh = &seg.payload[have..];
                    let fresh = &fresh[..fresh.len().min(conn.recv.window as usize)];
                    let next = conn.recv.nxt;
                    let accepted = self.deliver_data(conn, next, fresh);
                    if have + accepted < seg.payload.len() {
                        fin = false;
                    }
                }
                need_ack = true;
            }
        }

        if fin {
            let fin_seq = seq + seg.payload.len();
            if fin_seq == conn.recv.nxt {
                conn.recv.nxt += 1;
                need_ack = true;
                match conn.state {
                    State::SynReceived | State::Established => self.set_state(conn, State::CloseWait),
                    State::FinWait1 => self.set_state(conn, State::Closing),
                    State::FinWait2 => {
                        self.send_ack(conn);
                        self.enter_time_wait(conn);
                        return Disposition::Accepted;
                    },
                    _ => (),
                }
            } else if fin_seq.diff(conn.recv.nxt) < 0 {
                // A retransmitted FIN.
                need_ack = true;
            }
        }

        if need_ack {
            self.send_ack(conn);
        }
        Disposition::Accepted
    }

    fn reset_received(&self, conn: &mut Connection) {
        net_debug!("tcp {}: reset by peer in {}", conn.tuple, conn.state);
        self.ns.stats.inc(Counter::ResetsReceived);
        let error = match conn.state {
            State::SynReceived => SocketError::Refused,
            State::Established | State::CloseWait => {
                self.ns.stats.inc(Counter::EstablishedResets);
                SocketError::Reset
            },
            _ => SocketError::Reset,
        };
        self.fail(conn, error);
    }

    /// Note a segment that passed all checks.
    pub(crate) fn received(&self, conn: &mut Connection, seg: &Segment) {
        conn.last_received = self.now;
        conn.probes = 0;
        let rcv_nxt = conn.recv.nxt;
        if let (Some(ours), Some(theirs)) = (conn.timestamps.as_mut(), seg.repr.timestamp) {
            if theirs.tsval.wrapping_sub(ours.recent) as i32 >= 0
                && seg.repr.seq_number.diff(rcv_nxt) <= 0
            {
                ours.recent = theirs.tsval;
            }
        }
    }

    /// Advance the unacknowledged sequence number.
    pub(crate) fn acknowledge(&self, conn: &mut Connection, ack: TcpSeqNumber) {
        if ack.diff(conn.send.una) <= 0 {
            return;
        }
        conn.send.una = ack;
        conn.retries = 0;
        conn.backoff = 0;
        self.ns.providers.engine.acknowledged(self.id(), ack);
        if conn.send.una == conn.send.nxt {
            self.disarm(conn, TimerKind::Retransmit);
        } else {
            self.arm_retransmit(conn);
        }
    }

    pub(crate) fn update_window(
        &self,
        conn: &mut Connection,
        seq: TcpSeqNumber,
        ack: TcpSeqNumber,
        window: u16,
    ) {
        conn.send.window = u32::from(window) << conn.send.scale;
        conn.send.wl1 = seq;
        conn.send.wl2 = ack;
        if conn.send.window > 0 {
            self.disarm(conn, TimerKind::ZeroWindowProbe);
        }
    }

    /// Hand in-order data to the engine. Returns the octets it accepted.
    pub(crate) fn deliver_data(&self, conn: &mut Connection, seq: TcpSeqNumber, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let accepted = self.ns.providers.engine.receive(self.id(), seq, data).min(data.len());
        conn.recv.nxt += accepted;
        accepted
    }
}

/// The RFC 793 acceptability test of a segment's sequence space.
fn acceptable(conn: &Connection, seg: &Segment) -> bool {
    let len = seg.repr.sequence_len();
    let window = conn.recv.window as usize;
    let seq = seg.repr.seq_number;
    let nxt = conn.recv.nxt;
    match (len, window) {
        (0, 0) => seq == nxt,
        (0, _) => seq.is_between(nxt, nxt + (window - 1)),
        (_, 0) => false,
        (_, _) => seq.is_between(nxt, nxt + (window - 1))
            || (seq + (len - 1)).is_between(nxt, nxt + (window - 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(DropReason::Checksum.class(), ErrorClass::MalformedSegment);
        assert_eq!(DropReason::Auth(AuthFailure::Mismatch).class(), ErrorClass::SpoofedOrUnexpected);
        assert_eq!(DropReason::UnexpectedFlags.class(), ErrorClass::ProtocolViolation);
        assert_eq!(DropReason::BacklogFull.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(DropReason::NoRoute.class(), ErrorClass::NetworkError);
        assert_eq!(format!("{}", DropReason::Paws), "old timestamp");
    }
}
