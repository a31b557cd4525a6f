//! Connection establishment.
//!
//! Passive opens go through a listener. A SYN creates a request, or when the request table is
//! full (and cookies are enabled) a stateless SYN-ACK whose sequence number is a cookie. The ACK
//! completing the handshake promotes the request, or the decoded cookie, to a full connection that
//! is queued for accept. Active opens validate the destination, resolve a route, publish the
//! connection on an ephemeral port and send the SYN.
use alloc::sync::Arc;

use spin::MutexGuard;

use crate::layer::{Error, Result, SocketError};
use crate::time::Instant;
use crate::wire::{Ipv6Address, TcpFlags, TcpRepr, TcpSeqNumber};

use super::auth;
use super::config::SynCookies as CookiePolicy;
use super::connection::{Connection, Machine, Socket, State, Timestamps, DEFAULT_MSS};
use super::cookie::{CookieOptions, SynCookies};
use super::dispatch::{self, Disposition, DropReason, Segment};
use super::listener::{ListenState, Listener};
use super::mapped::{Family, MAPPED_LOOPBACK};
use super::namespace::Namespace;
use super::provider::{Admit, Route, RouteQuery};
use super::registry::{FourTuple, Record};
use super::request::RequestSocket;
use super::responder::{self, ControlSegmentTemplate, Path};
use super::stats::Counter;
use super::timer::{Target, TimerKind};

/// A segment for a listener without a matching record.
///
/// A time-wait record handing over to a new incarnation passes the initial sequence number.
pub(crate) fn listen(
    ns: &Namespace,
    listener: &Arc<Listener>,
    seg: &Segment,
    now: Instant,
    iss: Option<TcpSeqNumber>,
) -> Disposition {
    if seg.hop_limit < listener.min_hopcount() {
        ns.stats.inc(Counter::MinHopcountDrops);
        return Disposition::Dropped(DropReason::MinHopcount);
    }
    if let Err(reason) = dispatch::authenticate(ns, Some(listener.keys()), seg, now) {
        return Disposition::Dropped(reason);
    }

    let flags = seg.repr.flags;
    if flags.rst() {
        return Disposition::Dropped(DropReason::UnexpectedFlags);
    }
    if seg.repr.ack_number.is_some() {
        return cookie_ack(ns, listener, seg, now);
    }
    if !flags.syn() || flags.fin() {
        return Disposition::Dropped(DropReason::UnexpectedFlags);
    }
    syn(ns, listener, seg, now, iss)
}

fn syn(
    ns: &Namespace,
    listener: &Arc<Listener>,
    seg: &Segment,
    now: Instant,
    iss: Option<TcpSeqNumber>,
) -> Disposition {
    if !ns.providers.admission.admit(&seg.tuple, Admit::Syn) {
        ns.stats.inc(Counter::AdmissionDenied);
        return Disposition::Dropped(DropReason::AdmissionDenied);
    }
    let config = &ns.config;
    let mut state = listener.state.lock();
    if !state.open {
        return Disposition::Dropped(DropReason::NoSocket);
    }
    if state.accept_full(listener.backlog()) {
        ns.stats.inc(Counter::ListenOverflows);
        ns.stats.inc(Counter::ListenDrops);
        return Disposition::Dropped(DropReason::ListenOverflow);
    }

    let table_full = state.requests.len() >= config.max_syn_backlog;
    let cookie = match config.syncookies {
        CookiePolicy::Always => true,
        CookiePolicy::OnOverflow => table_full,
        CookiePolicy::Disabled => false,
    };
    if table_full && !cookie {
        ns.stats.inc(Counter::ListenDrops);
        return Disposition::Dropped(DropReason::RequestTableFull);
    }

    let route = match route(ns, &seg.tuple, seg.family, listener.iface()) {
        Ok(route) => route,
        Err(_) => return Disposition::Dropped(DropReason::NoRoute),
    };
    let key = listener.keys().lookup(&seg.tuple.remote, seg.iface);

    if cookie {
        state.last_overflow = Some(now);
        drop(state);
        send_cookie(ns, listener, seg, &route, key.as_deref(), now);
        return Disposition::Answered;
    }

    let iss = iss.unwrap_or_else(|| ns.initial_sequence(&seg.tuple, now));
    let mut request = RequestSocket::from_syn(config, &ns.isn, listener, seg, iss, route);
    let record = Record::Request(Arc::downgrade(listener));
    if ns.registry.insert(seg.tuple, record, listener.iface()).is_err() {
        return Disposition::Dropped(DropReason::NoSocket);
    }
    let target = Target::Request(Arc::downgrade(listener), seg.tuple);
    request.timer = Some(ns.timers.arm(request.deadline(config, now), target, TimerKind::SynAck));

    let path = request.path();
    let synack = request.synack(now);
    state.requests.insert(seg.tuple, request);
    drop(state);

    net_debug!("tcp {}: SYN on listener {:?}", seg.tuple, listener.id());
    responder::output(ns, &path, synack, &[], key.as_deref());
    Disposition::Accepted
}

fn send_cookie(
    ns: &Namespace,
    listener: &Listener,
    seg: &Segment,
    route: &Route,
    key: Option<&auth::AuthKey>,
    now: Instant,
) {
    let repr = &seg.repr;
    let options = CookieOptions {
        mss: repr.max_seg_size.unwrap_or(DEFAULT_MSS),
        wscale: repr.window_scale,
    };
    let iss = ns.cookies.encode(&seg.tuple, repr.seq_number, options, now);
    ns.stats.inc(Counter::CookiesSent);

    let window = if repr.window_scale.is_some() {
        ns.config.receive_window
    } else {
        ns.config.receive_window.min(u32::from(u16::MAX))
    };
    let synack = TcpRepr {
        flags: TcpFlags::SYN,
        seq_number: iss,
        ack_number: Some(repr.seq_number + 1),
        window_len: window.min(u32::from(u16::MAX)) as u16,
        max_seg_size: Some(seg.family.mss_for_mtu(route.mtu())),
        window_scale: repr.window_scale.map(|_| ns.config.window_scale),
        .. TcpRepr::default()
    };
    let path = Path {
        tuple: seg.tuple,
        next_hop: route.next_hop,
        family: seg.family,
        iface: seg.iface.or(route.iface),
        hop_limit: ns.config.hop_limit,
        meta: listener.meta(),
    };
    responder::output(ns, &path, synack, &[], key);
}

/// An ACK on a listener, possibly completing a cookie handshake.
fn cookie_ack(ns: &Namespace, listener: &Arc<Listener>, seg: &Segment, now: Instant) -> Disposition {
    let repr = &seg.repr;
    let checking = match ns.config.syncookies {
        CookiePolicy::Always => true,
        CookiePolicy::Disabled => false,
        CookiePolicy::OnOverflow => listener.state.lock().last_overflow
            .map(|at| now.saturating_since(at) < SynCookies::validity())
            .unwrap_or(false),
    };
    let key = listener.keys().lookup(&seg.tuple.remote, seg.iface);
    let ack = match repr.ack_number {
        Some(ack) if checking && !repr.flags.syn() => ack,
        _ => return responder::reset(ns, seg, key.as_deref()),
    };

    let iss = ack - 1;
    let options = match ns.cookies.decode(&seg.tuple, repr.seq_number - 1, iss, now) {
        Some(options) => options,
        None => {
            ns.stats.inc(Counter::CookiesFailed);
            return Disposition::Dropped(DropReason::CookieFailed);
        },
    };
    ns.stats.inc(Counter::CookiesReceived);

    let route = match route(ns, &seg.tuple, seg.family, listener.iface()) {
        Ok(route) => route,
        Err(_) => return Disposition::Dropped(DropReason::NoRoute),
    };
    let request = RequestSocket::from_cookie(&ns.config, listener, seg, iss, options, route);
    let state = listener.state.lock();
    if !state.open {
        return Disposition::Dropped(DropReason::NoSocket);
    }
    if state.accept_full(listener.backlog()) {
        ns.stats.inc(Counter::ListenOverflows);
        ns.stats.inc(Counter::ListenDrops);
        return Disposition::Dropped(DropReason::ListenOverflow);
    }
    promote(ns, listener, state, request, false, seg, now)
}

/// A segment for a half-open request.
pub(crate) fn request(ns: &Namespace, listener: &Arc<Listener>, seg: &Segment, now: Instant)
    -> Disposition
{
    if seg.hop_limit < listener.min_hopcount() {
        ns.stats.inc(Counter::MinHopcountDrops);
        return Disposition::Dropped(DropReason::MinHopcount);
    }
    let key = listener.keys().lookup(&seg.tuple.remote, seg.iface);
    let verdict = auth::check(&*ns.providers.hasher, key.as_deref(), &seg.pseudo, seg.bytes);
    if let Err(reason) = dispatch::verdict(ns, verdict, seg, now) {
        return Disposition::Dropped(reason);
    }

    let repr = &seg.repr;
    let flags = repr.flags;
    let mut state = listener.state.lock();
    let (iss, irs, timestamps, in_window) = match state.requests.get(&seg.tuple) {
        Some(request) => (
            request.iss,
            request.irs,
            request.timestamps,
            request.in_window(repr.seq_number, repr.sequence_len()),
        ),
        None => {
            // The record outlived its request.
            drop(state);
            ns.registry.remove(&seg.tuple, &Record::Request(Arc::downgrade(listener)));
            return listen(ns, listener, seg, now, None);
        },
    };

    if flags.syn() && !flags.ack() && repr.seq_number == irs {
        return resend_synack(ns, state, seg, key.as_deref(), now);
    }

    if let (Some(ours), Some(theirs)) = (timestamps, repr.timestamp) {
        if !flags.rst() && (theirs.tsval.wrapping_sub(ours.recent) as i32) < 0 {
            ns.stats.inc(Counter::PawsRejected);
            return Disposition::Dropped(DropReason::Paws);
        }
    }

    if flags.rst() {
        if repr.seq_number != irs + 1 {
            ns.stats.inc(Counter::OutOfWindow);
            return Disposition::Dropped(DropReason::OutOfWindow);
        }
        ns.stats.inc(Counter::ResetsReceived);
        destroy(ns, listener, &mut state, &seg.tuple);
        return Disposition::Accepted;
    }

    if !in_window || flags.syn() {
        if flags.syn() {
            ns.stats.inc(Counter::ChallengeAcks);
        } else {
            ns.stats.inc(Counter::OutOfWindow);
        }
        let path = match state.requests.get(&seg.tuple) {
            Some(request) => request.path(),
            None => return Disposition::Dropped(DropReason::NoSocket),
        };
        drop(state);
        let mut ack = ControlSegmentTemplate::ack(path, iss + 1, irs + 1, 0);
        ack.key = key.as_deref();
        ack.send(ns);
        return Disposition::Answered;
    }

    match repr.ack_number {
        None => return Disposition::Dropped(DropReason::UnexpectedFlags),
        Some(ack) if ack != iss + 1 => {
            drop(state);
            return responder::reset(ns, seg, key.as_deref());
        },
        Some(_) => (),
    }

    if state.accept_full(listener.backlog()) {
        ns.stats.inc(Counter::ListenOverflows);
        ns.stats.inc(Counter::ListenDrops);
        return Disposition::Dropped(DropReason::ListenOverflow);
    }

    let mut request = match state.requests.remove(&seg.tuple) {
        Some(request) => request,
        None => return Disposition::Dropped(DropReason::NoSocket),
    };
    if let Some(handle) = request.timer.take() {
        ns.timers.disarm(handle);
    }
    promote(ns, listener, state, request, true, seg, now)
}

fn resend_synack(
    ns: &Namespace,
    mut state: MutexGuard<ListenState>,
    seg: &Segment,
    key: Option<&auth::AuthKey>,
    now: Instant,
) -> Disposition {
    let (path, synack) = match state.requests.get_mut(&seg.tuple) {
        Some(request) => {
            refresh(ns, &mut request.route, &request.tuple, request.family, request.iface);
            (request.path(), request.synack(now))
        },
        None => return Disposition::Dropped(DropReason::NoSocket),
    };
    drop(state);
    responder::output(ns, &path, synack, &[], key);
    Disposition::Answered
}

/// Turn a request into a connection queued for accept, then process `seg` on it.
fn promote(
    ns: &Namespace,
    listener: &Arc<Listener>,
    mut state: MutexGuard<ListenState>,
    request: RequestSocket,
    published: bool,
    seg: &Segment,
    now: Instant,
) -> Disposition {
    let conn = request.connection(listener, &ns.config, now);
    let socket = Arc::new(Socket::with_connection(
        ns.next_id(),
        listener.keys().clone(),
        listener.min_hopcount(),
        conn,
        ns.released.clone()));
    let record = Record::Connection(Arc::downgrade(&socket));
    let ok = if published {
        ns.registry.replace(&request.tuple, &Record::Request(Arc::downgrade(listener)), record)
    } else {
        ns.registry.insert(request.tuple, record, request.iface).is_ok()
    };
    if !ok {
        return Disposition::Dropped(DropReason::NoSocket);
    }
    socket.conn.lock().registered = true;
    state.accept.push_back(socket.clone());
    drop(state);

    net_debug!("tcp {}: passive open on listener {:?}", request.tuple, listener.id());
    ns.stats.inc(Counter::PassiveOpens);
    dispatch::process_on(ns, &socket, seg, now, false)
}

/// Forget a request, its timer and its record.
pub(crate) fn destroy(ns: &Namespace, listener: &Arc<Listener>, state: &mut ListenState, tuple: &FourTuple)
    -> bool
{
    match state.requests.remove(tuple) {
        Some(request) => {
            if let Some(handle) = request.timer {
                ns.timers.disarm(handle);
            }
            ns.registry.remove(tuple, &Record::Request(Arc::downgrade(listener)));
            true
        },
        None => false,
    }
}

/// The SYN-ACK timer of a request fired.
pub(crate) fn request_timeout(ns: &Namespace, listener: &Arc<Listener>, tuple: FourTuple, now: Instant) {
    let mut state = listener.state.lock();
    let retransmits = match state.requests.get_mut(&tuple) {
        Some(request) => {
            request.timer = None;
            request.retransmits
        },
        None => return,
    };
    if retransmits >= ns.config.synack_retries {
        net_debug!("tcp {}: handshake timed out", tuple);
        ns.stats.inc(Counter::RequestTimeouts);
        destroy(ns, listener, &mut state, &tuple);
        return;
    }

    let target = Target::Request(Arc::downgrade(listener), tuple);
    let (path, synack) = match state.requests.get_mut(&tuple) {
        Some(request) => {
            request.retransmits += 1;
            let at = request.deadline(&ns.config, now);
            request.timer = Some(ns.timers.arm(at, target, TimerKind::SynAck));
            refresh(ns, &mut request.route, &tuple, request.family, request.iface);
            (request.path(), request.synack(now))
        },
        None => return,
    };
    drop(state);

    ns.stats.inc(Counter::SynAckRetransmits);
    let key = listener.keys().lookup(&tuple.remote, path.iface);
    responder::output(ns, &path, synack, &[], key.as_deref());
}

fn route(ns: &Namespace, tuple: &FourTuple, family: Family, iface: Option<u32>) -> Result<Arc<Route>> {
    ns.providers.routing.resolve(&RouteQuery {
        destination: tuple.remote,
        source: Some(tuple.local),
        iface,
        family,
    })
}

/// Resolve `route` again once the routing side marked it stale.
///
/// A failed lookup keeps the stale route, the next use tries again.
pub(crate) fn refresh(
    ns: &Namespace,
    route: &mut Arc<Route>,
    tuple: &FourTuple,
    family: Family,
    iface: Option<u32>,
) {
    if route.is_valid() {
        return;
    }
    match self::route(ns, tuple, family, iface) {
        Ok(fresh) => {
            net_debug!("tcp {}: route resolved again, next hop {}", tuple, fresh.next_hop);
            ns.stats.inc(Counter::RouteRefreshes);
            *route = fresh;
        },
        Err(err) => net_debug!("tcp {}: keeping stale route: {}", tuple, err),
    }
}

/// Start an active open.
pub(crate) fn connect(
    ns: &Namespace,
    socket: &Arc<Socket>,
    remote: Ipv6Address,
    port: u16,
    now: Instant,
) -> Result<()> {
    let mut conn = socket.conn.lock();
    if conn.state != State::Closed || conn.registered {
        return Err(Error::Illegal);
    }
    if port == 0 {
        return Err(Error::InvalidAddress);
    }

    let local = conn.tuple.local;
    let remote = if remote.is_unspecified() {
        if local.is_ipv4_mapped() { MAPPED_LOOPBACK } else { Ipv6Address::LOOPBACK }
    } else {
        remote
    };
    let family = Family::of(&remote);
    if !family.is_unicast(&remote) {
        return Err(Error::Unreachable);
    }
    match family {
        Family::Mapped if conn.v6only => return Err(Error::Unreachable),
        Family::Mapped if !local.is_unspecified() && !local.is_ipv4_mapped() =>
            return Err(Error::Unreachable),
        Family::Inet6 if local.is_ipv4_mapped() => return Err(Error::InvalidAddress),
        _ => (),
    }
    if remote.is_link_local() && conn.iface.is_none() {
        return Err(Error::InvalidAddress);
    }

    conn.family = family;
    let machine = Machine::new(ns, socket, now);
    let result = open(&machine, &mut conn, remote, port);
    if result.is_err() {
        conn.family = Family::Inet6;
        conn.route = None;
    }
    result
}

fn open(machine: &Machine, conn: &mut Connection, remote: Ipv6Address, port: u16) -> Result<()> {
    let ns = machine.ns;
    let config = &ns.config;
    let local = conn.tuple.local;
    let route = ns.providers.routing.resolve(&RouteQuery {
        destination: remote,
        source: if local.is_unspecified() { None } else { Some(local) },
        iface: conn.iface,
        family: conn.family,
    })?;

    let tuple = FourTuple {
        local: if local.is_unspecified() { route.source } else { local },
        remote,
        local_port: conn.tuple.local_port,
        remote_port: port,
    };
    if !ns.providers.admission.admit(&tuple, Admit::Connect) {
        ns.stats.inc(Counter::AdmissionDenied);
        return Err(Error::Socket(SocketError::PermissionDenied));
    }
    let record = machine.record();
    let tuple = if tuple.local_port == 0 {
        let offset = ns.isn.ts_offset(&tuple.local, &tuple.remote).wrapping_add(u32::from(port));
        ns.registry.insert_ephemeral(tuple, &config.ephemeral_ports, offset, &record, conn.iface)?
    } else {
        ns.registry.insert(tuple, record, conn.iface)?;
        tuple
    };
    conn.registered = true;
    conn.tuple = tuple;

    let iss = ns.initial_sequence(&tuple, machine.now);
    conn.send.iss = iss;
    conn.send.una = iss;
    conn.send.nxt = iss + 1;
    conn.send.window = 0;
    conn.send.scale = 0;
    conn.recv.window = config.receive_window.min(u32::from(u16::MAX) << config.window_scale);
    conn.recv.scale = config.window_scale;
    conn.scaling = true;
    let advertised = conn.family.mss_for_mtu(route.mtu());
    conn.mss.advertised = advertised;
    conn.mss.effective = advertised;
    conn.timestamps = if config.timestamps {
        Some(Timestamps { offset: ns.isn.ts_offset(&tuple.local, &tuple.remote), recent: 0 })
    } else {
        None
    };
    conn.sack = config.sack;
    conn.route = Some(route);
    conn.rto = config.rto_initial;
    conn.backoff = 0;
    conn.retries = 0;
    conn.error = None;
    conn.soft_error = None;

    net_debug!("tcp {}: active open", tuple);
    ns.stats.inc(Counter::ActiveOpens);
    machine.set_state(conn, State::SynSent);
    machine.send_syn(conn);
    machine.arm_retransmit(conn);
    Ok(())
}

impl<'a> Machine<'a> {
    /// A segment answering our SYN.
    pub(crate) fn syn_sent(&self, conn: &mut Connection, seg: &Segment) -> Disposition {
        let repr = &seg.repr;
        let flags = repr.flags;
        if let Some(ack) = repr.ack_number {
            if ack.diff(conn.send.iss) <= 0 || ack.diff(conn.send.nxt) > 0 {
                if flags.rst() {
                    return Disposition::Dropped(DropReason::AckUnacceptable);
                }
                let key = self.key(conn);
                return responder::reset(self.ns, seg, key.as_deref());
            }
        }
        if flags.rst() {
            if repr.ack_number.is_none() {
                return Disposition::Dropped(DropReason::UnexpectedFlags);
            }
            net_debug!("tcp {}: connection refused", conn.tuple);
            self.ns.stats.inc(Counter::ResetsReceived);
            self.ns.stats.inc(Counter::AttemptFails);
            self.fail(conn, SocketError::Refused);
            return Disposition::Accepted;
        }
        if !flags.syn() {
            return Disposition::Dropped(DropReason::UnexpectedFlags);
        }

        let seq = repr.seq_number;
        conn.recv.irs = seq;
        conn.recv.nxt = seq + 1;
        conn.peer_syn_options(repr);
        conn.send.window = u32::from(repr.window_len);
        conn.send.wl1 = seq;
        conn.last_received = self.now;

        match repr.ack_number {
            Some(ack) => {
                conn.send.wl2 = ack;
                conn.send.una = ack;
                conn.retries = 0;
                conn.backoff = 0;
                self.disarm(conn, TimerKind::Retransmit);
                self.set_state(conn, State::Established);
                self.arm_keepalive(conn);
                self.send_ack(conn);
            },
            None => {
                // Simultaneous open, our SYN is answered with a SYN-ACK of the same sequence.
                conn.send.wl2 = conn.send.iss;
                self.set_state(conn, State::SynReceived);
                self.send_syn(conn);
            },
        }
        Disposition::Accepted
    }
}

#[cfg(test)]
mod tests {
    use crate::time::Duration;
    use super::super::config::Config;
    use super::*;

    #[test]
    fn synack_backoff() {
        let config = Config::default();
        let route = Arc::new(Route::new(Ipv6Address::LOOPBACK, Ipv6Address::LOOPBACK, None, 1500));
        let listener = Listener::new(super::super::connection::SocketId(1), Default::default());
        let tuple = FourTuple {
            local: Ipv6Address::LOOPBACK,
            remote: Ipv6Address::LOOPBACK,
            local_port: 80,
            remote_port: 5000,
        };
        let seg_bytes = [0u8; 0];
        let seg = Segment {
            tuple,
            family: Family::Inet6,
            iface: None,
            hop_limit: 64,
            traffic_class: 0,
            flow_label: 0,
            repr: TcpRepr {
                flags: TcpFlags::SYN,
                seq_number: TcpSeqNumber(100),
                max_seg_size: Some(1220),
                window_scale: Some(2),
                .. TcpRepr::default()
            },
            pseudo: Family::Inet6.pseudo_header(tuple.remote, tuple.local, 0),
            bytes: &seg_bytes,
            payload: &seg_bytes,
        };
        let isn = super::super::siphash::IsnGenerator::from_key(3, 4);
        let mut request = RequestSocket::from_syn(&config, &isn, &listener, &seg, TcpSeqNumber(7), route);
        assert_eq!(request.mss.effective, 1220);
        assert_eq!(request.mss.advertised, 1440);

        let now = Instant::from_secs(10);
        assert_eq!(request.deadline(&config, now), now + Duration::from_secs(1));
        request.retransmits = 3;
        assert_eq!(request.deadline(&config, now), now + Duration::from_secs(8));
        request.retransmits = 30;
        assert_eq!(request.deadline(&config, now), now + config.rto_max);

        let synack = request.synack(now);
        assert_eq!(synack.ack_number, Some(TcpSeqNumber(101)));
        assert_eq!(synack.window_scale, Some(config.window_scale));
        assert!(request.in_window(TcpSeqNumber(101), 0));
        assert!(!request.in_window(TcpSeqNumber(100), 0));
    }
}
