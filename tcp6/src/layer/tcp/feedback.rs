//! Errors reported by the network about our segments.
//!
//! ICMPv6 errors quote the header of the offending segment. From the quote we find the record it
//! belonged to and apply the notification: record a soft error, fail a connection attempt, lower
//! the path MTU or drop a stale route. Notifications are independent of the receive path and may
//! also be injected directly, e.g. by an IPv4 layer translating its own ICMP messages.
use alloc::sync::Arc;

use crate::layer::{Error, Result, SocketError};
use crate::time::Instant;
use crate::wire::{
    IpProtocol, Icmpv6DstUnreachable, Icmpv6ErrorRepr, Icmpv6Message, Icmpv6Packet, Ipv6Address,
    PseudoHeader, TcpSeqNumber};

use super::connection::{Connection, Machine, Socket, State};
use super::dispatch::Inbound;
use super::handshake;
use super::listener::Listener;
use super::namespace::Namespace;
use super::registry::{FourTuple, Lookup};
use super::stats::Counter;

/// The condition reported by an error message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Destination unreachable with its code.
    Unreachable(Icmpv6DstUnreachable),
    /// Packet too big with the MTU of the next link.
    TooBig(u32),
    /// The hop limit was exceeded in transit.
    TimeExceeded,
    /// A header field could not be processed.
    ParamProblem,
    /// A better first hop exists.
    Redirect(Ipv6Address),
}

/// An error message about a segment we sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Notification {
    /// What went wrong.
    pub kind: ErrorKind,
    /// The tuple of the offending segment, from our point of view.
    pub tuple: FourTuple,
    /// The quoted sequence number.
    pub seq: TcpSeqNumber,
    /// The interface the message arrived on.
    pub iface: Option<u32>,
    /// The remaining hop limit of the message.
    pub hop_limit: u8,
}

impl ErrorKind {
    /// The error reported to the owner and whether it is hard.
    ///
    /// A redirect is no error at all.
    pub fn error(self) -> Option<(SocketError, bool)> {
        use Icmpv6DstUnreachable as Code;
        Some(match self {
            ErrorKind::Unreachable(Code::NoRoute) => (SocketError::NetUnreachable, false),
            ErrorKind::Unreachable(Code::AdminProhibit) => (SocketError::PermissionDenied, true),
            ErrorKind::Unreachable(Code::BeyondScope)
            | ErrorKind::Unreachable(Code::AddrUnreachable) => (SocketError::HostUnreachable, false),
            ErrorKind::Unreachable(Code::PortUnreachable) => (SocketError::Refused, true),
            ErrorKind::Unreachable(Code::FailedPolicy)
            | ErrorKind::Unreachable(Code::RejectRoute) => (SocketError::PermissionDenied, true),
            ErrorKind::Unreachable(Code::Unknown(_)) => (SocketError::HostUnreachable, false),
            ErrorKind::TooBig(_) => (SocketError::MessageTooLarge, false),
            ErrorKind::TimeExceeded => (SocketError::HostUnreachable, false),
            ErrorKind::ParamProblem => (SocketError::Protocol, true),
            ErrorKind::Redirect(_) => return None,
        })
    }
}

impl Notification {
    /// Interpret a parsed ICMPv6 error.
    ///
    /// Returns `None` for messages that do not concern TCP.
    pub fn from_icmpv6(repr: &Icmpv6ErrorRepr, iface: Option<u32>, hop_limit: u8) -> Option<Self> {
        let kind = match repr.message {
            Icmpv6Message::DstUnreachable => ErrorKind::Unreachable(repr.code.into()),
            Icmpv6Message::PktTooBig => ErrorKind::TooBig(repr.info),
            Icmpv6Message::TimeExceeded => ErrorKind::TimeExceeded,
            Icmpv6Message::ParamProblem => ErrorKind::ParamProblem,
            Icmpv6Message::Redirect => ErrorKind::Redirect(repr.target?),
            _ => return None,
        };
        let quoted = &repr.quoted;
        Some(Notification {
            kind,
            tuple: FourTuple {
                local: quoted.src_addr,
                remote: quoted.dst_addr,
                local_port: quoted.src_port,
                remote_port: quoted.dst_port,
            },
            seq: quoted.seq_number,
            iface,
            hop_limit,
        })
    }
}

/// Parse an ICMPv6 message and apply it.
pub(crate) fn receive_icmpv6(ns: &Namespace, packet: &Inbound, now: Instant) -> Result<()> {
    let pseudo = PseudoHeader::v6(
        packet.src, packet.dst, IpProtocol::Icmpv6, packet.segment.len() as u32);
    let message = Icmpv6Packet::new_checked(packet.segment)?;
    let repr = match Icmpv6ErrorRepr::parse(&message, &pseudo) {
        Ok(repr) => repr,
        Err(err) => {
            net_trace!("icmpv6 from {}: {}", packet.src, err);
            ns.stats.inc(Counter::IcmpUnknown);
            return Err(err.into());
        },
    };
    match Notification::from_icmpv6(&repr, packet.iface, packet.hop_limit) {
        Some(note) => notify(ns, &note, now),
        None => Err(Error::NotFound),
    }
}

/// Apply a notification to the record of its tuple.
pub(crate) fn notify(ns: &Namespace, note: &Notification, now: Instant) -> Result<()> {
    match ns.registry.lookup_established(&note.tuple, note.iface) {
        Some(Lookup::Connection(socket)) => connection(ns, &socket, note, now),
        Some(Lookup::Request(listener)) => request(ns, &listener, note),
        Some(Lookup::TimeWait(_)) => Ok(()),
        None => {
            ns.stats.inc(Counter::IcmpUnknown);
            Err(Error::NotFound)
        },
    }
}

fn request(ns: &Namespace, listener: &Arc<Listener>, note: &Notification) -> Result<()> {
    if note.hop_limit < listener.min_hopcount() {
        ns.stats.inc(Counter::MinHopcountDrops);
        return Ok(());
    }
    let mut state = listener.state.lock();
    let route = match state.requests.get(&note.tuple) {
        Some(request) if request.iss == note.seq => request.route.clone(),
        Some(_) => {
            ns.stats.inc(Counter::IcmpOutOfWindow);
            return Ok(());
        },
        None => return Err(Error::NotFound),
    };

    match note.kind {
        ErrorKind::Redirect(target) => ns.providers.routing.redirect(&route, target),
        ErrorKind::TooBig(mtu) => ns.providers.routing.update_pmtu(&route, mtu),
        kind => if let Some((error, true)) = kind.error() {
            net_debug!("tcp {}: request failed: {}", note.tuple, error);
            ns.stats.inc(Counter::IcmpHardErrors);
            handshake::destroy(ns, listener, &mut state, &note.tuple);
        },
    }
    Ok(())
}

fn connection(ns: &Namespace, socket: &Arc<Socket>, note: &Notification, now: Instant) -> Result<()> {
    if note.hop_limit < socket.min_hopcount() {
        ns.stats.inc(Counter::MinHopcountDrops);
        return Ok(());
    }
    let mut control = socket.control.lock();
    let mut conn = socket.conn.lock();
    if conn.state == State::Closed || conn.state == State::TimeWait {
        return Err(Error::NotFound);
    }
    if !note.seq.is_between(conn.send.una, conn.send.nxt) {
        ns.stats.inc(Counter::IcmpOutOfWindow);
        return Ok(());
    }

    let machine = Machine::new(ns, socket, now);
    let (error, hard) = match note.kind {
        ErrorKind::Redirect(target) => {
            if let Some(route) = conn.route.as_ref() {
                ns.providers.routing.redirect(route, target);
            }
            return Ok(());
        },
        ErrorKind::TooBig(mtu) => {
            conn.mtu_info = Some(mtu);
            if control.owned {
                ns.stats.inc(Counter::IcmpDeferred);
                control.deferred.mtu_reduced = true;
            } else {
                machine.mtu_reduced(&mut conn);
            }
            return Ok(());
        },
        kind => match kind.error() {
            Some(error) => error,
            None => return Ok(()),
        },
    };

    // RFC 6069, the retransmission was lost to a routing failure and not to congestion.
    if note.kind == ErrorKind::Unreachable(Icmpv6DstUnreachable::NoRoute)
        && conn.state.is_synchronized()
        && !control.owned
        && conn.backoff > 0
        && note.seq == conn.send.una
    {
        conn.backoff -= 1;
        ns.stats.inc(Counter::RtoReverts);
        machine.arm_retransmit(&mut conn);
    }

    match conn.state {
        State::SynSent | State::SynReceived => {
            if !hard {
                conn.soft_error = Some(error);
            } else if control.owned {
                ns.stats.inc(Counter::IcmpDeferred);
                control.deferred.abort = Some(error);
            } else {
                net_debug!("tcp {}: connection attempt failed: {}", conn.tuple, error);
                ns.stats.inc(Counter::IcmpHardErrors);
                ns.stats.inc(Counter::AttemptFails);
                machine.fail(&mut conn, error);
            }
        },
        _ => {
            conn.soft_error = Some(error);
            if hard && ns.config.recverr {
                conn.error = Some(error);
            }
            if hard && ns.config.abort_on_hard_error {
                if control.owned {
                    ns.stats.inc(Counter::IcmpDeferred);
                    control.deferred.abort = Some(error);
                } else {
                    ns.stats.inc(Counter::IcmpHardErrors);
                    abort(&machine, &mut conn, error);
                }
            }
        },
    }
    Ok(())
}

fn abort(machine: &Machine, conn: &mut Connection, error: SocketError) {
    net_debug!("tcp {}: aborted on hard error: {}", conn.tuple, error);
    machine.send_reset(conn);
    machine.fail(conn, error);
}

impl<'a> Machine<'a> {
    /// Apply a path MTU reported by the network.
    ///
    /// Only a strictly smaller segment size is taken and then retransmits the oldest segment once.
    pub(crate) fn mtu_reduced(&self, conn: &mut Connection) {
        let mtu = match conn.mtu_info.take() {
            Some(mtu) => mtu,
            None => return,
        };
        if conn.state == State::Closed || conn.state == State::Listen {
            return;
        }
        self.refresh_route(conn);
        let route = match conn.route.as_ref() {
            Some(route) => route.clone(),
            None => return,
        };
        self.ns.providers.routing.update_pmtu(&route, mtu);
        let mss = conn.family.mss_for_mtu(route.mtu()).min(conn.mss.peer);
        if mss >= conn.mss.effective {
            return;
        }

        net_debug!("tcp {}: segment size {} -> {}", conn.tuple, conn.mss.effective, mss);
        conn.mss.effective = mss;
        self.ns.providers.engine.mss_changed(self.id(), mss);
        if conn.state.is_synchronized() && self.retransmit_oldest(conn) {
            self.ns.stats.inc(Counter::PmtuRetransmits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Icmpv6Quoted;

    #[test]
    fn error_mapping() {
        use Icmpv6DstUnreachable as Code;
        let expected = [
            (ErrorKind::Unreachable(Code::NoRoute), SocketError::NetUnreachable, false),
            (ErrorKind::Unreachable(Code::AdminProhibit), SocketError::PermissionDenied, true),
            (ErrorKind::Unreachable(Code::BeyondScope), SocketError::HostUnreachable, false),
            (ErrorKind::Unreachable(Code::AddrUnreachable), SocketError::HostUnreachable, false),
            (ErrorKind::Unreachable(Code::PortUnreachable), SocketError::Refused, true),
            (ErrorKind::Unreachable(Code::FailedPolicy), SocketError::PermissionDenied, true),
            (ErrorKind::Unreachable(Code::RejectRoute), SocketError::PermissionDenied, true),
            (ErrorKind::TooBig(1280), SocketError::MessageTooLarge, false),
            (ErrorKind::TimeExceeded, SocketError::HostUnreachable, false),
            (ErrorKind::ParamProblem, SocketError::Protocol, true),
        ];
        for &(kind, error, hard) in expected.iter() {
            assert_eq!(kind.error(), Some((error, hard)), "{:?}", kind);
        }
        assert_eq!(ErrorKind::Redirect(Ipv6Address::LOOPBACK).error(), None);
    }

    #[test]
    fn quote_is_from_our_side() {
        let local = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let remote = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let repr = Icmpv6ErrorRepr {
            message: Icmpv6Message::PktTooBig,
            code: 0,
            info: 1280,
            target: None,
            quoted: Icmpv6Quoted {
                src_addr: local,
                dst_addr: remote,
                src_port: 40000,
                dst_port: 80,
                seq_number: TcpSeqNumber(77),
            },
        };
        let note = Notification::from_icmpv6(&repr, Some(2), 60).unwrap();
        assert_eq!(note.kind, ErrorKind::TooBig(1280));
        assert_eq!(note.tuple.local, local);
        assert_eq!(note.tuple.remote_port, 80);
        assert_eq!(note.seq, TcpSeqNumber(77));
        assert_eq!(note.iface, Some(2));

        let echo = Icmpv6ErrorRepr { message: Icmpv6Message::EchoRequest, ..repr };
        assert_eq!(Notification::from_icmpv6(&echo, None, 60), None);
    }
}
