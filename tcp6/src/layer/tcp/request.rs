//! Half-open connections of a listener.
//!
//! A request stores what the SYN negotiated until the final ACK of the handshake arrives, then it
//! is turned into a full connection. Connections answered with a cookie pass through the same
//! representation, rebuilt from the cookie.
use alloc::sync::Arc;

use crate::time::Instant;
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber, TcpTimestamp};

use super::config::Config;
use super::connection::{
    Connection, FlowMeta, Mss, RecvSequence, SendSequence, SocketOptions, State, Timestamps,
    DEFAULT_MSS};
use super::cookie::CookieOptions;
use super::dispatch::Segment;
use super::listener::Listener;
use super::mapped::Family;
use super::provider::Route;
use super::registry::FourTuple;
use super::responder::Path;
use super::siphash::IsnGenerator;
use super::timer::TimerHandle;

pub(crate) struct RequestSocket {
    pub(crate) tuple: FourTuple,
    pub(crate) iface: Option<u32>,
    pub(crate) family: Family,
    pub(crate) iss: TcpSeqNumber,
    pub(crate) irs: TcpSeqNumber,
    pub(crate) mss: Mss,
    /// The shift of the peer, if it offered scaling.
    pub(crate) snd_wscale: Option<u8>,
    pub(crate) rcv_wscale: u8,
    /// The unscaled receive window we offer.
    pub(crate) window: u32,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) sack: bool,
    pub(crate) retransmits: u32,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) meta: FlowMeta,
    pub(crate) hop_limit: u8,
    pub(crate) route: Arc<Route>,
}

impl RequestSocket {
    /// Negotiate with the options of a SYN.
    pub(crate) fn from_syn(
        config: &Config,
        isn: &IsnGenerator,
        listener: &Listener,
        seg: &Segment,
        iss: TcpSeqNumber,
        route: Arc<Route>,
    ) -> Self {
        let repr = &seg.repr;
        let advertised = seg.family.mss_for_mtu(route.mtu());
        let peer = repr.max_seg_size.unwrap_or(DEFAULT_MSS);
        let timestamps = match repr.timestamp {
            Some(ts) if config.timestamps => Some(Timestamps {
                offset: isn.ts_offset(&seg.tuple.local, &seg.tuple.remote),
                recent: ts.tsval,
            }),
            _ => None,
        };
        let scaling = repr.window_scale.is_some();
        RequestSocket {
            tuple: seg.tuple,
            iface: Self::bound_iface(listener, seg),
            family: seg.family,
            iss,
            irs: repr.seq_number,
            mss: Mss { advertised, peer, effective: advertised.min(peer) },
            snd_wscale: repr.window_scale,
            rcv_wscale: if scaling { config.window_scale } else { 0 },
            window: Self::window(config, scaling),
            timestamps,
            sack: config.sack && repr.sack_permitted,
            retransmits: 0,
            timer: None,
            meta: listener.meta(),
            hop_limit: config.hop_limit,
            route,
        }
    }

    /// Rebuild the negotiation from the cookie returned in `seg`.
    ///
    /// Cookies do not remember timestamps or selective acknowledgments.
    pub(crate) fn from_cookie(
        config: &Config,
        listener: &Listener,
        seg: &Segment,
        iss: TcpSeqNumber,
        options: CookieOptions,
        route: Arc<Route>,
    ) -> Self {
        let advertised = seg.family.mss_for_mtu(route.mtu());
        let scaling = options.wscale.is_some();
        RequestSocket {
            tuple: seg.tuple,
            iface: Self::bound_iface(listener, seg),
            family: seg.family,
            iss,
            irs: seg.repr.seq_number - 1,
            mss: Mss { advertised, peer: options.mss, effective: advertised.min(options.mss) },
            snd_wscale: options.wscale,
            rcv_wscale: if scaling { config.window_scale } else { 0 },
            window: Self::window(config, scaling),
            timestamps: None,
            sack: false,
            retransmits: 0,
            timer: None,
            meta: listener.meta(),
            hop_limit: config.hop_limit,
            route,
        }
    }

    /// Link-local peers are bound to the interface they came in on.
    fn bound_iface(listener: &Listener, seg: &Segment) -> Option<u32> {
        listener.iface().or_else(|| if seg.tuple.remote.is_link_local() {
            seg.iface
        } else {
            None
        })
    }

    fn window(config: &Config, scaling: bool) -> u32 {
        if scaling {
            config.receive_window.min(u32::from(u16::MAX) << config.window_scale)
        } else {
            config.receive_window.min(u32::from(u16::MAX))
        }
    }

    pub(crate) fn path(&self) -> Path {
        Path {
            tuple: self.tuple,
            next_hop: self.route.next_hop,
            family: self.family,
            iface: self.iface.or(self.route.iface),
            hop_limit: self.hop_limit,
            meta: self.meta,
        }
    }

    /// The SYN-ACK, ports left to the output.
    pub(crate) fn synack(&self, now: Instant) -> TcpRepr {
        TcpRepr {
            flags: TcpFlags::SYN,
            seq_number: self.iss,
            ack_number: Some(self.irs + 1),
            window_len: self.window.min(u32::from(u16::MAX)) as u16,
            max_seg_size: Some(self.mss.advertised),
            window_scale: self.snd_wscale.map(|_| self.rcv_wscale),
            sack_permitted: self.sack,
            timestamp: self.timestamps.map(|ts| TcpTimestamp {
                tsval: (now.total_millis() as u32).wrapping_add(ts.offset),
                tsecr: ts.recent,
            }),
            .. TcpRepr::default()
        }
    }

    /// The deadline of the next SYN-ACK retransmission.
    pub(crate) fn deadline(&self, config: &Config, now: Instant) -> Instant {
        let millis = config.rto_initial.as_millis()
            .checked_shl(self.retransmits.min(32))
            .unwrap_or(u128::MAX)
            .min(config.rto_max.as_millis());
        now + crate::time::Duration::from_millis(millis as u64)
    }

    /// Whether `seq` lies in the window we offered.
    pub(crate) fn in_window(&self, seq: TcpSeqNumber, len: usize) -> bool {
        let low = self.irs + 1;
        let high = low + self.window as usize;
        seq.is_between(low, high) || (len > 0 && (seq + (len - 1)).is_between(low, high))
    }

    /// The full connection, still in SYN-RECEIVED with the handshake ACK outstanding.
    pub(crate) fn connection(&self, listener: &Listener, config: &Config, now: Instant) -> Connection {
        let options = SocketOptions {
            local: self.tuple.local,
            local_port: self.tuple.local_port,
            iface: self.iface,
            v6only: listener.v6only(),
            keys: listener.keys().clone(),
            meta: self.meta,
            min_hopcount: listener.min_hopcount(),
        };
        let mut conn = Connection::new(&options, self.hop_limit);
        conn.state = State::SynReceived;
        conn.previous = State::Listen;
        conn.tuple = self.tuple;
        conn.family = self.family;
        conn.send = SendSequence {
            iss: self.iss,
            una: self.iss,
            nxt: self.iss + 1,
            window: 0,
            wl1: self.irs,
            wl2: self.iss,
            scale: self.snd_wscale.unwrap_or(0),
        };
        conn.recv = RecvSequence {
            irs: self.irs,
            nxt: self.irs + 1,
            window: self.window,
            scale: self.rcv_wscale,
        };
        conn.scaling = self.snd_wscale.is_some();
        conn.mss = self.mss;
        conn.timestamps = self.timestamps;
        conn.sack = self.sack;
        conn.route = Some(self.route.clone());
        conn.rto = config.rto_initial;
        conn.last_received = now;
        conn
    }
}
