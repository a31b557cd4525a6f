//! Segment output and stateless replies.
//!
//! Every segment leaves the namespace through [`output`], which lays out the header, reserves and
//! fills the signature, computes the checksum and hands the result to the egress. Replies that are
//! not backed by a connection, resets and the acknowledgments of time-wait records, are described
//! by a `ControlSegmentTemplate` and sent once.
use alloc::vec;

use crate::wire::{Ipv6Address, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber, TcpTimestamp};
use crate::wire::tcp::SIGNATURE_LEN;

use super::auth::{self, AuthKey};
use super::connection::FlowMeta;
use super::dispatch::{Disposition, DropReason, Segment};
use super::mapped::Family;
use super::namespace::Namespace;
use super::provider::Outbound;
use super::registry::FourTuple;
use super::stats::Counter;

/// Where a segment goes and how the network layer should treat it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Path {
    pub(crate) tuple: FourTuple,
    pub(crate) next_hop: Ipv6Address,
    pub(crate) family: Family,
    pub(crate) iface: Option<u32>,
    pub(crate) hop_limit: u8,
    pub(crate) meta: FlowMeta,
}

/// A single reset or acknowledgment without a connection behind it.
pub(crate) struct ControlSegmentTemplate<'a> {
    pub(crate) path: Path,
    pub(crate) seq: TcpSeqNumber,
    pub(crate) ack: Option<TcpSeqNumber>,
    pub(crate) rst: bool,
    pub(crate) window: u16,
    pub(crate) timestamp: Option<TcpTimestamp>,
    pub(crate) key: Option<&'a AuthKey>,
}

impl Path {
    /// The reverse path of a received segment.
    pub(crate) fn reply(seg: &Segment, hop_limit: u8) -> Self {
        Path {
            tuple: seg.tuple,
            next_hop: seg.tuple.remote,
            family: seg.family,
            iface: seg.iface,
            hop_limit,
            meta: FlowMeta::default(),
        }
    }
}

impl<'a> ControlSegmentTemplate<'a> {
    /// The reset answering `seg`.
    ///
    /// If the segment acknowledged something the reset takes its sequence number from that,
    /// otherwise it acknowledges the whole segment. There is none for resets and for segments
    /// sent to a multicast address.
    pub(crate) fn reset(seg: &Segment, hop_limit: u8) -> Option<Self> {
        if seg.repr.flags.rst() || !seg.family.is_unicast(&seg.tuple.local) {
            return None;
        }
        let (seq, ack) = match seg.repr.ack_number {
            Some(ack) => (ack, None),
            None => (TcpSeqNumber(0), Some(seg.repr.seq_number + seg.repr.sequence_len())),
        };
        Some(ControlSegmentTemplate {
            path: Path::reply(seg, hop_limit),
            seq,
            ack,
            rst: true,
            window: 0,
            timestamp: None,
            key: None,
        })
    }

    /// An acknowledgment of `ack` at `seq`.
    pub(crate) fn ack(path: Path, seq: TcpSeqNumber, ack: TcpSeqNumber, window: u16) -> Self {
        ControlSegmentTemplate {
            path,
            seq,
            ack: Some(ack),
            rst: false,
            window,
            timestamp: None,
            key: None,
        }
    }

    pub(crate) fn send(self, ns: &Namespace) {
        let repr = TcpRepr {
            flags: if self.rst { TcpFlags::RST } else { TcpFlags::default() },
            seq_number: self.seq,
            ack_number: self.ack,
            window_len: self.window,
            timestamp: self.timestamp,
            .. TcpRepr::default()
        };
        output(ns, &self.path, repr, &[], self.key);
    }
}

/// Build, sign, checksum and transmit a segment.
///
/// Ports and payload length of `repr` are taken from the path and payload.
pub(crate) fn output(
    ns: &Namespace,
    path: &Path,
    mut repr: TcpRepr,
    payload: &[u8],
    key: Option<&AuthKey>,
) {
    repr.src_port = path.tuple.local_port;
    repr.dst_port = path.tuple.remote_port;
    repr.payload_len = payload.len() as u16;
    repr.signature = key.map(|_| [0; SIGNATURE_LEN]);

    let mut segment = vec![0; repr.buffer_len()];
    {
        let mut packet = TcpPacket::new_unchecked(&mut segment[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(payload);
    }

    let pseudo = path.family.pseudo_header(path.tuple.local, path.tuple.remote, segment.len());
    if let Some(key) = key {
        if let Err(err) = auth::fill(&*ns.providers.hasher, key, &pseudo, &mut segment) {
            net_debug!("tcp {}: could not sign segment: {}", path.tuple, err);
            return;
        }
    }
    let checksum = ns.providers.hasher.checksum(&pseudo, &segment);
    TcpPacket::new_unchecked(&mut segment[..]).set_checksum(checksum);

    net_trace!("tcp {}: send {}", path.tuple, repr);
    ns.stats.inc(Counter::OutSegments);
    if repr.flags.rst() {
        ns.stats.inc(Counter::OutResets);
    }
    ns.providers.egress.transmit(Outbound {
        family: path.family,
        src: path.tuple.local,
        dst: path.tuple.remote,
        next_hop: path.next_hop,
        hop_limit: path.hop_limit,
        traffic_class: path.meta.traffic_class,
        flow_label: path.meta.flow_label,
        priority: path.meta.priority,
        iface: path.iface,
        segment,
    });
}

/// Answer a segment for which no record exists.
///
/// A signed segment is only answered when the listener on its port holds a key for the peer that
/// verifies the signature. The reset is then signed with that key.
pub(crate) fn reset_unknown(ns: &Namespace, seg: &Segment) -> Disposition {
    ns.stats.inc(Counter::NoSocket);
    let mut template = match ControlSegmentTemplate::reset(seg, ns.config.hop_limit) {
        Some(template) => template,
        None => return Disposition::Dropped(DropReason::NoSocket),
    };
    if ns.config.flowlabel_reflect_reset {
        template.path.meta.flow_label = seg.flow_label;
        template.path.meta.traffic_class = seg.traffic_class;
    }

    if seg.repr.signature.is_none() {
        template.send(ns);
        return Disposition::Answered;
    }

    let listener = ns.registry.lookup_listener(&seg.tuple.local, seg.tuple.local_port, seg.iface);
    let key = listener.and_then(|listener| listener.keys().lookup(&seg.tuple.remote, seg.iface));
    match key {
        Some(key) if auth::verify(&*ns.providers.hasher, &key, &seg.pseudo, seg.bytes) => {
            template.key = Some(&*key);
            template.send(ns);
            Disposition::Answered
        },
        _ => Disposition::Dropped(DropReason::NoSocket),
    }
}

/// Reset the sender of `seg` on behalf of a record with optional key.
pub(crate) fn reset(ns: &Namespace, seg: &Segment, key: Option<&AuthKey>) -> Disposition {
    match ControlSegmentTemplate::reset(seg, ns.config.hop_limit) {
        Some(mut template) => {
            template.key = key;
            template.send(ns);
            Disposition::Answered
        },
        None => Disposition::Dropped(DropReason::UnexpectedFlags),
    }
}
