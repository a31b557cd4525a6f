//! IPv4 peers on IPv6 sockets.
//!
//! IPv4 addresses are handled as IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) everywhere in the
//! tables. Only three things depend on the network layer that actually carries a flow: the size of
//! its header, the layout of the pseudo header and the route lookup. These are selected by the
//! [`Family`] of a connection, chosen once before the connection is published.
//!
//! [`Family`]: enum.Family.html
use crate::wire::{IpProtocol, Ipv4Address, Ipv6Address, PseudoHeader};

use super::dispatch::Inbound;

/// The network layer carrying a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    /// Native IPv6.
    Inet6,
    /// IPv4, with mapped addresses.
    Mapped,
}

/// A segment received over IPv4.
#[derive(Clone, Copy, Debug)]
pub struct Inbound4<'a> {
    /// The source address.
    pub src: Ipv4Address,
    /// The destination address.
    pub dst: Ipv4Address,
    /// The remaining time to live.
    pub ttl: u8,
    /// The type of service octet.
    pub tos: u8,
    /// The interface the segment arrived on.
    pub iface: Option<u32>,
    /// The TCP segment, header and payload.
    pub segment: &'a [u8],
}

/// The smallest segment size we reduce to on path MTU feedback.
pub const MIN_MSS: u16 = 88;

const TCP_HEADER_LEN: u32 = 20;

impl Family {
    /// The family of a remote address.
    pub fn of(addr: &Ipv6Address) -> Family {
        if addr.is_ipv4_mapped() {
            Family::Mapped
        } else {
            Family::Inet6
        }
    }

    /// The length of the network header without options.
    pub fn network_header_len(self) -> usize {
        match self {
            Family::Inet6 => 40,
            Family::Mapped => 20,
        }
    }

    /// The pseudo header of a TCP segment of `len` octets.
    pub fn pseudo_header(self, src: Ipv6Address, dst: Ipv6Address, len: usize) -> PseudoHeader {
        match self {
            Family::Inet6 => PseudoHeader::v6(src, dst, IpProtocol::Tcp, len as u32),
            Family::Mapped => PseudoHeader::v4(
                src.as_ipv4().unwrap_or(Ipv4Address::UNSPECIFIED),
                dst.as_ipv4().unwrap_or(Ipv4Address::UNSPECIFIED),
                IpProtocol::Tcp,
                len as u32),
        }
    }

    /// The segment size that fits a path MTU.
    pub fn mss_for_mtu(self, mtu: u32) -> u16 {
        let overhead = self.network_header_len() as u32 + TCP_HEADER_LEN;
        let mss = mtu.saturating_sub(overhead).min(u32::from(u16::MAX)) as u16;
        mss.max(MIN_MSS)
    }

    /// Check a peer address of this family for use as a unicast endpoint.
    pub(crate) fn is_unicast(self, addr: &Ipv6Address) -> bool {
        match self {
            Family::Inet6 => addr.is_unicast(),
            Family::Mapped => match addr.as_ipv4() {
                Some(v4) => v4.is_unicast(),
                None => false,
            },
        }
    }
}

impl<'a> Inbound4<'a> {
    /// The same segment with mapped addresses.
    pub fn mapped(&self) -> Inbound<'a> {
        Inbound {
            src: map(self.src),
            dst: map(self.dst),
            hop_limit: self.ttl,
            traffic_class: self.tos,
            flow_label: 0,
            iface: self.iface,
            segment: self.segment,
        }
    }
}

/// The mapped form of an IPv4 address.
pub fn map(addr: Ipv4Address) -> Ipv6Address {
    Ipv6Address::from_mapped_ipv4(addr)
}

/// The wildcard bind matching all IPv4 addresses, `::ffff:0.0.0.0`.
pub const MAPPED_ANY: Ipv6Address = Ipv6Address::from_mapped_ipv4(Ipv4Address::UNSPECIFIED);

/// The mapped loopback address, `::ffff:127.0.0.1`.
pub const MAPPED_LOOPBACK: Ipv6Address = Ipv6Address::from_mapped_ipv4(Ipv4Address::LOOPBACK);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(Family::Inet6.mss_for_mtu(1500), 1440);
        assert_eq!(Family::Mapped.mss_for_mtu(1500), 1460);
        assert_eq!(Family::Inet6.mss_for_mtu(100), MIN_MSS);
        assert_eq!(Family::Inet6.mss_for_mtu(1 << 20), u16::MAX);
    }

    #[test]
    fn pseudo_header_form() {
        let src = map(Ipv4Address::new(192, 168, 1, 1));
        let dst = map(Ipv4Address::new(192, 168, 1, 2));
        let mut buffer = [0; PseudoHeader::MAX_LEN];
        assert_eq!(Family::Mapped.pseudo_header(src, dst, 20).emit(&mut buffer), 12);
        assert_eq!(&buffer[..8], &[192, 168, 1, 1, 192, 168, 1, 2]);
        assert_eq!(Family::Inet6.pseudo_header(src, dst, 20).emit(&mut buffer), 40);
    }

    #[test]
    fn classification() {
        assert_eq!(Family::of(&MAPPED_LOOPBACK), Family::Mapped);
        assert_eq!(Family::of(&Ipv6Address::LOOPBACK), Family::Inet6);
        assert!(Family::Mapped.is_unicast(&MAPPED_LOOPBACK));
        assert!(!Family::Mapped.is_unicast(&MAPPED_ANY));
        assert!(!Family::Mapped.is_unicast(&map(Ipv4Address::BROADCAST)));
        assert!(!Family::Mapped.is_unicast(&Ipv6Address::LOOPBACK));
    }

    #[test]
    fn inbound_is_mapped() {
        let segment = [0u8; 20];
        let packet = Inbound4 {
            src: Ipv4Address::new(10, 0, 0, 1),
            dst: Ipv4Address::new(10, 0, 0, 2),
            ttl: 17,
            tos: 0x10,
            iface: Some(2),
            segment: &segment,
        };
        let mapped = packet.mapped();
        assert_eq!(mapped.src, map(Ipv4Address::new(10, 0, 0, 1)));
        assert_eq!(Family::of(&mapped.dst), Family::Mapped);
        assert_eq!(mapped.hop_limit, 17);
        assert_eq!(mapped.traffic_class, 0x10);
    }
}
