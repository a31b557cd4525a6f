//! Addresses, the transport pseudo header and the internet checksum.
//!
//! Connections are always keyed by IPv6 addresses. IPv4 peers appear as [IPv4-mapped] addresses
//! and only their pseudo header retains the IPv4 form.
//!
//! [IPv4-mapped]: https://tools.ietf.org/html/rfc4291#section-2.5.5.2
use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        HopByHop  = 0x00,
        Tcp       = 0x06,
        Udp       = 0x11,
        Ipv6Route = 0x2b,
        Ipv6Frag  = 0x2c,
        Icmpv6    = 0x3a,
        Ipv6NoNxt = 0x3b,
        Ipv6Opts  = 0x3c,
    }
}

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Ipv4Address(pub [u8; 4]);

/// A sixteen-octet IPv6 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Ipv6Address(pub [u8; 16]);

impl Ipv4Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Ipv4Address = Ipv4Address([0x00; 4]);

    /// The broadcast address.
    pub const BROADCAST: Ipv4Address = Ipv4Address([0xff; 4]);

    /// The conventional loopback address.
    pub const LOOPBACK: Ipv4Address = Ipv4Address([127, 0, 0, 1]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Ipv4Address {
        Ipv4Address([a0, a1, a2, a3])
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the address is an unicast address.
    pub fn is_unicast(&self) -> bool {
        !(self.is_broadcast() ||
          self.is_multicast() ||
          self.is_unspecified())
    }

    /// Query whether the address is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255; 4]
    }

    /// Query whether the address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 224
    }

    /// Query whether the address falls into the "unspecified" range.
    pub fn is_unspecified(&self) -> bool {
        self.0[0] == 0
    }

    /// Query whether the address falls into the loopback range.
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }
}

impl Ipv6Address {
    /// The [unspecified address].
    ///
    /// [unspecified address]: https://tools.ietf.org/html/rfc4291#section-2.5.2
    pub const UNSPECIFIED: Ipv6Address = Ipv6Address([0x00; 16]);

    /// The [loopback address].
    ///
    /// [loopback address]: https://tools.ietf.org/html/rfc4291#section-2.5.3
    pub const LOOPBACK: Ipv6Address =
        Ipv6Address([0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);

    /// Construct an IPv6 address from parts.
    pub fn new(
        a0: u16, a1: u16, a2: u16, a3: u16,
        a4: u16, a5: u16, a6: u16, a7: u16,
    ) -> Ipv6Address {
        let mut addr = [0u8; 16];
        NetworkEndian::write_u16(&mut addr[0..2], a0);
        NetworkEndian::write_u16(&mut addr[2..4], a1);
        NetworkEndian::write_u16(&mut addr[4..6], a2);
        NetworkEndian::write_u16(&mut addr[6..8], a3);
        NetworkEndian::write_u16(&mut addr[8..10], a4);
        NetworkEndian::write_u16(&mut addr[10..12], a5);
        NetworkEndian::write_u16(&mut addr[12..14], a6);
        NetworkEndian::write_u16(&mut addr[14..16], a7);
        Ipv6Address(addr)
    }

    /// Construct an IPv6 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not sixteen octets long.
    pub fn from_bytes(data: &[u8]) -> Ipv6Address {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(data);
        Ipv6Address(bytes)
    }

    /// Construct an IPv6 address as a mapped ipv4 address.
    ///
    /// Note that the resulting address is always classified as unicast by IPv6 rules even when the
    /// IPv4 address is not. Check the IPv4 address separately where that matters.
    pub const fn from_mapped_ipv4(addr: Ipv4Address) -> Ipv6Address {
        let Ipv4Address([a, b, c, d]) = addr;
        Ipv6Address([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, a, b, c, d])
    }

    /// Return an IPv6 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the IPv6 address is an [unicast address].
    ///
    /// [unicast address]: https://tools.ietf.org/html/rfc4291#section-2.5
    pub fn is_unicast(&self) -> bool {
        !(self.is_multicast() || self.is_unspecified())
    }

    /// Query whether the IPv6 address is a [multicast address].
    ///
    /// [multicast address]: https://tools.ietf.org/html/rfc4291#section-2.7
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// Query whether the IPv6 address is the [unspecified address].
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0x00; 16]
    }

    /// Query whether the IPv6 address is in the [link-local] scope.
    ///
    /// [link-local]: https://tools.ietf.org/html/rfc4291#section-2.5.6
    pub fn is_link_local(&self) -> bool {
        self.0[0] == 0xfe && self.0[1] & 0xc0 == 0x80
    }

    /// Query whether the IPv6 address is the [loopback address].
    pub fn is_loopback(&self) -> bool {
        *self == Self::LOOPBACK
    }

    /// Query whether the IPv6 address is an IPv4 mapped IPv6 address.
    pub fn is_ipv4_mapped(&self) -> bool {
        self.0[0..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]
    }

    /// Convert an IPv4 mapped IPv6 address to an IPv4 address.
    pub fn as_ipv4(&self) -> Option<Ipv4Address> {
        if self.is_ipv4_mapped() {
            Some(Ipv4Address([self.0[12], self.0[13], self.0[14], self.0[15]]))
        } else {
            None
        }
    }

    /// Mask the address to some prefix length.
    ///
    /// Prefixes longer than 128 bits are treated as 128.
    pub fn mask(&self, prefix: u8) -> Ipv6Address {
        let prefix = prefix.min(128);
        let mut bytes = self.0;
        for (i, part) in bytes.iter_mut().enumerate() {
            // Remaining bits in this part.
            let bits = prefix
                .saturating_sub((i*8) as u8)
                .min(8);
            *part &= !0xffu8
                .checked_shr(bits.into())
                .unwrap_or(0);
        }
        Ipv6Address(bytes)
    }

    /// Check if both addresses agree in the first `prefix` bits.
    pub fn prefix_matches(&self, other: &Ipv6Address, prefix: u8) -> bool {
        self.mask(prefix) == other.mask(prefix)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(v4) = self.as_ipv4() {
            return write!(f, "::ffff:{}", v4)
        }

        let mut words = [0u16; 8];
        for (i, word) in words.iter_mut().enumerate() {
            *word = NetworkEndian::read_u16(&self.0[2*i..2*i + 2]);
        }

        // Collapse the first (longest would be nicer) run of zero words into "::".
        let run = words.iter().position(|&w| w == 0).map(|start| {
            let len = words[start..].iter().take_while(|&&w| w == 0).count();
            (start, start + len)
        });

        match run {
            Some((start, end)) if end - start > 1 => {
                for (i, word) in words[..start].iter().enumerate() {
                    if i > 0 { write!(f, ":")? }
                    write!(f, "{:x}", word)?;
                }
                write!(f, "::")?;
                for (i, word) in words[end..].iter().enumerate() {
                    if i > 0 { write!(f, ":")? }
                    write!(f, "{:x}", word)?;
                }
                Ok(())
            },
            _ => {
                for (i, word) in words.iter().enumerate() {
                    if i > 0 { write!(f, ":")? }
                    write!(f, "{:x}", word)?;
                }
                Ok(())
            },
        }
    }
}

#[cfg(feature = "std")]
impl From<::std::net::Ipv6Addr> for Ipv6Address {
    fn from(x: ::std::net::Ipv6Addr) -> Ipv6Address {
        Ipv6Address(x.octets())
    }
}

#[cfg(feature = "std")]
impl From<Ipv6Address> for ::std::net::Ipv6Addr {
    fn from(Ipv6Address(x): Ipv6Address) -> ::std::net::Ipv6Addr {
        x.into()
    }
}

#[cfg(feature = "std")]
impl From<::std::net::Ipv4Addr> for Ipv4Address {
    fn from(x: ::std::net::Ipv4Addr) -> Ipv4Address {
        Ipv4Address(x.octets())
    }
}

/// The pseudo header preceding transport data in checksums and segment signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    addrs: Addrs,
    /// The transport protocol.
    pub protocol: Protocol,
    /// Length of the transport header and payload.
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addrs {
    V4(Ipv4Address, Ipv4Address),
    V6(Ipv6Address, Ipv6Address),
}

impl PseudoHeader {
    /// The longest pseudo header in octets, that of IPv6.
    pub const MAX_LEN: usize = 40;

    /// A pseudo header for an IPv4 datagram.
    pub fn v4(src: Ipv4Address, dst: Ipv4Address, protocol: Protocol, length: u32) -> Self {
        PseudoHeader { addrs: Addrs::V4(src, dst), protocol, length }
    }

    /// A pseudo header for an IPv6 datagram.
    pub fn v6(src: Ipv6Address, dst: Ipv6Address, protocol: Protocol, length: u32) -> Self {
        PseudoHeader { addrs: Addrs::V6(src, dst), protocol, length }
    }

    /// Compute the partial (not complemented) checksum over the pseudo header.
    pub fn checksum(&self) -> u16 {
        let mut buffer = [0; Self::MAX_LEN];
        let len = self.emit(&mut buffer);
        checksum::data(&buffer[..len])
    }

    /// Write the pseudo header octets, returning the number of octets written.
    ///
    /// The IPv4 layout is `src, dst, zero, protocol, length (16 bit)` and the IPv6 layout is
    /// `src, dst, length (32 bit), zero (24 bit), next header`.
    pub fn emit(&self, buffer: &mut [u8; Self::MAX_LEN]) -> usize {
        match self.addrs {
            Addrs::V4(src, dst) => {
                buffer[0..4].copy_from_slice(src.as_bytes());
                buffer[4..8].copy_from_slice(dst.as_bytes());
                buffer[8] = 0;
                buffer[9] = self.protocol.into();
                NetworkEndian::write_u16(&mut buffer[10..12], self.length as u16);
                12
            },
            Addrs::V6(src, dst) => {
                buffer[0..16].copy_from_slice(src.as_bytes());
                buffer[16..32].copy_from_slice(dst.as_bytes());
                NetworkEndian::write_u32(&mut buffer[32..36], self.length);
                buffer[36..39].copy_from_slice(&[0; 3]);
                buffer[39] = self.protocol.into();
                40
            },
        }
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::PseudoHeader;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// The complemented checksum of pseudo header and transport data.
    ///
    /// Over data with a correctly filled checksum field the result is zero.
    pub(crate) fn transport(pseudo: &PseudoHeader, payload: &[u8]) -> u16 {
        !combine(&[pseudo.checksum(), data(payload)])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mapped_roundtrip() {
        let v4 = Ipv4Address::new(192, 0, 2, 7);
        let mapped = Ipv6Address::from_mapped_ipv4(v4);
        assert!(mapped.is_ipv4_mapped());
        assert_eq!(mapped.as_ipv4(), Some(v4));
        assert_eq!(format!("{}", mapped), "::ffff:192.0.2.7");
        assert_eq!(Ipv6Address::LOOPBACK.as_ipv4(), None);
    }

    #[test]
    fn prefixes() {
        let a = Ipv6Address::new(0x2001, 0xdb8, 0, 1, 0, 0, 0, 1);
        let b = Ipv6Address::new(0x2001, 0xdb8, 0, 2, 0, 0, 0, 1);
        assert!(a.prefix_matches(&b, 32));
        assert!(a.prefix_matches(&b, 48));
        assert!(!a.prefix_matches(&b, 64));
        assert!(a.prefix_matches(&b, 0));
        assert_eq!(a.mask(200), a);
    }

    #[test]
    fn classification() {
        assert!(Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).is_link_local());
        assert!(Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 1).is_multicast());
        assert!(!Ipv6Address::UNSPECIFIED.is_unicast());
        assert!(Ipv4Address::new(224, 0, 0, 1).is_multicast());
        assert!(!Ipv4Address::BROADCAST.is_unicast());
    }

    #[test]
    fn display_compressed() {
        let addr = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        assert_eq!(format!("{}", addr), "2001:db8::1");
        assert_eq!(format!("{}", Ipv6Address::LOOPBACK), "::1");
    }

    #[test]
    fn pseudo_header_layout() {
        let pseudo = PseudoHeader::v6(Ipv6Address::LOOPBACK, Ipv6Address::LOOPBACK, Protocol::Tcp, 20);
        let mut buffer = [0xaa; PseudoHeader::MAX_LEN];
        assert_eq!(pseudo.emit(&mut buffer), 40);
        assert_eq!(&buffer[32..40], &[0, 0, 0, 20, 0, 0, 0, 6]);

        let pseudo = PseudoHeader::v4(Ipv4Address::LOOPBACK, Ipv4Address::LOOPBACK, Protocol::Tcp, 20);
        assert_eq!(pseudo.emit(&mut buffer), 12);
        assert_eq!(&buffer[8..12], &[0, 6, 0, 20]);
    }
}
