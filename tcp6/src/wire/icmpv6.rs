//! ICMPv6 error messages that concern TCP.
//!
//! Only the messages that feed back into the state of a connection are interpreted: destination
//! unreachable, packet too big, time exceeded, parameter problem and redirect. Every one of them
//! carries (a prefix of) the offending datagram, of which we need the addresses, the ports and
//! the sequence number.
use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Ipv6Address, PseudoHeader, Result};
use super::ip::{checksum, Protocol};
use super::tcp::SeqNumber;

enum_with_unknown! {
    /// Internet control message type.
    pub enum Message(u8) {
        /// Destination unreachable
        DstUnreachable = 0x01,
        /// Packet too big
        PktTooBig      = 0x02,
        /// Time exceeded
        TimeExceeded   = 0x03,
        /// Parameter problem
        ParamProblem   = 0x04,
        /// Echo request
        EchoRequest    = 0x80,
        /// Echo reply
        EchoReply      = 0x81,
        /// Redirect
        Redirect       = 0x89,
    }
}

impl Message {
    /// Query whether this is an error message, as opposed to an informational one.
    pub fn is_error(&self) -> bool {
        u8::from(*self) & 0x80 == 0
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::DstUnreachable => write!(f, "destination unreachable"),
            Message::PktTooBig      => write!(f, "packet too big"),
            Message::TimeExceeded   => write!(f, "time exceeded"),
            Message::ParamProblem   => write!(f, "parameter problem"),
            Message::EchoRequest    => write!(f, "echo request"),
            Message::EchoReply      => write!(f, "echo reply"),
            Message::Redirect       => write!(f, "redirect"),
            Message::Unknown(id)    => write!(f, "{}", id),
        }
    }
}

enum_with_unknown! {
    /// Internet control message subtype for type "Destination Unreachable".
    pub enum DstUnreachable(u8) {
        /// No route to destination.
        NoRoute         = 0,
        /// Communication with destination administratively prohibited.
        AdminProhibit   = 1,
        /// Beyond scope of source address.
        BeyondScope     = 2,
        /// Address unreachable.
        AddrUnreachable = 3,
        /// Port unreachable.
        PortUnreachable = 4,
        /// Source address failed ingress/egress policy.
        FailedPolicy    = 5,
        /// Reject route to destination.
        RejectRoute     = 6,
    }
}

impl fmt::Display for DstUnreachable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DstUnreachable::NoRoute =>
                write!(f, "no route to destination"),
            DstUnreachable::AdminProhibit =>
                write!(f, "administratively prohibited"),
            DstUnreachable::BeyondScope =>
                write!(f, "beyond scope of source address"),
            DstUnreachable::AddrUnreachable =>
                write!(f, "address unreachable"),
            DstUnreachable::PortUnreachable =>
                write!(f, "port unreachable"),
            DstUnreachable::FailedPolicy =>
                write!(f, "source address failed policy"),
            DstUnreachable::RejectRoute =>
                write!(f, "reject route to destination"),
            DstUnreachable::Unknown(id) =>
                write!(f, "{}", id),
        }
    }
}

/// A read/write wrapper around an ICMPv6 message buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

mod field {
    use crate::wire::field::Field;

    pub(crate) const TYPE:       usize = 0;
    pub(crate) const CODE:       usize = 1;
    pub(crate) const CHECKSUM:   Field = 2..4;
    /// Unused, the MTU or the pointer, depending on type.
    pub(crate) const DATA:       Field = 4..8;
    pub(crate) const HEADER_END: usize = 8;

    pub(crate) const REDIRECT_TARGET: Field = 8..24;
    pub(crate) const REDIRECT_DEST:   Field = 24..40;
    pub(crate) const REDIRECT_END:    usize = 40;

    /// The neighbor discovery option carrying the redirected header.
    pub(crate) const OPT_REDIRECTED_HDR: u8 = 4;
    pub(crate) const OPT_REDIRECTED_HDR_LEN: usize = 8;

    pub(crate) const IPV6_HEADER_LEN: usize = 40;
    pub(crate) const IPV6_NEXT_HEADER: usize = 6;
    pub(crate) const IPV6_SRC: Field = 8..24;
    pub(crate) const IPV6_DST: Field = 24..40;

    /// The prefix of the tcp header that must be quoted.
    pub(crate) const TCP_QUOTE_LEN: usize = 8;
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with ICMPv6 packet structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short for the fixed header of its
    /// message type.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::HEADER_END {
            return Err(Error::Truncated)
        }
        if self.msg_type() == Message::Redirect && len < field::REDIRECT_END {
            return Err(Error::Truncated)
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the message type field.
    #[inline]
    pub fn msg_type(&self) -> Message {
        Message::from(self.buffer.as_ref()[field::TYPE])
    }

    /// Return the message code field.
    #[inline]
    pub fn msg_code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// Return the type dependent 32-bit field.
    ///
    /// This is the MTU of a packet too big message and the pointer of a parameter problem.
    #[inline]
    pub fn data(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::DATA])
    }

    /// Return the target address of a redirect.
    ///
    /// # Panics
    /// This function may panic if this packet is not a redirect.
    pub fn redirect_target(&self) -> Ipv6Address {
        Ipv6Address::from_bytes(&self.buffer.as_ref()[field::REDIRECT_TARGET])
    }

    /// Return the destination address of a redirect.
    ///
    /// # Panics
    /// This function may panic if this packet is not a redirect.
    pub fn redirect_destination(&self) -> Ipv6Address {
        Ipv6Address::from_bytes(&self.buffer.as_ref()[field::REDIRECT_DEST])
    }

    /// Return the part of the message after the fixed header.
    ///
    /// For error messages this is the quoted datagram, for redirects the option area.
    pub fn payload(&self) -> &[u8] {
        let start = match self.msg_type() {
            Message::Redirect => field::REDIRECT_END,
            _ => field::HEADER_END,
        };
        &self.buffer.as_ref()[start..]
    }

    /// Validate the checksum against the pseudo header of the enclosing datagram.
    ///
    /// # Fuzzing
    /// This function always returns `true` when fuzzing.
    pub fn verify_checksum(&self, pseudo: &PseudoHeader) -> bool {
        if cfg!(fuzzing) { return true }

        checksum::transport(pseudo, self.buffer.as_ref()) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the message type field.
    #[inline]
    pub fn set_msg_type(&mut self, value: Message) {
        self.buffer.as_mut()[field::TYPE] = value.into();
    }

    /// Set the message code field.
    #[inline]
    pub fn set_msg_code(&mut self, value: u8) {
        self.buffer.as_mut()[field::CODE] = value;
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    /// Set the type dependent 32-bit field.
    #[inline]
    pub fn set_data(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::DATA], value)
    }

    /// Compute and fill in the checksum.
    pub fn fill_checksum(&mut self, pseudo: &PseudoHeader) {
        self.set_checksum(0);
        let checksum = checksum::transport(pseudo, self.buffer.as_ref());
        self.set_checksum(checksum)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// The part of the offending segment quoted in an error message.
///
/// The addresses and ports are those of the original datagram. When the message concerns a
/// segment we sent then `src_addr` is our local address.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Quoted {
    pub src_addr: Ipv6Address,
    pub dst_addr: Ipv6Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
}

impl Quoted {
    /// Parse a quoted IPv6 datagram that must carry the beginning of a TCP segment.
    ///
    /// Extension headers are skipped. A non-initial fragment does not contain the transport
    /// header and is `Unrecognized`.
    pub fn parse(data: &[u8]) -> Result<Quoted> {
        if data.len() < field::IPV6_HEADER_LEN {
            return Err(Error::Truncated)
        }
        if data[0] >> 4 != 6 {
            return Err(Error::Malformed)
        }
        let src_addr = Ipv6Address::from_bytes(&data[field::IPV6_SRC]);
        let dst_addr = Ipv6Address::from_bytes(&data[field::IPV6_DST]);

        let mut next = Protocol::from(data[field::IPV6_NEXT_HEADER]);
        let mut rest = &data[field::IPV6_HEADER_LEN..];
        loop {
            match next {
                Protocol::Tcp => break,
                Protocol::HopByHop | Protocol::Ipv6Route | Protocol::Ipv6Opts => {
                    if rest.len() < 2 { return Err(Error::Truncated) }
                    let len = (usize::from(rest[1]) + 1) * 8;
                    if rest.len() < len { return Err(Error::Truncated) }
                    next = Protocol::from(rest[0]);
                    rest = &rest[len..];
                },
                Protocol::Ipv6Frag => {
                    if rest.len() < 8 { return Err(Error::Truncated) }
                    let offset = NetworkEndian::read_u16(&rest[2..4]) >> 3;
                    if offset != 0 { return Err(Error::Unrecognized) }
                    next = Protocol::from(rest[0]);
                    rest = &rest[8..];
                },
                _ => return Err(Error::Unrecognized),
            }
        }

        if rest.len() < field::TCP_QUOTE_LEN {
            return Err(Error::Truncated)
        }

        Ok(Quoted {
            src_addr,
            dst_addr,
            src_port: NetworkEndian::read_u16(&rest[0..2]),
            dst_port: NetworkEndian::read_u16(&rest[2..4]),
            seq_number: SeqNumber(NetworkEndian::read_i32(&rest[4..8])),
        })
    }

    /// The length of a quote emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        field::IPV6_HEADER_LEN + field::TCP_QUOTE_LEN
    }

    /// Emit a minimal IPv6 header followed by the first octets of a TCP header.
    pub fn emit(&self, data: &mut [u8]) {
        let data = &mut data[..self.buffer_len()];
        for b in data.iter_mut() { *b = 0 }
        data[0] = 0x60;
        NetworkEndian::write_u16(&mut data[4..6], field::TCP_QUOTE_LEN as u16);
        data[field::IPV6_NEXT_HEADER] = Protocol::Tcp.into();
        data[7] = 64;
        data[field::IPV6_SRC].copy_from_slice(self.src_addr.as_bytes());
        data[field::IPV6_DST].copy_from_slice(self.dst_addr.as_bytes());
        let tcp = &mut data[field::IPV6_HEADER_LEN..];
        NetworkEndian::write_u16(&mut tcp[0..2], self.src_port);
        NetworkEndian::write_u16(&mut tcp[2..4], self.dst_port);
        NetworkEndian::write_i32(&mut tcp[4..8], self.seq_number.0);
    }
}

/// A high-level representation of an ICMPv6 error or redirect concerning a TCP segment.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ErrorRepr {
    pub message: Message,
    pub code: u8,
    /// The type dependent field: MTU of packet too big, pointer of parameter problem.
    pub info: u32,
    /// The new first hop of a redirect.
    pub target: Option<Ipv6Address>,
    pub quoted: Quoted,
}

impl ErrorRepr {
    /// Parse an error message and its quote.
    ///
    /// The checksum is validated with the pseudo header of the enclosing datagram. Informational
    /// messages are `Unsupported`.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>, pseudo: &PseudoHeader) -> Result<ErrorRepr> {
        packet.check_len()?;
        if !packet.verify_checksum(pseudo) {
            return Err(Error::WrongChecksum)
        }

        let message = packet.msg_type();
        match message {
            Message::DstUnreachable
            | Message::PktTooBig
            | Message::TimeExceeded
            | Message::ParamProblem => {
                Ok(ErrorRepr {
                    message,
                    code: packet.msg_code(),
                    info: packet.data(),
                    target: None,
                    quoted: Quoted::parse(packet.payload())?,
                })
            },
            Message::Redirect => {
                let quote = Self::redirected_header(packet.payload())?;
                Ok(ErrorRepr {
                    message,
                    code: packet.msg_code(),
                    info: 0,
                    target: Some(packet.redirect_target()),
                    quoted: Quoted::parse(quote)?,
                })
            },
            Message::Unknown(_) => Err(Error::Unrecognized),
            _ => Err(Error::Unsupported),
        }
    }

    /// Find the redirected header option among the neighbor discovery options.
    fn redirected_header(mut options: &[u8]) -> Result<&[u8]> {
        while options.len() >= 2 {
            let kind = options[0];
            let len = usize::from(options[1]) * 8;
            if len == 0 {
                return Err(Error::Malformed)
            }
            if options.len() < len {
                return Err(Error::Truncated)
            }
            if kind == field::OPT_REDIRECTED_HDR {
                return Ok(&options[field::OPT_REDIRECTED_HDR_LEN..len])
            }
            options = &options[len..];
        }
        Err(Error::Truncated)
    }

    /// The length of a message emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        match self.message {
            Message::Redirect => {
                let option = field::OPT_REDIRECTED_HDR_LEN + self.quoted.buffer_len();
                field::REDIRECT_END + (option + 7) / 8 * 8
            },
            _ => field::HEADER_END + self.quoted.buffer_len(),
        }
    }

    /// Emit the message and fill in its checksum.
    pub fn emit<T>(&self, packet: &mut Packet<T>, pseudo: &PseudoHeader)
        where T: AsRef<[u8]> + AsMut<[u8]>
    {
        packet.set_msg_type(self.message);
        packet.set_msg_code(self.code);
        match self.message {
            Message::Redirect => {
                packet.set_data(0);
                let len = self.buffer_len();
                let target = self.target.unwrap_or(Ipv6Address::UNSPECIFIED);
                let data = packet.buffer.as_mut();
                data[field::REDIRECT_TARGET].copy_from_slice(target.as_bytes());
                data[field::REDIRECT_DEST].copy_from_slice(self.quoted.dst_addr.as_bytes());
                let option = &mut data[field::REDIRECT_END..len];
                for b in option.iter_mut() { *b = 0 }
                option[0] = field::OPT_REDIRECTED_HDR;
                option[1] = (option.len() / 8) as u8;
                self.quoted.emit(&mut option[field::OPT_REDIRECTED_HDR_LEN..]);
            },
            _ => {
                packet.set_data(self.info);
                let data = packet.buffer.as_mut();
                self.quoted.emit(&mut data[field::HEADER_END..]);
            },
        }
        packet.fill_checksum(pseudo)
    }
}

impl fmt::Display for ErrorRepr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message {
            Message::DstUnreachable =>
                write!(f, "ICMPv6 {} ({})", self.message, DstUnreachable::from(self.code))?,
            Message::PktTooBig =>
                write!(f, "ICMPv6 {} mtu={}", self.message, self.info)?,
            _ => write!(f, "ICMPv6 {} code={}", self.message, self.code)?,
        }
        write!(f, " for {}:{} -> {}:{}",
            self.quoted.src_addr, self.quoted.src_port,
            self.quoted.dst_addr, self.quoted.dst_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn router() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0xfe)
    }

    fn host() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)
    }

    fn quote() -> Quoted {
        Quoted {
            src_addr: host(),
            dst_addr: Ipv6Address::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 2),
            src_port: 40000,
            dst_port: 443,
            seq_number: SeqNumber(0x1234_5678),
        }
    }

    fn pseudo(len: usize) -> PseudoHeader {
        PseudoHeader::v6(router(), host(), Protocol::Icmpv6, len as u32)
    }

    #[test]
    fn too_big_roundtrip() {
        let repr = ErrorRepr {
            message: Message::PktTooBig,
            code: 0,
            info: 1280,
            target: None,
            quoted: quote(),
        };
        let mut bytes = vec![0xa5; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet, &pseudo(repr.buffer_len()));

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.data(), 1280);
        assert_eq!(ErrorRepr::parse(&packet, &pseudo(bytes.len())), Ok(repr));
    }

    #[test]
    fn redirect_roundtrip() {
        let repr = ErrorRepr {
            message: Message::Redirect,
            code: 0,
            info: 0,
            target: Some(Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 7)),
            quoted: quote(),
        };
        assert_eq!(repr.buffer_len(), 40 + 56);
        let mut bytes = vec![0; repr.buffer_len()];
        let len = bytes.len();
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]), &pseudo(len));
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.redirect_destination(), quote().dst_addr);
        assert_eq!(ErrorRepr::parse(&packet, &pseudo(bytes.len())), Ok(repr));
    }

    #[test]
    fn wrong_checksum() {
        let repr = ErrorRepr {
            message: Message::DstUnreachable,
            code: DstUnreachable::PortUnreachable.into(),
            info: 0,
            target: None,
            quoted: quote(),
        };
        let mut bytes = vec![0; repr.buffer_len()];
        let len = bytes.len();
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]), &pseudo(len));
        bytes[20] ^= 0x01;
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(ErrorRepr::parse(&packet, &pseudo(bytes.len())), Err(Error::WrongChecksum));
    }

    #[test]
    fn quote_skips_extension_headers() {
        let mut bytes = vec![0; 40 + 8 + 8 + 8];
        quote().emit(&mut bytes[..48]);
        // Rewrite as ip6 -> hop-by-hop -> fragment (offset 0) -> tcp.
        let tcp = bytes[40..48].to_vec();
        bytes[field::IPV6_NEXT_HEADER] = Protocol::HopByHop.into();
        bytes[40] = Protocol::Ipv6Frag.into();
        bytes[41] = 0;
        for b in bytes[42..48].iter_mut() { *b = 0 }
        bytes[48] = Protocol::Tcp.into();
        for b in bytes[49..56].iter_mut() { *b = 0 }
        bytes[56..64].copy_from_slice(&tcp);
        assert_eq!(Quoted::parse(&bytes), Ok(quote()));

        // A later fragment does not carry the ports.
        bytes[50] = 0x01;
        assert_eq!(Quoted::parse(&bytes), Err(Error::Unrecognized));
    }

    #[test]
    fn quote_truncated() {
        let mut bytes = vec![0; 48];
        quote().emit(&mut bytes);
        assert_eq!(Quoted::parse(&bytes[..44]), Err(Error::Truncated));
        assert_eq!(Quoted::parse(&bytes[..30]), Err(Error::Truncated));
    }

    #[test]
    fn informational() {
        assert!(Message::DstUnreachable.is_error());
        assert!(!Message::EchoRequest.is_error());
        let mut bytes = [0x80, 0, 0, 0, 0, 0, 0, 0];
        let pseudo = pseudo(bytes.len());
        Packet::new_unchecked(&mut bytes[..]).fill_checksum(&pseudo);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(ErrorRepr::parse(&packet, &pseudo), Err(Error::Unsupported));
    }
}
