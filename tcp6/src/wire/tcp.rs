//! The TCP header and its options.
//!
//! Beyond the options needed for the handshake (MSS, window scale, SACK permitted) this parses
//! and emits timestamps ([RFC 7323]) and the 16-octet segment signature ([RFC 2385]).
//!
//! [RFC 7323]: https://tools.ietf.org/html/rfc7323
//! [RFC 2385]: https://tools.ietf.org/html/rfc2385
use core::{i32, ops, cmp, fmt};
use core::ops::Range;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, PseudoHeader, Result};
use super::ip::checksum;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
/// Two numbers further apart than 2<sup>31</sup> compare in the opposite direction, as for any
/// other serial number arithmetic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    /// Reinterpret the unsigned wire value.
    pub const fn from_u32(value: u32) -> Self {
        SeqNumber(value as i32)
    }

    /// The unsigned wire value.
    pub const fn to_u32(self) -> u32 {
        self.0 as u32
    }

    /// The signed distance `self - other`.
    pub fn diff(self, other: SeqNumber) -> i32 {
        self.0.wrapping_sub(other.0)
    }

    /// Check `low <= self <= high` with the window starting at `low`.
    ///
    /// Unlike two separate comparisons this is well defined for any window of up to
    /// 2<sup>32</sup> - 1 numbers.
    pub fn is_between(self, low: SeqNumber, high: SeqNumber) -> bool {
        let offset = self.0.wrapping_sub(low.0) as u32;
        let width = high.0.wrapping_sub(low.0) as u32;
        offset <= width
    }

    /// The later of two sequence numbers.
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self < other { other } else { self }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u16);

/// The value of a timestamp option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    /// The sender's clock value.
    pub tsval: u32,
    /// The most recent clock value received from the peer.
    pub tsecr: u32,
}

/// A read/write wrapper around a Transmission Control Protocol segment buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const FLAGS:    Field = 12..14;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT:   Field = 18..20;

    pub(crate) fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub(crate) const FLG_FIN: u16 = 0x001;
    pub(crate) const FLG_SYN: u16 = 0x002;
    pub(crate) const FLG_RST: u16 = 0x004;
    pub(crate) const FLG_PSH: u16 = 0x008;
    pub(crate) const FLG_ACK: u16 = 0x010;
    pub(crate) const FLG_URG: u16 = 0x020;
    pub(crate) const FLG_ECE: u16 = 0x040;
    pub(crate) const FLG_CWR: u16 = 0x080;
    pub(crate) const FLG_NS:  u16 = 0x100;

    pub(crate) const OPT_END: u8 = 0x00;
    pub(crate) const OPT_NOP: u8 = 0x01;
    pub(crate) const OPT_MSS: u8 = 0x02;
    pub(crate) const OPT_WS:  u8 = 0x03;
    pub(crate) const OPT_SACKPERM: u8 = 0x04;
    pub(crate) const OPT_SACKRNG:  u8 = 0x05;
    pub(crate) const OPT_TSTAMP:   u8 = 0x08;
    pub(crate) const OPT_SIGNATURE: u8 = 0x13;

    pub(crate) const MAX_HEADER_LEN: usize = 60;
}

/// The octet length of a segment signature.
pub const SIGNATURE_LEN: usize = 16;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
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

    /// Ensure that no header accessor method will panic if called.
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length field has a value smaller
    /// than the minimal header length.
    ///
    /// The result of this check is invalidated by calling [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            Err(Error::Truncated)
        } else {
            let header_len = self.header_len() as usize;
            if len < header_len {
                Err(Error::Truncated)
            } else if header_len < field::URGENT.end {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_i32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_i32(&data[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        Flags(NetworkEndian::read_u16(&data[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    #[inline]
    pub fn urgent_at(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::URGENT])
    }

    /// Return the options.
    #[inline]
    pub fn options(&self) -> &[u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_ref();
        &data[field::OPTIONS(header_len)]
    }

    /// Return the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_ref();
        &data[header_len..]
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        self.payload().len() + self.flags().sequence_len()
    }

    /// Locate the octets of the signature option, relative to the start of the segment.
    ///
    /// Returns `Ok(None)` when the segment is not signed.
    pub fn signature_range(&self) -> Result<Option<Range<usize>>> {
        let mut options = self.options();
        let mut offset = field::URGENT.end;
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::Signature(_) => {
                    // Kind and length precede the digest.
                    let start = offset + 2;
                    return Ok(Some(start..start + SIGNATURE_LEN));
                },
                _ => (),
            }
            offset += options.len() - next_options.len();
            options = next_options;
        }
        Ok(None)
    }

    /// Validate the segment checksum.
    ///
    /// # Fuzzing
    /// This function always returns `true` when fuzzing.
    pub fn verify_checksum(&self, pseudo: &PseudoHeader) -> bool {
        if cfg!(fuzzing) { return true }

        let data = self.buffer.as_ref();
        checksum::transport(pseudo, data) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_i32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_i32(&mut data[field::ACK_NUM], value.0)
    }

    /// Set a combination of flags.
    #[inline]
    pub fn set_flags(&mut self, Flags(flags): Flags) {
        let data = self.buffer.as_mut();
        let field = NetworkEndian::read_u16(&data[field::FLAGS]) & !0xfff;
        NetworkEndian::write_u16(&mut data[field::FLAGS], field | (flags & 0x1ff))
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & !0xf000) | ((value as u16) / 4) << 12;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self, pseudo: &PseudoHeader) {
        self.set_checksum(0);
        let checksum = checksum::transport(pseudo, self.buffer.as_ref());
        self.set_checksum(checksum)
    }

    /// Return a mutable pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[field::OPTIONS(header_len)]
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }
}

impl Flags {
    /// Only FIN set.
    pub const FIN: Flags = Flags(field::FLG_FIN);
    /// Only SYN set.
    pub const SYN: Flags = Flags(field::FLG_SYN);
    /// Only RST set.
    pub const RST: Flags = Flags(field::FLG_RST);
    /// Only PSH set.
    pub const PSH: Flags = Flags(field::FLG_PSH);
    /// Only ACK set.
    pub const ACK: Flags = Flags(field::FLG_ACK);

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.0 & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Return the URG flag.
    #[inline]
    pub fn urg(&self) -> bool {
        self.0 & field::FLG_URG != 0
    }

    /// Return the ECE flag.
    #[inline]
    pub fn ece(&self) -> bool {
        self.0 & field::FLG_ECE != 0
    }

    /// Return the CWR flag.
    #[inline]
    pub fn cwr(&self) -> bool {
        self.0 & field::FLG_CWR != 0
    }

    /// Return the NS flag.
    #[inline]
    pub fn ns(&self) -> bool {
        self.0 & field::FLG_NS != 0
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        let flag = if value { field::FLG_FIN } else { 0 };
        let without = self.0 & !field::FLG_FIN;
        self.0 = without | flag;
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        let flag = if value { field::FLG_SYN } else { 0 };
        let without = self.0 & !field::FLG_SYN;
        self.0 = without | flag;
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        let flag = if value { field::FLG_RST } else { 0 };
        let without = self.0 & !field::FLG_RST;
        self.0 = without | flag;
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        let without = self.0 & !field::FLG_ACK;
        self.0 = without | flag;
    }

    /// Return the length of a control flag, in terms of sequence space.
    pub fn sequence_len(self) -> usize {
        (if self.syn() { 1 } else { 0 })
        + (if self.fin() { 1 }  else { 0 })
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackRange([Option<(u32, u32)>; 3]),
    Timestamp(Timestamp),
    Signature([u8; SIGNATURE_LEN]),
    Unknown { kind: u8, data: &'a [u8] }
}

impl<'a> TcpOption<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed)
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match (kind, length) {
                    (field::OPT_MSS, 4) =>
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_WS, 3) =>
                        option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKPERM, 2) =>
                        option = TcpOption::SackPermitted,
                    (field::OPT_SACKPERM, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_TSTAMP, 10) =>
                        option = TcpOption::Timestamp(Timestamp {
                            tsval: NetworkEndian::read_u32(&data[0..4]),
                            tsecr: NetworkEndian::read_u32(&data[4..8]),
                        }),
                    (field::OPT_TSTAMP, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SIGNATURE, 18) => {
                        let mut digest = [0; SIGNATURE_LEN];
                        digest.copy_from_slice(data);
                        option = TcpOption::Signature(digest);
                    },
                    (field::OPT_SIGNATURE, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKRNG, n) => {
                        if n < 10 || (n-2) % 8 != 0 {
                            return Err(Error::Malformed)
                        }
                        if n > 26 {
                            // RFC 2018: at most 4 blocks fit, with timestamps only 3.
                            net_debug!("sACK with >3 blocks, truncating to 3");
                        }
                        let mut sack_ranges: [Option<(u32, u32)>; 3] = [None; 3];
                        sack_ranges.iter_mut().enumerate().for_each(|(i, nmut)| {
                            let left = i * 8;
                            *nmut = if left < data.len() {
                                let mid = left + 4;
                                let right = mid + 4;
                                let range_left = NetworkEndian::read_u32(
                                    &data[left..mid]);
                                let range_right = NetworkEndian::read_u32(
                                    &data[mid..right]);
                                Some((range_left, range_right))
                            } else {
                                None
                            };
                        });
                        option = TcpOption::SackRange(sack_ranges);
                    },
                    (_, _) =>
                        option = TcpOption::Unknown { kind, data }
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(s) => s.iter().filter(|s| s.is_some()).count() * 8 + 2,
            TcpOption::Timestamp(_) => 10,
            TcpOption::Signature(_) => 2 + SIGNATURE_LEN,
            TcpOption::Unknown { data, .. } => 2 + data.len()
        }
    }

    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match self {
            TcpOption::EndOfList => {
                length    = buffer.len();
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
            }
            TcpOption::NoOperation => {
                length    = 1;
                buffer[0] = field::OPT_NOP;
            }
            TcpOption::MaxSegmentSize(value) => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_MSS;
                buffer[1] = length as u8;
                NetworkEndian::write_u16(&mut buffer[2..4], *value)
            }
            TcpOption::WindowScale(value) => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_WS;
                buffer[1] = length as u8;
                buffer[2] = *value;
            }
            TcpOption::SackPermitted => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_SACKPERM;
                buffer[1] = length as u8;
            }
            TcpOption::SackRange(slice) => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_SACKRNG;
                buffer[1] = length as u8;
                slice.iter().flatten().enumerate().for_each(|(i, &(first, second))| {
                    let pos = i * 8 + 2;
                    NetworkEndian::write_u32(&mut buffer[pos..pos+4], first);
                    NetworkEndian::write_u32(&mut buffer[pos+4..pos+8], second);
                });
            }
            TcpOption::Timestamp(ts) => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_TSTAMP;
                buffer[1] = length as u8;
                NetworkEndian::write_u32(&mut buffer[2..6], ts.tsval);
                NetworkEndian::write_u32(&mut buffer[6..10], ts.tsecr);
            }
            TcpOption::Signature(digest) => {
                length    = self.buffer_len();
                buffer[0] = field::OPT_SIGNATURE;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(digest);
            }
            TcpOption::Unknown { kind, data: provided } => {
                length    = self.buffer_len();
                buffer[0] = *kind;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(provided)
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a Transmission Control Protocol segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port:     u16,
    pub dst_port:     u16,
    pub flags:        Flags,
    pub seq_number:   SeqNumber,
    pub ack_number:   Option<SeqNumber>,
    pub window_len:   u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub sack_permitted: bool,
    pub sack_ranges:  [Option<(u32, u32)>; 3],
    pub timestamp:    Option<Timestamp>,
    /// The signature digest.
    ///
    /// When emitting, the value is written as is. Signing fills it in afterwards, see
    /// `layer::tcp::auth`.
    pub signature:    Option<[u8; SIGNATURE_LEN]>,
    pub payload_len:  u16,
}

impl Repr {
    /// Parse a Transmission Control Protocol segment and return a high-level representation.
    ///
    /// The checksum is not inspected here. It depends on the network layer and is validated by
    /// the caller with the matching pseudo header.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Repr> {
        packet.check_len()?;
        // Source and destination ports must be present.
        if packet.src_port() == 0 { return Err(Error::Malformed) }
        if packet.dst_port() == 0 { return Err(Error::Malformed) }

        let flags = packet.flags();
        if flags.syn() && flags.rst() {
            return Err(Error::Malformed)
        }

        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        // The PSH flag is ignored.
        // The URG flag and the urgent field is ignored.

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut options = packet.options();
        let mut sack_permitted = false;
        let mut sack_ranges = [None, None, None];
        let mut timestamp = None;
        let mut signature = None;
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) =>
                    max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 7323: a shift count above 14 is logged and used as 14.
                    window_scale = if value > 14 {
                        net_debug!("parsed window scaling factor {} >14, setting to 14", value);
                        Some(14)
                    } else {
                        Some(value)
                    };
                },
                TcpOption::SackPermitted =>
                    sack_permitted = true,
                TcpOption::SackRange(slice) =>
                    sack_ranges = slice,
                TcpOption::Timestamp(ts) =>
                    timestamp = Some(ts),
                TcpOption::Signature(digest) =>
                    signature = Some(digest),
                TcpOption::Unknown { .. } => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port:     packet.src_port(),
            dst_port:     packet.dst_port(),
            flags,
            seq_number:   packet.seq_number(),
            ack_number,
            window_len:   packet.window_len(),
            window_scale,
            max_seg_size,
            sack_permitted,
            sack_ranges,
            timestamp,
            signature,
            payload_len:  packet.payload().len() as u16,
        })
    }

    fn fixed_options_len(&self) -> usize {
        let mut length = 0;
        if self.max_seg_size.is_some() {
            length += 4
        }
        if self.window_scale.is_some() {
            length += 3
        }
        if self.sack_permitted {
            length += 2;
        }
        if self.timestamp.is_some() {
            length += 10;
        }
        if self.signature.is_some() {
            length += 2 + SIGNATURE_LEN;
        }
        length
    }

    /// The number of SACK blocks that will actually be emitted.
    ///
    /// Blocks are only sent on non-SYN segments and only as many as fit the option space.
    fn sack_blocks(&self) -> usize {
        if self.flags.syn() || self.ack_number.is_none() {
            return 0;
        }
        let wanted = self.sack_ranges.iter().filter(|s| s.is_some()).count();
        let space = field::MAX_HEADER_LEN - field::URGENT.end - self.fixed_options_len();
        let fitting = space.saturating_sub(2) / 8;
        wanted.min(fitting)
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    ///
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end + self.fixed_options_len();
        let blocks = self.sack_blocks();
        if blocks > 0 {
            length += blocks * 8 + 2;
        }
        if length % 4 != 0 {
            length += 4 - length % 4;
        }
        length
    }

    /// Return the length of a segment that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + usize::from(self.payload_len)
    }

    /// Emit a high-level representation into a Transmission Control Protocol segment.
    ///
    /// The checksum field is zeroed, the payload is not touched.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
        where T: AsRef<[u8]> + AsMut<[u8]>
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);
        packet.set_header_len(self.header_len() as u8);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        packet.set_flags(flags);
        packet.set_checksum(0);
        {
            let blocks = self.sack_blocks();
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                let tmp = options; options = TcpOption::MaxSegmentSize(value).emit(tmp);
            }
            if let Some(value) = self.window_scale {
                let tmp = options; options = TcpOption::WindowScale(value).emit(tmp);
            }
            if self.sack_permitted {
                let tmp = options; options = TcpOption::SackPermitted.emit(tmp);
            }
            if let Some(ts) = self.timestamp {
                let tmp = options; options = TcpOption::Timestamp(ts).emit(tmp);
            }
            if let Some(digest) = self.signature {
                let tmp = options; options = TcpOption::Signature(digest).emit(tmp);
            }
            if blocks > 0 {
                let mut ranges = [None; 3];
                self.sack_ranges.iter()
                    .flatten()
                    .take(blocks)
                    .zip(ranges.iter_mut())
                    .for_each(|(range, slot)| *slot = Some(*range));
                let tmp = options; options = TcpOption::SackRange(ranges).emit(tmp);
            }

            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.set_urgent_at(0);
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        usize::from(self.payload_len) + self.flags.sequence_len()
    }
}

impl Default for Repr {
    fn default() -> Self {
        Repr {
            src_port: 0,
            dst_port: 0,
            flags: Flags::default(),
            seq_number: SeqNumber::default(),
            ack_number: None,
            window_len: 0,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None; 3],
            timestamp: None,
            signature: None,
            payload_len: 0,
        }
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.syn() { write!(f, " syn")? }
        if self.fin() { write!(f, " fin")? }
        if self.rst() { write!(f, " rst")? }
        if self.psh() { write!(f, " psh")? }
        if self.urg() { write!(f, " urg")? }
        if self.ece() { write!(f, " ece")? }
        if self.cwr() { write!(f, " cwr")? }
        if self.ns()  { write!(f, " ns" )? }
        Ok(())
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={}{}", self.src_port, self.dst_port, self.flags)?;
        write!(f, " seq={}", self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        write!(f, " len={}", self.payload_len)?;
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={}", max_seg_size)?;
        }
        if let Some(scale) = self.window_scale {
            write!(f, " ws={}", scale)?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " ts={}/{}", ts.tsval, ts.tsecr)?;
        }
        if self.signature.is_some() {
            write!(f, " signed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::wire::{Ipv4Address, Ipv6Address, IpProtocol};
    use super::*;

    const SRC_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 1]);
    const DST_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 2]);

    static PACKET_BYTES: [u8; 28] =
        [0xbf, 0x00, 0x00, 0x50,
         0x01, 0x23, 0x45, 0x67,
         0x89, 0xab, 0xcd, 0xef,
         0x60, 0x35, 0x01, 0x23,
         0x01, 0xb6, 0x02, 0x01,
         0x03, 0x03, 0x0c, 0x01,
         0xaa, 0x00, 0x00, 0xff];

    static OPTION_BYTES: [u8; 4] =
        [0x03, 0x03, 0x0c, 0x01];

    static PAYLOAD_BYTES: [u8; 4] =
        [0xaa, 0x00, 0x00, 0xff];

    fn pseudo(len: usize) -> PseudoHeader {
        PseudoHeader::v4(SRC_ADDR, DST_ADDR, IpProtocol::Tcp, len as u32)
    }

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.ack_number(), SeqNumber(0x89abcdefu32 as i32));
        assert_eq!(packet.header_len(), 24);
        assert_eq!(packet.flags().fin(), true);
        assert_eq!(packet.flags().syn(), false);
        assert_eq!(packet.flags().rst(), true);
        assert_eq!(packet.flags().psh(), false);
        assert_eq!(packet.flags().ack(), true);
        assert_eq!(packet.flags().urg(), true);
        assert_eq!(packet.window_len(), 0x0123);
        assert_eq!(packet.urgent_at(), 0x0201);
        assert_eq!(packet.checksum(), 0x01b6);
        assert_eq!(packet.options(), &OPTION_BYTES[..]);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
        assert_eq!(packet.verify_checksum(&pseudo(PACKET_BYTES.len())), true);
    }

    #[test]
    fn test_construct() {
        let mut bytes = vec![0xa5; PACKET_BYTES.len()];
        let mut packet = Packet::new_unchecked(&mut bytes);
        packet.set_src_port(48896);
        packet.set_dst_port(80);
        packet.set_seq_number(SeqNumber(0x01234567));
        packet.set_ack_number(SeqNumber(0x89abcdefu32 as i32));
        packet.set_header_len(24);
        let mut flags = Flags::default();
        flags.set_fin(true);
        flags.set_syn(false);
        flags.set_rst(true);
        flags.set_ack(true);
        let flags = flags | Flags(field::FLG_URG);
        packet.set_flags(flags);
        packet.set_window_len(0x0123);
        packet.set_urgent_at(0x0201);
        packet.set_checksum(0xEEEE);
        packet.options_mut().copy_from_slice(&OPTION_BYTES[..]);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES[..]);
        packet.fill_checksum(&pseudo(PACKET_BYTES.len()));
        assert_eq!(&packet.into_inner()[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn test_truncated() {
        let packet = Packet::new_checked(&PACKET_BYTES[..23]);
        assert_eq!(packet, Err(Error::Truncated));
    }

    #[test]
    fn test_zero_port() {
        let mut bytes = PACKET_BYTES;
        bytes[0] = 0;
        bytes[1] = 0;
        let packet = Packet::new_unchecked(&bytes[..]);
        assert_eq!(Repr::parse(&packet), Err(Error::Malformed));
    }

    fn syn_repr() -> Repr {
        Repr {
            src_port: 4242,
            dst_port: 80,
            flags: Flags::SYN,
            seq_number: SeqNumber(100),
            max_seg_size: Some(1440),
            window_scale: Some(7),
            sack_permitted: true,
            timestamp: Some(Timestamp { tsval: 0xdead_beef, tsecr: 0 }),
            signature: Some([0x5a; SIGNATURE_LEN]),
            window_len: 65535,
            .. Repr::default()
        }
    }

    #[test]
    fn syn_options_roundtrip() {
        let repr = syn_repr();
        // 20 + 4 + 3 + 2 + 10 + 18 = 57, padded.
        assert_eq!(repr.header_len(), 60);
        let mut bytes = vec![0xff; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(&packet), Ok(repr));

        let range = packet.signature_range().unwrap().unwrap();
        assert_eq!(range, 41..57);
        assert_eq!(&bytes[range], &[0x5a; SIGNATURE_LEN]);
    }

    #[test]
    fn sack_blocks_fit_option_space() {
        let repr = Repr {
            src_port: 4242,
            dst_port: 80,
            flags: Flags::ACK,
            seq_number: SeqNumber(100),
            ack_number: Some(SeqNumber(1)),
            timestamp: Some(Timestamp::default()),
            signature: Some([0; SIGNATURE_LEN]),
            sack_ranges: [Some((1, 2)), Some((3, 4)), Some((5, 6))],
            .. Repr::default()
        };
        // 20 + 10 + 18 leaves room for a single block.
        assert_eq!(repr.header_len(), 60);
        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        let parsed = Repr::parse(&Packet::new_checked(&bytes[..]).unwrap()).unwrap();
        assert_eq!(parsed.sack_ranges, [Some((1, 2)), None, None]);
    }

    #[test]
    fn malformed_options() {
        assert_eq!(TcpOption::parse(&[0x08, 0x09, 0, 0, 0, 0, 0, 0, 0]), Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x13, 0x12, 0, 0]), Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0x22, 0x01]), Err(Error::Malformed));
    }

    #[test]
    fn checksum_v6() {
        let repr = Repr { signature: None, .. syn_repr() };
        let src = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let pseudo = PseudoHeader::v6(src, dst, IpProtocol::Tcp, repr.buffer_len() as u32);
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.fill_checksum(&pseudo);
        assert!(packet.verify_checksum(&pseudo));
        let swapped = PseudoHeader::v6(dst, src, IpProtocol::Tcp, repr.buffer_len() as u32 + 1);
        assert!(!packet.verify_checksum(&swapped));
    }

    #[test]
    fn sequence_wraparound() {
        let high = SeqNumber::from_u32(0xffff_fff0);
        let low = high + 0x20;
        assert_eq!(low.to_u32(), 0x10);
        assert!(low > high);
        assert_eq!(low.diff(high), 0x20);
        assert_eq!(high.diff(low), -0x20);
        assert!((high + 8).is_between(high, low));
        assert!(!(low + 1).is_between(high, low));
        assert_eq!(high.max(low), low);
    }
}
