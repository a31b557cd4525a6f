/*! Low-level segment access and construction.

The `wire` module deals with the packet *representation*. As elsewhere it provides two levels of
functionality:

 * Accessors that extract fields from and insert fields into sequences of octets, the `Packet`
   structures such as [`TcpPacket`].
 * A compact, high-level representation of header data that can be created from parsing and
   emitted into a sequence of octets, the `Repr` structures such as [`TcpRepr`].

[`TcpPacket`]: struct.TcpPacket.html
[`TcpRepr`]: struct.TcpRepr.html

The `Packet` family guarantees that, if `Packet::new_checked` returned successfully, no field
accessor or setter will panic as long as the header length is not modified. The `Repr::parse`
method never panics and `Repr::emit` never panics as long as the buffer is at least
`Repr::header_len()` octets long.

IP headers are never constructed here. The network layer is someone else's business, we
only need its addresses for the checksum pseudo header and the header quoted in ICMPv6 errors.
*/
#![allow(missing_docs)]

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

mod error;
pub mod icmpv6;
pub mod ip;
pub mod tcp;

pub use self::error::{
    Error,
    Result};

pub use self::ip::{
    Ipv4Address,
    Ipv6Address,
    Protocol as IpProtocol,
    PseudoHeader};

pub use self::tcp::{
    Flags as TcpFlags,
    Packet as TcpPacket,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    TcpOption,
    Timestamp as TcpTimestamp};

pub use self::icmpv6::{
    DstUnreachable as Icmpv6DstUnreachable,
    Message as Icmpv6Message,
    Packet as Icmpv6Packet,
    ErrorRepr as Icmpv6ErrorRepr,
    Quoted as Icmpv6Quoted};
