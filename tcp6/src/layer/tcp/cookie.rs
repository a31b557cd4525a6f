//! Stateless SYN cookies.
//!
//! When the request table of a listener overflows the SYN-ACK carries all state we need later in
//! its initial sequence number. The 32 bits are laid out as
//!
//! ```text
//!  31    28 27   25 24     21 20                         0
//! +--------+-------+---------+----------------------------+
//! |  slot  |  mss  | wscale  |            mac             |
//! +--------+-------+---------+----------------------------+
//! ```
//!
//! The slot is the low nibble of a counter of 64 second periods. A cookie is accepted in the slot
//! it was created in and the following one. The mss is an index into a fixed table of common
//! segment sizes, a window scale of 15 marks a peer that did not offer scaling. The mac is keyed
//! SipHash over the tuple, the client's initial sequence number, the full counter and the encoded
//! options, truncated to 21 bits.
use crate::time::Instant;
use crate::wire::TcpSeqNumber;

use super::registry::FourTuple;
use super::siphash::IsnGenerator;

/// Segment sizes that can be encoded in a cookie, ascending.
pub const MSS_TABLE: [u16; 8] = [536, 1220, 1280, 1360, 1400, 1420, 1440, 8940];

const SLOT_SECS: i64 = 64;
/// Slots a cookie stays valid, including the one it was created in.
const MAX_AGE: u64 = 2;
const NO_WSCALE: u32 = 15;
const MAC_MASK: u32 = 0x1f_ffff;

/// The options recovered from a valid cookie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieOptions {
    /// The segment size, rounded down to a table value.
    pub mss: u16,
    /// The peer's window scale, if it offered one.
    pub wscale: Option<u8>,
}

/// Encoder and verifier of SYN cookies with a namespace secret.
#[derive(Clone)]
pub struct SynCookies {
    mac: IsnGenerator,
}

impl SynCookies {
    /// Create the cookie generator from its secret.
    pub fn new(secret: [u8; 16]) -> Self {
        SynCookies { mac: IsnGenerator::from_secret_key_bytes(secret) }
    }

    /// The window in which cookie ACKs are checked after an overflow.
    pub fn validity() -> crate::time::Duration {
        crate::time::Duration::from_secs((SLOT_SECS as u64) * MAX_AGE)
    }

    /// Choose the table index for a peer's segment size.
    pub fn mss_index(mss: u16) -> usize {
        MSS_TABLE.iter()
            .rposition(|&entry| entry <= mss)
            .unwrap_or(0)
    }

    /// Encode the cookie answering a SYN with `client_isn`.
    pub fn encode(
        &self,
        tuple: &FourTuple,
        client_isn: TcpSeqNumber,
        options: CookieOptions,
        now: Instant,
    ) -> TcpSeqNumber {
        let counter = Self::counter(now);
        let mss = Self::mss_index(options.mss) as u32;
        let wscale = options.wscale.map(|w| u32::from(w.min(14))).unwrap_or(NO_WSCALE);
        let mac = self.mac(tuple, client_isn, counter, mss, wscale);
        let cookie = ((counter as u32) & 0xf) << 28
            | mss << 25
            | wscale << 21
            | mac;
        TcpSeqNumber::from_u32(cookie)
    }

    /// Verify a cookie and recover the options.
    ///
    /// The `cookie` is the acknowledgment number minus one and `client_isn` the sequence number of
    /// the acknowledging segment minus one.
    pub fn decode(
        &self,
        tuple: &FourTuple,
        client_isn: TcpSeqNumber,
        cookie: TcpSeqNumber,
        now: Instant,
    ) -> Option<CookieOptions> {
        let cookie = cookie.to_u32();
        let current = Self::counter(now);
        let slot = u64::from(cookie >> 28);
        let age = current.wrapping_sub(slot) & 0xf;
        if age >= MAX_AGE {
            return None;
        }
        let counter = current.checked_sub(age)?;

        let mss = (cookie >> 25) & 0x7;
        let wscale = (cookie >> 21) & 0xf;
        if wscale != NO_WSCALE && wscale > 14 {
            return None;
        }
        if self.mac(tuple, client_isn, counter, mss, wscale) != cookie & MAC_MASK {
            return None;
        }

        Some(CookieOptions {
            mss: MSS_TABLE[mss as usize],
            wscale: if wscale == NO_WSCALE { None } else { Some(wscale as u8) },
        })
    }

    fn counter(now: Instant) -> u64 {
        (now.total_millis().max(0) / 1000 / SLOT_SECS) as u64
    }

    fn mac(&self, tuple: &FourTuple, isn: TcpSeqNumber, counter: u64, mss: u32, wscale: u32) -> u32 {
        let (l0, l1) = IsnGenerator::address_words(&tuple.local);
        let (r0, r1) = IsnGenerator::address_words(&tuple.remote);
        let ports = u64::from(tuple.local_port)
            | u64::from(tuple.remote_port) << 16
            | u64::from(isn.to_u32()) << 32;
        let options = u64::from(mss) << 8 | u64::from(wscale);
        (self.mac.hash(&[l0, l1, r0, r1, ports, counter, options]) as u32) & MAC_MASK
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::Ipv6Address;
    use super::*;

    fn tuple() -> FourTuple {
        FourTuple {
            local: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            remote: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
            local_port: 443,
            remote_port: 51000,
        }
    }

    #[test]
    fn roundtrip() {
        let cookies = SynCookies::new([0x42; 16]);
        let now = Instant::from_secs(1_000);
        for &mss in MSS_TABLE.iter() {
            for &wscale in [None, Some(0), Some(7), Some(14)].iter() {
                let options = CookieOptions { mss, wscale };
                let isn = TcpSeqNumber(12345);
                let cookie = cookies.encode(&tuple(), isn, options, now);
                assert_eq!(cookies.decode(&tuple(), isn, cookie, now), Some(options));
            }
        }
    }

    #[test]
    fn mss_rounds_down() {
        assert_eq!(SynCookies::mss_index(100), 0);
        assert_eq!(SynCookies::mss_index(1440), 6);
        assert_eq!(SynCookies::mss_index(1460), 6);
        assert_eq!(SynCookies::mss_index(9000), 7);
    }

    #[test]
    fn single_bit_corruption() {
        let cookies = SynCookies::new([0x17; 16]);
        let now = Instant::from_secs(77_777);
        let isn = TcpSeqNumber(-5);
        let options = CookieOptions { mss: 1440, wscale: Some(7) };
        let cookie = cookies.encode(&tuple(), isn, options, now);
        for bit in 0..32 {
            let corrupt = TcpSeqNumber::from_u32(cookie.to_u32() ^ (1 << bit));
            assert_eq!(cookies.decode(&tuple(), isn, corrupt, now), None, "bit {}", bit);
        }
        // The client sequence number and the tuple are covered as well.
        assert_eq!(cookies.decode(&tuple(), isn + 1, cookie, now), None);
        let other = FourTuple { remote_port: 51001, .. tuple() };
        assert_eq!(cookies.decode(&other, isn, cookie, now), None);
    }

    #[test]
    fn expires_after_two_slots() {
        let cookies = SynCookies::new([1; 16]);
        let created = Instant::from_secs(64 * 100 + 10);
        let isn = TcpSeqNumber(1);
        let options = CookieOptions { mss: 536, wscale: None };
        let cookie = cookies.encode(&tuple(), isn, options, created);
        assert!(cookies.decode(&tuple(), isn, cookie, Instant::from_secs(64 * 101 + 63)).is_some());
        assert!(cookies.decode(&tuple(), isn, cookie, Instant::from_secs(64 * 102)).is_none());
        let other = SynCookies::new([2; 16]);
        assert!(other.decode(&tuple(), isn, cookie, created).is_none());
    }
}
