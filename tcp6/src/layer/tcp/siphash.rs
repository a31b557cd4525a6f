//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) instead of appending the secret key to
//! the four tuple for hashing. Hash function SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
//!
//! The same keyed state also derives the per-peer timestamp offset and, with separate keys, the
//! SYN cookie MAC and the registry shard of a tuple.
use super::registry::FourTuple;
use crate::time::Instant;
use crate::wire::{Ipv6Address, TcpSeqNumber};

/// An initial sequence number generator based on SipHash-2-4.
///
/// > ISN = M + SipHash-2-4(secretkey, localip, localport, remoteip, remoteport)
///
/// `M` is a clock that ticks every 4 microseconds. All addresses are IPv6, IPv4 peers are hashed
/// in their mapped form which keeps the message layout fixed.
#[derive(Clone)]
pub(crate) struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// Create a generator from one of the namespace secrets.
    pub(crate) fn from_secret_key_bytes(bytes: [u8; 16]) -> Self {
        let [a0, a1, a2, a3, a4, a5, a6, a7, b0, b1, b2, b3, b4, b5, b6, b7] = bytes;
        let a = u64::from_le_bytes([a0, a1, a2, a3, a4, a5, a6, a7]);
        let b = u64::from_le_bytes([b0, b1, b2, b3, b4, b5, b6, b7]);
        IsnGenerator { keys: (a, b), }
    }

    /// Create a generator with a pre-defined key.
    #[cfg(test)]
    pub(crate) fn from_key(a: u64, b: u64) -> Self {
        IsnGenerator { keys: (a, b), }
    }

    /// Get the initial sequence number for a connection.
    ///
    /// The value advances by one every 4µs and changes completely when the secret is replaced.
    pub(crate) fn get_isn(&self, connection: &FourTuple, time: Instant) -> TcpSeqNumber {
        let num = self.tuple_hash(connection);
        let clock = (time.total_millis() as u64).wrapping_mul(250);
        TcpSeqNumber(num.wrapping_add(clock) as i32)
    }

    /// The offset added to our timestamp clock for a peer.
    ///
    /// Depends only on the address pair so that all connections to a peer share one clock, as
    /// required for PAWS across reincarnations.
    pub(crate) fn ts_offset(&self, local: &Ipv6Address, remote: &Ipv6Address) -> u32 {
        let (m0, m1) = Self::ipv6_to_messages(*local);
        let (m2, m3) = Self::ipv6_to_messages(*remote);
        self.hash(&[m0, m1, m2, m3]) as u32
    }

    fn tuple_hash(&self, connection: &FourTuple) -> u64 {
        let (m0, m1) = Self::ipv6_to_messages(connection.local);
        let (m2, m3) = Self::ipv6_to_messages(connection.remote);
        let p = u64::from(connection.local_port)
            | u64::from(connection.remote_port) << 16;
        self.hash(&[m0, m1, m2, m3, p])
    }

    /// Hash a sequence of full words.
    ///
    /// The message length in the last block counts octets, as if the words were a byte string.
    pub(crate) fn hash(&self, words: &[u64]) -> u64 {
        let mut state = State::init(self.keys.0, self.keys.1);
        for &m in words {
            state.absorb(m);
        }
        state.absorb(((words.len() * 8) as u64 & 0xff) << 56);
        state.finalize()
    }

    fn ipv6_to_messages(addr: Ipv6Address) -> (u64, u64) {
        let Ipv6Address([a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p]) = addr;
        let m0 = u64::from_be_bytes([a, b, c, d, e, f, g, h]);
        let m1 = u64::from_be_bytes([i, j, k, l, m, n, o, p]);
        (m0, m1)
    }

    /// Split an address into the two words used by `hash`.
    pub(crate) fn address_words(addr: &Ipv6Address) -> (u64, u64) {
        Self::ipv6_to_messages(*addr)
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    ///
    /// The length block is absorbed like any other word by `IsnGenerator::hash`.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    /// Do the finalization rounds.
    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// See the paper, Appendix A.
    #[test]
    fn manual_test_vectors() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    fn tuple() -> FourTuple {
        FourTuple {
            local: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            remote: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
            local_port: 80,
            remote_port: 40000,
        }
    }

    #[test]
    fn isn_advances_with_clock() {
        let gen = IsnGenerator::from_key(1, 2);
        let first = gen.get_isn(&tuple(), Instant::from_millis(0));
        let later = gen.get_isn(&tuple(), Instant::from_millis(1));
        assert_eq!(later.diff(first), 250);
    }

    #[test]
    fn isn_depends_on_tuple_and_key() {
        let gen = IsnGenerator::from_key(1, 2);
        let now = Instant::from_secs(10);
        let other = FourTuple { remote_port: 40001, .. tuple() };
        assert_ne!(gen.get_isn(&tuple(), now), gen.get_isn(&other, now));
        let rekeyed = IsnGenerator::from_key(3, 4);
        assert_ne!(gen.get_isn(&tuple(), now), rekeyed.get_isn(&tuple(), now));
    }

    #[test]
    fn ts_offset_is_per_peer() {
        let gen = IsnGenerator::from_secret_key_bytes([7; 16]);
        let t = tuple();
        assert_eq!(gen.ts_offset(&t.local, &t.remote), gen.ts_offset(&t.local, &t.remote));
        assert_ne!(gen.ts_offset(&t.local, &t.remote), gen.ts_offset(&t.remote, &t.local));
    }
}
