//! Segment signatures with per-peer keys.
//!
//! A signature option carries a 16 octet keyed digest over
//!
//! 1. the pseudo header of the segment (the IPv4 form for mapped flows),
//! 2. the TCP header with the checksum field and the digest octets zeroed,
//! 3. the payload.
//!
//! Keys are configured per socket or listener in a [`KeyTable`], each bound to a peer address
//! prefix and optionally to an L3 domain, identified by interface index.
//!
//! [`KeyTable`]: struct.KeyTable.html
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::layer::{Error, Result};
use crate::wire::{Ipv4Address, Ipv6Address, PseudoHeader, TcpPacket};
use crate::wire::tcp::SIGNATURE_LEN;

use super::provider::Hasher;

/// The longest key accepted.
pub const MAX_KEY_LEN: usize = 80;

/// Key material bound to a peer prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey {
    key: Vec<u8>,
    prefix: Ipv6Address,
    prefix_len: u8,
    l3index: Option<u32>,
}

/// Why an inbound segment failed authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthFailure {
    /// A key is configured for the peer but the segment is not signed.
    NotFound,
    /// The segment is signed but no key is configured for the peer.
    Unexpected,
    /// The signature does not match.
    Mismatch,
}

/// A set of keys, looked up by longest matching prefix.
#[derive(Debug)]
#[derive(Default)]
pub struct KeyTable {
    keys: RwLock<Vec<Arc<AuthKey>>>,
}

impl AuthKey {
    /// A key for peers in an IPv6 prefix.
    pub fn new(key: &[u8], prefix: Ipv6Address, prefix_len: u8) -> Result<Self> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::BadSize);
        }
        if prefix_len > 128 {
            return Err(Error::InvalidAddress);
        }
        Ok(AuthKey {
            key: key.to_vec(),
            prefix: prefix.mask(prefix_len),
            prefix_len,
            l3index: None,
        })
    }

    /// A key for IPv4 peers, which are stored as mapped addresses.
    pub fn for_ipv4(key: &[u8], prefix: Ipv4Address, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::InvalidAddress);
        }
        Self::new(key, Ipv6Address::from_mapped_ipv4(prefix), prefix_len + 96)
    }

    /// Restrict the key to segments of one L3 domain.
    pub fn with_l3index(self, l3index: u32) -> Self {
        AuthKey { l3index: Some(l3index), ..self }
    }

    /// The key material.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The peer prefix and its length.
    pub fn prefix(&self) -> (Ipv6Address, u8) {
        (self.prefix, self.prefix_len)
    }

    /// The L3 domain the key is restricted to.
    pub fn l3index(&self) -> Option<u32> {
        self.l3index
    }

    fn matches(&self, addr: &Ipv6Address, l3index: Option<u32>) -> bool {
        if self.l3index.is_some() && self.l3index != l3index {
            return false;
        }
        addr.prefix_matches(&self.prefix, self.prefix_len)
    }

    fn same_binding(&self, other: &AuthKey) -> bool {
        self.prefix == other.prefix
            && self.prefix_len == other.prefix_len
            && self.l3index == other.l3index
    }
}

// Never print key material.
impl core::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "AuthKey({}/{}", self.prefix, self.prefix_len)?;
        if let Some(l3) = self.l3index {
            write!(f, " l3={}", l3)?;
        }
        write!(f, ")")
    }
}

impl KeyTable {
    /// An empty table.
    pub fn new() -> Self {
        KeyTable::default()
    }

    /// Add a key, replacing one with the same prefix and L3 domain.
    pub fn add(&self, key: AuthKey) {
        let mut keys = self.keys.write();
        keys.retain(|existing| !existing.same_binding(&key));
        keys.push(Arc::new(key));
    }

    /// Remove the key of a prefix and L3 domain.
    pub fn remove(&self, prefix: Ipv6Address, prefix_len: u8, l3index: Option<u32>) -> Result<()> {
        let probe = AuthKey {
            key: Vec::new(),
            prefix: prefix.mask(prefix_len),
            prefix_len,
            l3index,
        };
        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|existing| !existing.same_binding(&probe));
        if keys.len() == before {
            Err(Error::NotFound)
        } else {
            Ok(())
        }
    }

    /// Find the key for a peer.
    ///
    /// The longest prefix wins, a key bound to the L3 domain beats an unbound one of the same
    /// length.
    pub fn lookup(&self, peer: &Ipv6Address, l3index: Option<u32>) -> Option<Arc<AuthKey>> {
        let keys = self.keys.read();
        keys.iter()
            .filter(|key| key.matches(peer, l3index))
            .max_by_key(|key| (key.prefix_len, key.l3index.is_some()))
            .cloned()
    }

    /// Whether any key is configured.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

/// Compute the signature of a segment.
///
/// The segment must be well formed. Its checksum and any present signature octets are ignored.
pub fn sign(hasher: &dyn Hasher, key: &AuthKey, pseudo: &PseudoHeader, segment: &[u8])
    -> Result<[u8; SIGNATURE_LEN]>
{
    let packet = TcpPacket::new_checked(segment)?;
    let header_len = usize::from(packet.header_len());
    let signature = packet.signature_range()?;

    let mut pseudo_bytes = [0; PseudoHeader::MAX_LEN];
    let pseudo_len = pseudo.emit(&mut pseudo_bytes);

    let mut header = [0; 60];
    let header = &mut header[..header_len];
    header.copy_from_slice(&segment[..header_len]);
    // The checksum field.
    header[16] = 0;
    header[17] = 0;
    if let Some(range) = signature {
        for b in header[range].iter_mut() {
            *b = 0;
        }
    }

    Ok(hasher.keyed_hash(&key.key, &[
        &pseudo_bytes[..pseudo_len],
        &*header,
        &segment[header_len..],
    ]))
}

/// Check the signature carried in a segment.
///
/// Returns `false` for segments without signature option.
pub fn verify(hasher: &dyn Hasher, key: &AuthKey, pseudo: &PseudoHeader, segment: &[u8]) -> bool {
    let carried = match carried(segment) {
        Some(digest) => digest,
        None => return false,
    };
    match sign(hasher, key, pseudo, segment) {
        Ok(expected) => constant_time_eq(&expected, &carried),
        Err(_) => false,
    }
}

/// Decide whether an inbound segment passes authentication.
///
/// `keys` are those of the socket or listener the segment was matched to.
pub fn inbound(
    hasher: &dyn Hasher,
    keys: Option<&KeyTable>,
    peer: &Ipv6Address,
    l3index: Option<u32>,
    pseudo: &PseudoHeader,
    segment: &[u8],
) -> core::result::Result<(), AuthFailure> {
    let key = keys.and_then(|keys| keys.lookup(peer, l3index));
    check(hasher, key.as_deref(), pseudo, segment)
}

/// Decide whether an inbound segment passes authentication with an already selected key.
pub fn check(
    hasher: &dyn Hasher,
    key: Option<&AuthKey>,
    pseudo: &PseudoHeader,
    segment: &[u8],
) -> core::result::Result<(), AuthFailure> {
    let signed = carried(segment).is_some();
    match (key, signed) {
        (None, false) => Ok(()),
        (Some(_), false) => Err(AuthFailure::NotFound),
        (None, true) => Err(AuthFailure::Unexpected),
        (Some(key), true) => if verify(hasher, key, pseudo, segment) {
            Ok(())
        } else {
            Err(AuthFailure::Mismatch)
        },
    }
}

/// Write the signature into a segment that reserved space for it.
pub(crate) fn fill(hasher: &dyn Hasher, key: &AuthKey, pseudo: &PseudoHeader, segment: &mut [u8])
    -> Result<()>
{
    let digest = sign(hasher, key, pseudo, segment)?;
    let range = TcpPacket::new_unchecked(&*segment)
        .signature_range()?
        .ok_or(Error::Illegal)?;
    segment[range].copy_from_slice(&digest);
    Ok(())
}

fn carried(segment: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
    let packet = TcpPacket::new_checked(segment).ok()?;
    let range = packet.signature_range().ok()??;
    let mut digest = [0; SIGNATURE_LEN];
    digest.copy_from_slice(&segment[range]);
    Some(digest)
}

fn constant_time_eq(a: &[u8; SIGNATURE_LEN], b: &[u8; SIGNATURE_LEN]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use crate::wire::{IpProtocol, TcpFlags, TcpRepr, TcpSeqNumber};
    use super::super::provider::Blake2Hasher;
    use super::*;

    fn local() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)
    }

    fn peer() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)
    }

    fn segment(signed: bool) -> (PseudoHeader, Vec<u8>) {
        let repr = TcpRepr {
            src_port: 179,
            dst_port: 40000,
            flags: TcpFlags::ACK,
            seq_number: TcpSeqNumber(1000),
            ack_number: Some(TcpSeqNumber(2000)),
            window_len: 1024,
            signature: if signed { Some([0; SIGNATURE_LEN]) } else { None },
            payload_len: 4,
            .. TcpRepr::default()
        };
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(b"open");
        let pseudo = PseudoHeader::v6(local(), peer(), IpProtocol::Tcp, bytes.len() as u32);
        (pseudo, bytes)
    }

    fn signed_with(key: &AuthKey) -> (PseudoHeader, Vec<u8>) {
        let (pseudo, mut bytes) = segment(true);
        fill(&Blake2Hasher, key, &pseudo, &mut bytes).unwrap();
        (pseudo, bytes)
    }

    #[test]
    fn sign_verify() {
        let key = AuthKey::new(b"bgp-peer-secret", peer(), 128).unwrap();
        let other = AuthKey::new(b"bgp-peer-secreT", peer(), 128).unwrap();
        let (pseudo, bytes) = signed_with(&key);
        assert!(verify(&Blake2Hasher, &key, &pseudo, &bytes));
        assert!(!verify(&Blake2Hasher, &other, &pseudo, &bytes));
    }

    #[test]
    fn checksum_does_not_matter() {
        let key = AuthKey::new(b"k", peer(), 128).unwrap();
        let (pseudo, mut bytes) = signed_with(&key);
        TcpPacket::new_unchecked(&mut bytes[..]).fill_checksum(&pseudo);
        assert!(verify(&Blake2Hasher, &key, &pseudo, &bytes));
    }

    #[test]
    fn covers_payload_and_pseudo_header() {
        let key = AuthKey::new(b"k", peer(), 128).unwrap();
        let (pseudo, mut bytes) = signed_with(&key);
        let other_pseudo = PseudoHeader::v6(local(), local(), IpProtocol::Tcp, bytes.len() as u32);
        assert!(!verify(&Blake2Hasher, &key, &other_pseudo, &bytes));
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;
        assert!(!verify(&Blake2Hasher, &key, &pseudo, &bytes));
    }

    #[test]
    fn inbound_verdicts() {
        let keys = KeyTable::new();
        let key = AuthKey::new(b"k", peer(), 64).unwrap();
        let (pseudo, plain) = segment(false);
        let (_, signed) = signed_with(&key);
        let hasher = &Blake2Hasher;

        assert_eq!(inbound(hasher, Some(&keys), &peer(), None, &pseudo, &plain), Ok(()));
        assert_eq!(inbound(hasher, None, &peer(), None, &pseudo, &signed),
            Err(AuthFailure::Unexpected));

        keys.add(key);
        assert_eq!(inbound(hasher, Some(&keys), &peer(), None, &pseudo, &plain),
            Err(AuthFailure::NotFound));
        assert_eq!(inbound(hasher, Some(&keys), &peer(), None, &pseudo, &signed), Ok(()));

        keys.add(AuthKey::new(b"other", peer(), 64).unwrap());
        assert_eq!(inbound(hasher, Some(&keys), &peer(), None, &pseudo, &signed),
            Err(AuthFailure::Mismatch));
    }

    #[test]
    fn longest_prefix_and_l3() {
        let keys = KeyTable::new();
        keys.add(AuthKey::new(b"wide", peer(), 32).unwrap());
        keys.add(AuthKey::new(b"narrow", peer(), 120).unwrap());
        keys.add(AuthKey::new(b"vrf", peer(), 120).unwrap().with_l3index(7));
        assert_eq!(keys.lookup(&peer(), None).unwrap().key(), b"narrow");
        assert_eq!(keys.lookup(&peer(), Some(7)).unwrap().key(), b"vrf");
        assert_eq!(keys.lookup(&peer(), Some(8)).unwrap().key(), b"narrow");
        let far = Ipv6Address::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 2);
        assert_eq!(keys.lookup(&far, None).unwrap().key(), b"wide");

        assert_eq!(keys.remove(peer(), 120, None), Ok(()));
        assert_eq!(keys.remove(peer(), 120, None), Err(Error::NotFound));
        assert_eq!(keys.lookup(&peer(), None).unwrap().key(), b"wide");
    }

    #[test]
    fn ipv4_keys_are_mapped() {
        let keys = KeyTable::new();
        keys.add(AuthKey::for_ipv4(b"v4", Ipv4Address::new(192, 0, 2, 0), 24).unwrap());
        let mapped = Ipv6Address::from_mapped_ipv4(Ipv4Address::new(192, 0, 2, 77));
        assert_eq!(keys.lookup(&mapped, None).unwrap().prefix().1, 120);
        let outside = Ipv6Address::from_mapped_ipv4(Ipv4Address::new(192, 0, 3, 77));
        assert!(keys.lookup(&outside, None).is_none());
    }

    #[test]
    fn key_length_limits() {
        assert_eq!(AuthKey::new(&[], peer(), 128).err(), Some(Error::BadSize));
        assert_eq!(AuthKey::new(&[0; 81], peer(), 128).err(), Some(Error::BadSize));
        assert!(AuthKey::new(&[0; 80], peer(), 128).is_ok());
        assert_eq!(AuthKey::for_ipv4(b"k", Ipv4Address::LOOPBACK, 33).err(),
            Some(Error::InvalidAddress));
    }
}
