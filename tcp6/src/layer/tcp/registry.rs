//! The connection tables of a namespace.
//!
//! Two tables exist. Listeners are found by local port and address, with specific binds taking
//! precedence over wildcard binds. Everything else, half-open requests, full connections and
//! time-wait records, is found by its exact four tuple. There is at most one record per tuple.
//!
//! The tables only hold weak references. The owner of a record (the user for sockets and
//! listeners, the time-wait table for its entries) keeps it alive and removes the record before
//! dropping it. Sockets dropped while registered leave a dead reference that the namespace removes
//! on its next call. Until then it behaves as if the record was absent.
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::RangeInclusive;

use spin::RwLock;

use crate::layer::{Error, Result};
use crate::wire::Ipv6Address;

use super::connection::Socket;
use super::listener::Listener;
use super::mapped::MAPPED_ANY;
use super::siphash::IsnGenerator;
use super::timewait::TimeWaitEntry;

/// The identifying addresses and ports of a connection, from the local point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    /// Our address.
    pub local: Ipv6Address,
    /// The address of the peer.
    pub remote: Ipv6Address,
    /// Our port.
    pub local_port: u16,
    /// The port of the peer.
    pub remote_port: u16,
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]:{} <-> [{}]:{}",
            self.local, self.local_port, self.remote, self.remote_port)
    }
}

/// A weak reference to the record of a tuple.
#[derive(Clone)]
pub(crate) enum Record {
    /// A half-open request, stored in its listener.
    Request(Weak<Listener>),
    /// A full connection.
    Connection(Weak<Socket>),
    /// A time-wait entry.
    TimeWait(Weak<TimeWaitEntry>),
}

/// A live record found in the table.
#[derive(Clone)]
pub(crate) enum Lookup {
    Request(Arc<Listener>),
    Connection(Arc<Socket>),
    TimeWait(Arc<TimeWaitEntry>),
}

struct Entry {
    record: Record,
    iface: Option<u32>,
}

struct Binding {
    addr: Ipv6Address,
    iface: Option<u32>,
    v6only: bool,
    listener: Weak<Listener>,
}

const SHARDS: usize = 16;

/// The sharded lookup tables.
pub(crate) struct Registry {
    shards: Vec<RwLock<BTreeMap<FourTuple, Entry>>>,
    listeners: RwLock<BTreeMap<u16, Vec<Binding>>>,
    hash: IsnGenerator,
}

impl Record {
    pub(crate) fn upgrade(&self) -> Option<Lookup> {
        match self {
            Record::Request(weak) => weak.upgrade().map(Lookup::Request),
            Record::Connection(weak) => weak.upgrade().map(Lookup::Connection),
            Record::TimeWait(weak) => weak.upgrade().map(Lookup::TimeWait),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Record::Request(weak) => weak.strong_count() > 0,
            Record::Connection(weak) => weak.strong_count() > 0,
            Record::TimeWait(weak) => weak.strong_count() > 0,
        }
    }

    /// Whether both refer to the same object.
    fn same(&self, other: &Record) -> bool {
        match (self, other) {
            (Record::Request(a), Record::Request(b)) => Weak::ptr_eq(a, b),
            (Record::Connection(a), Record::Connection(b)) => Weak::ptr_eq(a, b),
            (Record::TimeWait(a), Record::TimeWait(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Registry {
    pub(crate) fn new(hash: IsnGenerator) -> Self {
        Registry {
            shards: (0..SHARDS).map(|_| RwLock::new(BTreeMap::new())).collect(),
            listeners: RwLock::new(BTreeMap::new()),
            hash,
        }
    }

    fn shard(&self, tuple: &FourTuple) -> &RwLock<BTreeMap<FourTuple, Entry>> {
        let (l0, l1) = IsnGenerator::address_words(&tuple.local);
        let (r0, r1) = IsnGenerator::address_words(&tuple.remote);
        let ports = u64::from(tuple.local_port) | u64::from(tuple.remote_port) << 16;
        let hash = self.hash.hash(&[l0, l1, r0, r1, ports]);
        &self.shards[(hash % SHARDS as u64) as usize]
    }

    /// Find the record of a tuple.
    ///
    /// Records bound to an interface only match segments of that interface.
    pub(crate) fn lookup_established(&self, tuple: &FourTuple, iface: Option<u32>) -> Option<Lookup> {
        let shard = self.shard(tuple).read();
        let entry = shard.get(tuple)?;
        if entry.iface.is_some() && entry.iface != iface {
            return None;
        }
        entry.record.upgrade()
    }

    /// Publish a record, failing if a live one exists for the tuple.
    pub(crate) fn insert(&self, tuple: FourTuple, record: Record, iface: Option<u32>) -> Result<()> {
        let mut shard = self.shard(&tuple).write();
        if let Some(existing) = shard.get(&tuple) {
            if existing.record.is_live() {
                return Err(Error::AddressInUse);
            }
        }
        shard.insert(tuple, Entry { record, iface });
        Ok(())
    }

    /// Remove the record of a tuple if it is still the given one.
    pub(crate) fn remove(&self, tuple: &FourTuple, record: &Record) -> bool {
        let mut shard = self.shard(tuple).write();
        match shard.get(tuple) {
            Some(entry) if entry.record.same(record) => {
                shard.remove(tuple);
                true
            },
            _ => false,
        }
    }

    /// Remove the record of a tuple if its owner is gone.
    pub(crate) fn remove_dead(&self, tuple: &FourTuple) -> bool {
        let mut shard = self.shard(tuple).write();
        match shard.get(tuple) {
            Some(entry) if !entry.record.is_live() => {
                shard.remove(tuple);
                true
            },
            _ => false,
        }
    }

    /// Atomically exchange the record of a tuple, if it is still `old`.
    pub(crate) fn replace(&self, tuple: &FourTuple, old: &Record, new: Record) -> bool {
        let mut shard = self.shard(tuple).write();
        match shard.get_mut(tuple) {
            Some(entry) if entry.record.same(old) => {
                entry.record = new;
                true
            },
            _ => false,
        }
    }

    /// Publish a connection on a free port of `range`.
    ///
    /// The search starts at an offset that should depend on the remote endpoint. Ports with a
    /// listener are skipped.
    pub(crate) fn insert_ephemeral(
        &self,
        mut tuple: FourTuple,
        range: &RangeInclusive<u16>,
        offset: u32,
        record: &Record,
        iface: Option<u32>,
    ) -> Result<FourTuple> {
        let start = u32::from(*range.start());
        let count = u32::from(*range.end()).saturating_sub(start) + 1;
        for i in 0..count {
            let port = (start + offset.wrapping_add(i) % count) as u16;
            if self.has_listener(port) {
                continue;
            }
            tuple.local_port = port;
            if self.insert(tuple, record.clone(), iface).is_ok() {
                return Ok(tuple);
            }
        }
        Err(Error::Exhausted)
    }

    /// Bind a listener, failing if a live one has the same address, port and interface.
    pub(crate) fn bind_listener(
        &self,
        addr: Ipv6Address,
        port: u16,
        iface: Option<u32>,
        v6only: bool,
        listener: Weak<Listener>,
    ) -> Result<()> {
        let mut listeners = self.listeners.write();
        let bindings = listeners.entry(port).or_insert_with(Vec::new);
        bindings.retain(|binding| binding.listener.strong_count() > 0);
        if bindings.iter().any(|binding| binding.addr == addr && binding.iface == iface) {
            return Err(Error::AddressInUse);
        }
        bindings.push(Binding { addr, iface, v6only, listener });
        Ok(())
    }

    pub(crate) fn unbind_listener(&self, port: u16, listener: &Weak<Listener>) {
        let mut listeners = self.listeners.write();
        if let Some(bindings) = listeners.get_mut(&port) {
            bindings.retain(|binding| !Weak::ptr_eq(&binding.listener, listener));
            if bindings.is_empty() {
                listeners.remove(&port);
            }
        }
    }

    /// Find the best listener for a segment to `local`.
    ///
    /// An exact address beats a wildcard, a listener bound to the interface beats an unbound one.
    /// The IPv4 wildcard only matches mapped addresses, the IPv6 wildcard matches them unless the
    /// listener is IPv6 only.
    pub(crate) fn lookup_listener(&self, local: &Ipv6Address, port: u16, iface: Option<u32>)
        -> Option<Arc<Listener>>
    {
        let listeners = self.listeners.read();
        listeners.get(&port)?
            .iter()
            .filter_map(|binding| Some((Self::score(binding, local, iface)?, binding)))
            .filter(|(_, binding)| binding.listener.strong_count() > 0)
            .max_by_key(|(score, _)| *score)
            .and_then(|(_, binding)| binding.listener.upgrade())
    }

    fn score(binding: &Binding, local: &Ipv6Address, iface: Option<u32>) -> Option<u8> {
        if binding.iface.is_some() && binding.iface != iface {
            return None;
        }
        let mapped = local.is_ipv4_mapped();
        let address = if binding.addr == *local {
            2
        } else if binding.addr.is_unspecified() && !(mapped && binding.v6only) {
            0
        } else if binding.addr == MAPPED_ANY && mapped {
            1
        } else {
            return None;
        };
        Some(address * 2 + binding.iface.is_some() as u8)
    }

    pub(crate) fn has_listener(&self, port: u16) -> bool {
        let listeners = self.listeners.read();
        listeners.get(&port)
            .map(|bindings| bindings.iter().any(|b| b.listener.strong_count() > 0))
            .unwrap_or(false)
    }

    /// All live records.
    pub(crate) fn records(&self) -> Vec<(FourTuple, Lookup)> {
        let mut records = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            records.extend(shard.iter()
                .filter_map(|(tuple, entry)| Some((*tuple, entry.record.upgrade()?))));
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// All live listeners.
    pub(crate) fn listeners(&self) -> Vec<Arc<Listener>> {
        let listeners = self.listeners.read();
        listeners.values()
            .flat_map(|bindings| bindings.iter())
            .filter_map(|binding| binding.listener.upgrade())
            .collect()
    }

    /// Forget everything.
    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
        self.listeners.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use crate::wire::Ipv4Address;
    use super::super::auth::KeyTable;
    use super::super::connection::{Released, Socket, SocketId, SocketOptions};
    use super::super::listener::{Listener, ListenOptions};
    use super::super::mapped::map;
    use super::*;

    fn registry() -> Registry {
        Registry::new(IsnGenerator::from_key(1, 2))
    }

    fn tuple(port: u16) -> FourTuple {
        FourTuple {
            local: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            remote: Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
            local_port: 80,
            remote_port: port,
        }
    }

    fn socket(id: u64) -> Arc<Socket> {
        Arc::new(Socket::new(SocketId(id), SocketOptions::default(), 64, Released::default()))
    }

    fn listener(id: u64, local: Ipv6Address, iface: Option<u32>, v6only: bool) -> Arc<Listener> {
        let options = ListenOptions {
            local,
            port: 80,
            iface,
            v6only,
            backlog: 8,
            keys: Arc::new(KeyTable::new()),
            .. ListenOptions::default()
        };
        Arc::new(Listener::new(SocketId(id), options))
    }

    #[test]
    fn one_record_per_tuple() {
        let registry = registry();
        let a = socket(1);
        let b = socket(2);
        let record_a = Record::Connection(Arc::downgrade(&a));
        let record_b = Record::Connection(Arc::downgrade(&b));
        registry.insert(tuple(1000), record_a.clone(), None).unwrap();
        assert_eq!(registry.insert(tuple(1000), record_b.clone(), None), Err(Error::AddressInUse));
        assert!(!registry.remove(&tuple(1000), &record_b));
        assert!(registry.replace(&tuple(1000), &record_a, record_b.clone()));
        match registry.lookup_established(&tuple(1000), None) {
            Some(Lookup::Connection(found)) => assert!(Arc::ptr_eq(&found, &b)),
            _ => panic!("record not found"),
        }
        assert!(registry.remove(&tuple(1000), &record_b));
        assert!(registry.lookup_established(&tuple(1000), None).is_none());
    }

    #[test]
    fn dead_records_are_absent() {
        let registry = registry();
        let a = socket(1);
        registry.insert(tuple(7), Record::Connection(Arc::downgrade(&a)), None).unwrap();
        drop(a);
        assert!(registry.lookup_established(&tuple(7), None).is_none());
        let b = socket(2);
        registry.insert(tuple(7), Record::Connection(Arc::downgrade(&b)), None).unwrap();
        assert!(registry.lookup_established(&tuple(7), None).is_some());
    }

    #[test]
    fn interface_bound_records() {
        let registry = registry();
        let a = socket(1);
        registry.insert(tuple(9), Record::Connection(Arc::downgrade(&a)), Some(3)).unwrap();
        assert!(registry.lookup_established(&tuple(9), Some(3)).is_some());
        assert!(registry.lookup_established(&tuple(9), Some(4)).is_none());
        assert!(registry.lookup_established(&tuple(9), None).is_none());
    }

    #[test]
    fn listener_precedence() {
        let registry = registry();
        let local = tuple(0).local;
        let wildcard = listener(1, Ipv6Address::UNSPECIFIED, None, false);
        let exact = listener(2, local, None, false);
        let bound = listener(3, Ipv6Address::UNSPECIFIED, Some(5), false);
        for l in [&wildcard, &exact, &bound].iter() {
            registry.bind_listener(l.local(), 80, l.iface(), l.v6only(), Arc::downgrade(l)).unwrap();
        }
        let found = |local: &Ipv6Address, iface| registry.lookup_listener(local, 80, iface)
            .map(|l| l.id());
        assert_eq!(found(&local, None), Some(SocketId(2)));
        assert_eq!(found(&local, Some(5)), Some(SocketId(2)));
        assert_eq!(found(&Ipv6Address::LOOPBACK, Some(5)), Some(SocketId(3)));
        assert_eq!(found(&Ipv6Address::LOOPBACK, None), Some(SocketId(1)));
        assert!(registry.lookup_listener(&local, 81, None).is_none());

        let again = listener(4, local, None, false);
        assert_eq!(registry.bind_listener(local, 80, None, false, Arc::downgrade(&again)),
            Err(Error::AddressInUse));
    }

    #[test]
    fn mapped_listeners() {
        let registry = registry();
        let v6only = listener(1, Ipv6Address::UNSPECIFIED, None, true);
        registry.bind_listener(Ipv6Address::UNSPECIFIED, 80, None, true, Arc::downgrade(&v6only))
            .unwrap();
        let peer = map(Ipv4Address::new(10, 0, 0, 1));
        assert!(registry.lookup_listener(&peer, 80, None).is_none());

        let v4 = listener(2, MAPPED_ANY, None, false);
        registry.bind_listener(MAPPED_ANY, 80, None, false, Arc::downgrade(&v4)).unwrap();
        assert_eq!(registry.lookup_listener(&peer, 80, None).map(|l| l.id()), Some(SocketId(2)));
        assert_eq!(registry.lookup_listener(&Ipv6Address::LOOPBACK, 80, None).map(|l| l.id()),
            Some(SocketId(1)));

        registry.unbind_listener(80, &Arc::downgrade(&v4));
        assert!(registry.lookup_listener(&peer, 80, None).is_none());
    }

    #[test]
    fn ephemeral_ports() {
        let registry = registry();
        let a = socket(1);
        let b = socket(2);
        let c = socket(3);
        let record = |s: &Arc<Socket>| Record::Connection(Arc::downgrade(s));
        let range = 40000..=40001;
        let first = registry.insert_ephemeral(tuple(443), &range, 0, &record(&a), None).unwrap();
        assert_eq!(first.local_port, 40000);
        let second = registry.insert_ephemeral(tuple(443), &range, 0, &record(&b), None).unwrap();
        assert_eq!(second.local_port, 40001);
        assert_eq!(registry.insert_ephemeral(tuple(443), &range, 0, &record(&c), None).err(),
            Some(Error::Exhausted));
        // Another peer port does not collide.
        assert!(registry.insert_ephemeral(tuple(444), &range, 1, &record(&c), None).is_ok());
    }
}
