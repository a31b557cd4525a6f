//! Connections lingering after both sides closed.
//!
//! A closing connection hands its final sequence numbers to a small immutable record that
//! replaces it in the registry. The record answers retransmitted FINs, absorbs the last ACK and
//! allows a new incarnation of the same tuple to start early through a listener. It expires after
//! the configured time-wait period.
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::time::Instant;
use crate::wire::{TcpSeqNumber, TcpTimestamp};

use super::auth::{self, AuthKey};
use super::connection::{Connection, FlowMeta, Socket, Timestamps};
use super::dispatch::{self, Disposition, Segment};
use super::handshake;
use super::mapped::Family;
use super::namespace::Namespace;
use super::registry::{FourTuple, Record};
use super::responder::{ControlSegmentTemplate, Path};
use super::stats::Counter;
use super::timer::{Target, TimerHandle, TimerKind};

/// The sequence space distance of a new incarnation from the old one.
const REINCARNATION_OFFSET: usize = 65537;

/// The final state of a closed connection.
pub(crate) struct TimeWaitEntry {
    pub(crate) tuple: FourTuple,
    pub(crate) iface: Option<u32>,
    pub(crate) family: Family,
    pub(crate) snd_nxt: TcpSeqNumber,
    pub(crate) rcv_nxt: TcpSeqNumber,
    pub(crate) rcv_window: u32,
    pub(crate) rcv_scale: u8,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) key: Option<Arc<AuthKey>>,
    pub(crate) meta: FlowMeta,
    pub(crate) hop_limit: u8,
    pub(crate) expires: Instant,
    timer: TimerHandle,
}

pub(crate) struct TimeWaitTable {
    entries: Mutex<BTreeMap<FourTuple, Arc<TimeWaitEntry>>>,
}

impl TimeWaitEntry {
    /// When the record expires.
    pub(crate) fn expires(&self) -> Instant {
        self.expires
    }

    fn path(&self) -> Path {
        Path {
            tuple: self.tuple,
            next_hop: self.tuple.remote,
            family: self.family,
            iface: self.iface,
            hop_limit: self.hop_limit,
            meta: self.meta,
        }
    }

    /// Our acknowledgment of everything the peer sent.
    fn ack(&self, now: Instant) -> ControlSegmentTemplate {
        let window = (self.rcv_window >> self.rcv_scale).min(u32::from(u16::MAX)) as u16;
        let mut template = ControlSegmentTemplate::ack(self.path(), self.snd_nxt, self.rcv_nxt, window);
        template.timestamp = self.timestamps.map(|ts| TcpTimestamp {
            tsval: (now.total_millis() as u32).wrapping_add(ts.offset),
            tsecr: ts.recent,
        });
        template.key = self.key.as_deref();
        template
    }
}

impl TimeWaitTable {
    pub(crate) fn new() -> Self {
        TimeWaitTable { entries: Mutex::new(BTreeMap::new()) }
    }

    /// Replace a closing connection by a time-wait record.
    ///
    /// Fails when the table is full, the caller then simply closes the connection.
    pub(crate) fn enter(&self, ns: &Namespace, socket: &Arc<Socket>, conn: &Connection, now: Instant)
        -> bool
    {
        let mut entries = self.entries.lock();
        if entries.len() >= ns.config.max_tw_buckets {
            net_debug!("tcp {}: time-wait table full", conn.tuple);
            ns.stats.inc(Counter::TimeWaitOverflow);
            return false;
        }

        let expires = now + ns.config.time_wait;
        let timer = ns.timers.handle(expires);
        let entry = Arc::new(TimeWaitEntry {
            tuple: conn.tuple,
            iface: conn.iface,
            family: conn.family,
            snd_nxt: conn.send.nxt,
            rcv_nxt: conn.recv.nxt,
            rcv_window: conn.recv.window,
            rcv_scale: conn.recv.scale,
            timestamps: conn.timestamps,
            key: socket.keys().lookup(&conn.tuple.remote, conn.iface),
            meta: conn.meta,
            hop_limit: conn.hop_limit,
            expires,
            timer,
        });

        let old = Record::Connection(Arc::downgrade(socket));
        let new = Record::TimeWait(Arc::downgrade(&entry));
        if !ns.registry.replace(&conn.tuple, &old, new) {
            return false;
        }
        ns.timers.arm_handle(timer, Target::TimeWait(Arc::downgrade(&entry)), TimerKind::TimeWait);
        if let Some(previous) = entries.insert(conn.tuple, entry) {
            ns.timers.disarm(previous.timer);
        }
        true
    }

    /// Destroy a record before its expiry.
    pub(crate) fn remove(&self, ns: &Namespace, entry: &Arc<TimeWaitEntry>) -> bool {
        let mut entries = self.entries.lock();
        let found = match entries.get(&entry.tuple) {
            Some(current) => Arc::ptr_eq(current, entry),
            None => false,
        };
        if !found {
            return false;
        }
        entries.remove(&entry.tuple);
        ns.timers.disarm(entry.timer);
        ns.registry.remove(&entry.tuple, &Record::TimeWait(Arc::downgrade(entry)));
        true
    }

    /// Put back a record taken out for a new incarnation that did not start.
    pub(crate) fn restore(&self, ns: &Namespace, entry: &Arc<TimeWaitEntry>) {
        let mut entries = self.entries.lock();
        let record = Record::TimeWait(Arc::downgrade(entry));
        if ns.registry.insert(entry.tuple, record, entry.iface).is_err() {
            return;
        }
        ns.timers.arm_handle(entry.timer, Target::TimeWait(Arc::downgrade(entry)), TimerKind::TimeWait);
        entries.insert(entry.tuple, entry.clone());
    }

    /// The timer of a record fired.
    pub(crate) fn expire(&self, ns: &Namespace, entry: &Arc<TimeWaitEntry>) {
        if self.remove(ns, entry) {
            net_trace!("tcp {}: time-wait expired", entry.tuple);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear()
    }
}

/// A segment for a time-wait record.
pub(crate) fn process(ns: &Namespace, entry: &Arc<TimeWaitEntry>, seg: &Segment, now: Instant)
    -> Disposition
{
    let verdict = auth::check(&*ns.providers.hasher, entry.key.as_deref(), &seg.pseudo, seg.bytes);
    if let Err(reason) = dispatch::verdict(ns, verdict, seg, now) {
        return Disposition::Dropped(reason);
    }

    let repr = &seg.repr;
    let flags = repr.flags;
    if flags.rst() {
        if ns.time_wait.remove(ns, entry) {
            ns.stats.inc(Counter::TimeWaitKilled);
        }
        return Disposition::Accepted;
    }

    if flags.syn() && !flags.ack() {
        let newer = match (entry.timestamps, repr.timestamp) {
            (Some(ours), Some(theirs)) => (theirs.tsval.wrapping_sub(ours.recent) as i32) > 0,
            _ => false,
        };
        if repr.seq_number.diff(entry.rcv_nxt) > 0 || newer {
            let local = &seg.tuple.local;
            if let Some(listener) = ns.registry.lookup_listener(local, seg.tuple.local_port, seg.iface) {
                let removed = ns.time_wait.remove(ns, entry);
                let iss = entry.snd_nxt + REINCARNATION_OFFSET;
                let disposition = handshake::listen(ns, &listener, seg, now, Some(iss));
                if removed {
                    if let Disposition::Dropped(reason) = disposition {
                        net_debug!("tcp {}: stays in time-wait, SYN dropped: {}", seg.tuple, reason);
                        ns.time_wait.restore(ns, entry);
                    } else {
                        net_debug!("tcp {}: reincarnated from time-wait", seg.tuple);
                        ns.stats.inc(Counter::TimeWaitRecycled);
                    }
                }
                return disposition;
            }
        }
    }

    let bare = !flags.syn() && !flags.fin() && seg.payload.is_empty();
    if bare && repr.seq_number == entry.rcv_nxt && repr.ack_number == Some(entry.snd_nxt) {
        ns.stats.inc(Counter::TimeWaitAbsorbed);
        return Disposition::Accepted;
    }

    if let (Some(ours), Some(theirs)) = (entry.timestamps, repr.timestamp) {
        if (theirs.tsval.wrapping_sub(ours.recent) as i32) < 0 {
            ns.stats.inc(Counter::PawsRejected);
        }
    }
    entry.ack(now).send(ns);
    Disposition::Answered
}
