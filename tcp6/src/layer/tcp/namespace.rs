//! The context of all connections of one stack instance.
//!
//! A [`Namespace`] owns the tables, timers, counters and secrets. Everything that touches a
//! connection goes through it: received segments, error notifications, timer polls and the socket
//! calls of users.
//!
//! [`Namespace`]: struct.Namespace.html
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::layer::{Error, Result};
use crate::time::Instant;
use crate::wire::{Ipv6Address, TcpSeqNumber};

use super::config::Config;
use super::connection::{Machine, Released, Socket, SocketId, SocketOptions, State};
use super::cookie::SynCookies;
use super::dispatch::{self, Disposition, Inbound};
use super::feedback::{self, Notification};
use super::handshake;
use super::listener::{ListenOptions, Listener};
use super::mapped::{Family, Inbound4, MAPPED_ANY};
use super::provider::Providers;
use super::registry::{FourTuple, Lookup, Registry};
use super::siphash::IsnGenerator;
use super::stats::{Counter, RateLimit, Stats, StatsSnapshot};
use super::timer::{Target, TimerKind, TimerQueue};
use super::timewait::TimeWaitTable;

/// The secret keys of a namespace.
///
/// Sequence numbers, cookies and the table layout must not be predictable from the outside.
#[derive(Clone, Copy)]
pub struct Secrets {
    /// Key of the initial sequence numbers and timestamp offsets.
    pub isn: [u8; 16],
    /// Key of the SYN cookie MAC.
    pub cookie: [u8; 16],
    /// Key of the registry sharding.
    pub shard: [u8; 16],
}

/// The tables and collaborators of one TCP instance.
pub struct Namespace {
    pub(crate) config: Config,
    pub(crate) providers: Providers,
    pub(crate) registry: Registry,
    pub(crate) time_wait: TimeWaitTable,
    pub(crate) timers: TimerQueue,
    pub(crate) stats: Stats,
    pub(crate) isn: IsnGenerator,
    pub(crate) cookies: SynCookies,
    pub(crate) auth_log: RateLimit,
    /// Closed sockets still finishing their shutdown, kept alive by the namespace.
    pub(crate) orphans: Mutex<BTreeMap<SocketId, Arc<Socket>>>,
    pub(crate) released: Released,
    next_id: AtomicU64,
}

/// The kind of a record in a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A bound listener.
    Listener,
    /// A half-open request of a listener.
    Request,
    /// A connection.
    Connection,
    /// A time-wait record.
    TimeWait,
}

/// One line of the connection table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// What the record is.
    pub kind: RecordKind,
    /// Local and remote address, the remote is unspecified for listeners.
    pub tuple: FourTuple,
    /// The protocol state.
    pub state: State,
    /// The next timer of the record.
    pub expires: Option<Instant>,
}

/// Exclusive use of a socket by its user.
///
/// Segments arriving meanwhile are queued and timer work is deferred. Both are processed, in
/// order, when the guard is released or dropped.
pub struct Owned<'a> {
    ns: &'a Namespace,
    socket: Arc<Socket>,
    now: Instant,
}

impl Secrets {
    /// Draw all keys from a cryptographic random number generator.
    pub fn from_rng<R: rand_core::RngCore + rand_core::CryptoRng>(rng: &mut R) -> Self {
        let mut secrets = Secrets { isn: [0; 16], cookie: [0; 16], shard: [0; 16] };
        rng.fill_bytes(&mut secrets.isn);
        rng.fill_bytes(&mut secrets.cookie);
        rng.fill_bytes(&mut secrets.shard);
        secrets
    }

    /// Keys from the randomness of the operating system.
    #[cfg(feature = "std")]
    pub fn random() -> Self {
        Self::from_rng(&mut rand::rngs::OsRng)
    }
}

impl Namespace {
    /// Create a namespace with random secrets.
    #[cfg(feature = "std")]
    pub fn new(config: Config, providers: Providers) -> Self {
        Self::with_secrets(config, providers, Secrets::random())
    }

    /// Create a namespace with chosen secrets.
    pub fn with_secrets(config: Config, providers: Providers, secrets: Secrets) -> Self {
        Namespace {
            auth_log: RateLimit::new(config.auth_log_interval),
            config,
            providers,
            registry: Registry::new(IsnGenerator::from_secret_key_bytes(secrets.shard)),
            time_wait: TimeWaitTable::new(),
            timers: TimerQueue::new(),
            stats: Stats::new(),
            isn: IsnGenerator::from_secret_key_bytes(secrets.isn),
            cookies: SynCookies::new(secrets.cookie),
            orphans: Mutex::new(BTreeMap::new()),
            released: Released::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The initial sequence number of a new connection.
    pub(crate) fn initial_sequence(&self, tuple: &FourTuple, now: Instant) -> TcpSeqNumber {
        match self.providers.sequence.as_ref() {
            Some(source) => source.initial(tuple, now),
            None => self.isn.get_isn(tuple, now),
        }
    }

    pub(crate) fn next_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an unconnected socket.
    pub fn socket(&self, options: SocketOptions) -> Arc<Socket> {
        Arc::new(Socket::new(self.next_id(), options, self.config.hop_limit, self.released.clone()))
    }

    /// Remove what sockets dropped without `close` or `abort` left behind.
    pub(crate) fn reap(&self) {
        for leftover in self.released.take() {
            for handle in leftover.timers {
                self.timers.disarm(handle);
            }
            if leftover.registered && self.registry.remove_dead(&leftover.tuple) {
                net_debug!("tcp {}: socket dropped while open", leftover.tuple);
            }
            self.stats.inc(Counter::AbandonedSockets);
        }
    }

    /// Create a listener and bind it.
    pub fn listen(&self, options: ListenOptions) -> Result<Arc<Listener>> {
        if options.port == 0 {
            return Err(Error::InvalidAddress);
        }
        let local = options.local;
        if local.is_multicast() || (options.v6only && local.is_ipv4_mapped()) {
            return Err(Error::InvalidAddress);
        }
        if local.is_ipv4_mapped() && local != MAPPED_ANY && !Family::Mapped.is_unicast(&local) {
            return Err(Error::InvalidAddress);
        }

        let listener = Arc::new(Listener::new(self.next_id(), options));
        self.registry.bind_listener(
            listener.local(),
            listener.port(),
            listener.iface(),
            listener.v6only(),
            Arc::downgrade(&listener))?;
        net_debug!("tcp: listening on [{}]:{}", listener.local(), listener.port());
        Ok(listener)
    }

    /// Take the oldest connection completed on a listener.
    pub fn accept(&self, listener: &Listener) -> Option<Arc<Socket>> {
        listener.state.lock().accept.pop_front()
    }

    /// Start an active open to `remote`.
    ///
    /// An unspecified remote means loopback. The socket is bound to an ephemeral port unless it
    /// was created with one.
    pub fn connect(&self, socket: &Arc<Socket>, remote: Ipv6Address, port: u16, now: Instant)
        -> Result<()>
    {
        handshake::connect(self, socket, remote, port, now)
    }

    /// Send new data on a synchronized connection.
    ///
    /// Returns the octets sent, bounded by the segment size and the window of the peer. The engine
    /// is expected to keep them until acknowledged.
    pub fn send(&self, socket: &Arc<Socket>, data: &[u8], now: Instant) -> Result<usize> {
        let _control = socket.control.lock();
        let mut conn = socket.conn.lock();
        match conn.state {
            State::Established | State::CloseWait => (),
            _ => return Err(conn.error.map(Error::Socket).unwrap_or(Error::Illegal)),
        }
        Ok(Machine::new(self, socket, now).send_data(&mut conn, data))
    }

    /// Close our side of a connection.
    ///
    /// The connection finishes its shutdown as an orphan of the namespace, the socket may be
    /// dropped right after.
    pub fn close(&self, socket: &Arc<Socket>, now: Instant) -> Result<()> {
        let _control = socket.control.lock();
        let mut conn = socket.conn.lock();
        let machine = Machine::new(self, socket, now);
        let next = match conn.state {
            State::Closed => return Ok(()),
            State::SynSent | State::Listen => {
                machine.close(&mut conn);
                return Ok(());
            },
            State::SynReceived | State::Established => State::FinWait1,
            State::CloseWait => State::LastAck,
            _ => return Ok(()),
        };

        {
            let mut orphans = self.orphans.lock();
            if orphans.len() >= self.config.max_orphans {
                drop(orphans);
                net_debug!("tcp {}: too many orphans", conn.tuple);
                self.stats.inc(Counter::OrphanOverflow);
                machine.send_reset(&mut conn);
                machine.close(&mut conn);
                return Ok(());
            }
            orphans.insert(socket.id(), socket.clone());
        }
        conn.orphan = true;
        machine.set_state(&mut conn, next);
        machine.send_fin(&mut conn);
        Ok(())
    }

    /// Reset a connection and forget it.
    pub fn abort(&self, socket: &Arc<Socket>, now: Instant) {
        let mut control = socket.control.lock();
        control.backlog.clear();
        let mut conn = socket.conn.lock();
        let machine = Machine::new(self, socket, now);
        match conn.state {
            State::Closed | State::Listen | State::TimeWait => (),
            State::SynSent => machine.close(&mut conn),
            _ => {
                net_debug!("tcp {}: aborted", conn.tuple);
                machine.send_reset(&mut conn);
                machine.close(&mut conn);
            },
        }
    }

    /// Take exclusive ownership of a socket.
    ///
    /// Fails with `Illegal` if it is owned already.
    pub fn own(&self, socket: &Arc<Socket>, now: Instant) -> Result<Owned<'_>> {
        let mut control = socket.control.lock();
        if control.owned {
            return Err(Error::Illegal);
        }
        control.owned = true;
        Ok(Owned { ns: self, socket: socket.clone(), now })
    }

    /// Stop listening.
    ///
    /// Pending requests are dropped and completed connections that were never accepted are reset.
    pub fn close_listener(&self, listener: &Arc<Listener>, now: Instant) {
        let pending: Vec<_> = {
            let mut state = listener.state.lock();
            state.open = false;
            let tuples: Vec<_> = state.requests.keys().cloned().collect();
            for tuple in tuples.iter() {
                handshake::destroy(self, listener, &mut state, tuple);
            }
            state.accept.drain(..).collect()
        };
        self.registry.unbind_listener(listener.port(), &Arc::downgrade(listener));
        for socket in pending.iter() {
            self.abort(socket, now);
        }
    }

    /// Process a segment received over IPv6.
    pub fn receive(&self, packet: Inbound, now: Instant) -> Disposition {
        self.reap();
        dispatch::receive(self, &packet, Family::Inet6, now)
    }

    /// Process a segment received over IPv4.
    pub fn receive_ipv4(&self, packet: Inbound4, now: Instant) -> Disposition {
        self.reap();
        dispatch::receive(self, &packet.mapped(), Family::Mapped, now)
    }

    /// Process an ICMPv6 message, `packet.segment` holding the whole message.
    pub fn receive_icmpv6(&self, packet: Inbound, now: Instant) -> Result<()> {
        self.reap();
        feedback::receive_icmpv6(self, &packet, now)
    }

    /// Apply an error notification.
    pub fn notify(&self, note: &Notification, now: Instant) -> Result<()> {
        self.reap();
        feedback::notify(self, note, now)
    }

    /// Fire all timers due at `now`. Returns the number fired.
    pub fn poll(&self, now: Instant) -> usize {
        self.reap();
        let due = self.timers.expire(now);
        let fired = due.len();
        for (target, kind) in due {
            match target {
                Target::Socket(socket) => if let Some(socket) = socket.upgrade() {
                    self.socket_timer(&socket, kind, now);
                },
                Target::Request(listener, tuple) => if let Some(listener) = listener.upgrade() {
                    handshake::request_timeout(self, &listener, tuple, now);
                },
                Target::TimeWait(entry) => if let Some(entry) = entry.upgrade() {
                    self.time_wait.expire(self, &entry);
                },
            }
        }
        fired
    }

    fn socket_timer(&self, socket: &Arc<Socket>, kind: TimerKind, now: Instant) {
        let mut control = socket.control.lock();
        let mut conn = socket.conn.lock();
        let machine = Machine::new(self, socket, now);
        if control.owned {
            machine.fired(&mut conn, kind);
            control.deferred.timers |= kind.bit();
        } else {
            machine.on_timer(&mut conn, kind);
        }
    }

    /// The earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reap();
        self.timers.next_deadline()
    }

    /// Forget all state without sending anything.
    pub fn teardown(&self, now: Instant) {
        let mut sockets = Vec::new();
        for listener in self.registry.listeners() {
            let mut state = listener.state.lock();
            state.open = false;
            state.requests.clear();
            sockets.extend(state.accept.drain(..));
        }
        sockets.extend(self.registry.records().into_iter()
            .filter_map(|(_, record)| match record {
                Lookup::Connection(socket) => Some(socket),
                _ => None,
            }));
        sockets.extend(self.orphans.lock().values().cloned());

        for socket in sockets.iter() {
            let mut control = socket.control.lock();
            control.backlog.clear();
            control.deferred = Default::default();
            let mut conn = socket.conn.lock();
            Machine::new(self, socket, now).close(&mut conn);
        }
        self.orphans.lock().clear();
        self.time_wait.clear();
        self.timers.clear();
        self.registry.clear();
    }

    /// A copy of all counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The connection table: listeners, requests, connections and time-wait records.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.reap();
        let mut entries = Vec::new();
        for listener in self.registry.listeners() {
            entries.push(SnapshotEntry {
                kind: RecordKind::Listener,
                tuple: FourTuple {
                    local: listener.local(),
                    remote: Ipv6Address::UNSPECIFIED,
                    local_port: listener.port(),
                    remote_port: 0,
                },
                state: State::Listen,
                expires: None,
            });
            let state = listener.state.lock();
            entries.extend(state.requests.values().map(|request| SnapshotEntry {
                kind: RecordKind::Request,
                tuple: request.tuple,
                state: State::SynReceived,
                expires: request.timer.map(|handle| handle.at()),
            }));
        }

        for (tuple, record) in self.registry.records() {
            match record {
                Lookup::Connection(socket) => {
                    let conn = socket.conn.lock();
                    entries.push(SnapshotEntry {
                        kind: RecordKind::Connection,
                        tuple,
                        state: conn.state,
                        expires: conn.timers.next(),
                    });
                },
                Lookup::TimeWait(entry) => entries.push(SnapshotEntry {
                    kind: RecordKind::TimeWait,
                    tuple,
                    state: State::TimeWait,
                    expires: Some(entry.expires()),
                }),
                Lookup::Request(_) => (),
            }
        }
        entries
    }
}

impl Owned<'_> {
    /// The owned socket.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Release at a given time, processing what was queued meanwhile.
    pub fn release(mut self, now: Instant) {
        self.now = now;
    }
}

impl Deref for Owned<'_> {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

impl Drop for Owned<'_> {
    fn drop(&mut self) {
        dispatch::release(self.ns, &self.socket, self.now)
    }
}
