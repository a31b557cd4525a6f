//! Event counters.
//!
//! Every drop and every notable protocol event increments one counter. Nothing else about a
//! dropped segment is retained.
use core::fmt;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::time::{Duration, Instant};

macro_rules! counters {
    ($($(#[$attr:meta])* $name:ident,)*) => {
        /// A statistics counter.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Counter {
            $( $(#[$attr])* $name, )*
        }

        impl Counter {
            /// All counters, in declaration order.
            pub const ALL: &'static [Counter] = &[ $( Counter::$name, )* ];

            /// The number of counters.
            pub const COUNT: usize = [ $( Counter::$name, )* ].len();

            /// The name of the counter.
            pub fn name(self) -> &'static str {
                match self {
                    $( Counter::$name => stringify!($name), )*
                }
            }
        }
    }
}

counters! {
    /// Segments received.
    InSegments,
    /// Segments sent.
    OutSegments,
    /// Resets sent.
    OutResets,
    /// Segments with a bad checksum.
    ChecksumErrors,
    /// Segments that could not be parsed.
    Malformed,
    /// Segments from or to multicast or unspecified addresses.
    AddressRejected,
    /// Mapped addresses on the native IPv6 path.
    MappedOnInet6,
    /// Segments for which no socket exists.
    NoSocket,
    /// Segments below the hop count floor.
    MinHopcountDrops,
    /// Keyed peer sent an unsigned segment.
    AuthNotFound,
    /// Signed segment from a peer without key.
    AuthUnexpected,
    /// Signature mismatch.
    AuthFailure,
    /// SYNs or ACKs dropped because the accept queue was full.
    ListenOverflows,
    /// SYNs dropped on a listener for any reason.
    ListenDrops,
    /// SYN cookies sent.
    CookiesSent,
    /// Valid cookies received.
    CookiesReceived,
    /// Invalid cookies received.
    CookiesFailed,
    /// Segments rejected by timestamp checks.
    PawsRejected,
    /// Unacceptable sequence numbers.
    OutOfWindow,
    /// Challenge ACKs sent.
    ChallengeAcks,
    /// Resets that closed a connection.
    ResetsReceived,
    /// ACKs of data we never sent.
    AckOfUnsent,
    /// Segments dropped because the backlog of an owned socket was full.
    BacklogDrops,
    /// Segments queued to the backlog of an owned socket.
    BacklogQueued,
    /// Connections opened by connect.
    ActiveOpens,
    /// Connections accepted on a listener.
    PassiveOpens,
    /// Connection attempts that failed.
    AttemptFails,
    /// Synchronized connections that were reset.
    EstablishedResets,
    /// Time-wait records replaced by a new connection.
    TimeWaitRecycled,
    /// Time-wait records destroyed by a reset.
    TimeWaitKilled,
    /// Connections closed without time-wait because the table was full.
    TimeWaitOverflow,
    /// Duplicate segments absorbed by a time-wait record.
    TimeWaitAbsorbed,
    /// Orphans aborted because there were too many.
    OrphanOverflow,
    /// Error notifications without matching record.
    IcmpUnknown,
    /// Error notifications quoting a sequence number outside the window.
    IcmpOutOfWindow,
    /// Error notifications that aborted a connection or request.
    IcmpHardErrors,
    /// Error notifications deferred because the socket was owned.
    IcmpDeferred,
    /// Immediate retransmissions after a path MTU reduction.
    PmtuRetransmits,
    /// Retransmission timeouts reverted on unreachable notifications.
    RtoReverts,
    /// Connection attempts refused by the admission hook.
    AdmissionDenied,
    /// Retransmissions after a timeout.
    Retransmits,
    /// SYN-ACK retransmissions.
    SynAckRetransmits,
    /// Requests dropped after exhausting SYN-ACK retransmissions.
    RequestTimeouts,
    /// Connections aborted after exhausting retransmissions.
    Timeouts,
    /// Zero window probes sent.
    WindowProbes,
    /// Keepalive probes sent.
    KeepaliveProbes,
    /// Invalidated routes resolved again on use.
    RouteRefreshes,
    /// Sockets dropped by their user while still registered or with armed timers.
    AbandonedSockets,
}

/// The live counters of a namespace.
pub(crate) struct Stats {
    counters: [AtomicU64; Counter::COUNT],
}

/// A copy of all counters at one point in time.
#[derive(Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Counter::COUNT],
}

impl Stats {
    pub(crate) fn new() -> Self {
        // AtomicU64 is not Copy.
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Stats { counters: [ZERO; Counter::COUNT] }
    }

    pub(crate) fn inc(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let mut values = [0; Counter::COUNT];
        for (value, counter) in values.iter_mut().zip(self.counters.iter()) {
            *value = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot { values }
    }
}

impl StatsSnapshot {
    /// The value of one counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize]
    }
}

impl core::ops::Index<Counter> for StatsSnapshot {
    type Output = u64;

    fn index(&self, counter: Counter) -> &u64 {
        &self.values[counter as usize]
    }
}

impl fmt::Debug for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        for &counter in Counter::ALL {
            let value = self.get(counter);
            if value != 0 {
                map.entry(&counter.name(), &value);
            }
        }
        map.finish()
    }
}

/// Allows one event per interval.
pub(crate) struct RateLimit {
    interval: i64,
    last: AtomicI64,
}

impl RateLimit {
    pub(crate) fn new(interval: Duration) -> Self {
        RateLimit {
            interval: interval.as_millis() as i64,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub(crate) fn allow(&self, now: Instant) -> bool {
        let now = now.total_millis();
        let last = self.last.load(Ordering::Relaxed);
        if last != i64::MIN && now.saturating_sub(last) < self.interval {
            return false;
        }
        self.last.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let stats = Stats::new();
        stats.inc(Counter::NoSocket);
        stats.inc(Counter::NoSocket);
        stats.inc(Counter::KeepaliveProbes);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[Counter::NoSocket], 2);
        assert_eq!(snapshot.get(Counter::KeepaliveProbes), 1);
        assert_eq!(snapshot.get(Counter::InSegments), 0);
        assert_eq!(format!("{:?}", snapshot), r#"{"NoSocket": 2, "KeepaliveProbes": 1}"#);
    }

    #[test]
    fn rate_limit() {
        let limit = RateLimit::new(Duration::from_secs(1));
        assert!(limit.allow(Instant::from_millis(0)));
        assert!(!limit.allow(Instant::from_millis(999)));
        assert!(limit.allow(Instant::from_millis(1000)));
        assert!(!limit.allow(Instant::from_millis(1500)));
    }
}
