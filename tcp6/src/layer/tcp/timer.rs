//! Single-shot deadlines of a namespace.
//!
//! All timers of a namespace live in one ordered queue. A timer refers to its target weakly and
//! does nothing when the target is gone by the time it fires. Owners disarm timers synchronously
//! when they tear a record down, so a fired timer for a live target is always current.
use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::time::Instant;

use super::connection::Socket;
use super::listener::Listener;
use super::registry::FourTuple;
use super::timewait::TimeWaitEntry;

/// What a timer fires for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Retransmission of SYN, FIN or data.
    Retransmit,
    /// Probe a zero window.
    ZeroWindowProbe,
    /// Probe an idle connection.
    Keepalive,
    /// Retransmission of a SYN-ACK.
    SynAck,
    /// End of time-wait.
    TimeWait,
    /// End of the FIN-WAIT-2 linger of an orphan.
    FinWait2,
}

impl TimerKind {
    pub(crate) const SOCKET: [TimerKind; 4] = [
        TimerKind::Retransmit,
        TimerKind::ZeroWindowProbe,
        TimerKind::Keepalive,
        TimerKind::FinWait2,
    ];

    pub(crate) fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Clone)]
pub(crate) enum Target {
    Socket(Weak<Socket>),
    Request(Weak<Listener>, FourTuple),
    TimeWait(Weak<TimeWaitEntry>),
}

/// Identifies an armed timer for disarming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerHandle {
    at: Instant,
    id: u64,
}

pub(crate) struct TimerQueue {
    next_id: AtomicU64,
    timers: Mutex<BTreeMap<TimerHandle, (Target, TimerKind)>>,
}

impl TimerHandle {
    pub(crate) fn at(&self) -> Instant {
        self.at
    }
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            next_id: AtomicU64::new(0),
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve a handle before the target exists.
    pub(crate) fn handle(&self, at: Instant) -> TimerHandle {
        TimerHandle {
            at,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Arm a reserved handle.
    pub(crate) fn arm_handle(&self, handle: TimerHandle, target: Target, kind: TimerKind) {
        self.timers.lock().insert(handle, (target, kind));
    }

    pub(crate) fn arm(&self, at: Instant, target: Target, kind: TimerKind) -> TimerHandle {
        let handle = self.handle(at);
        self.arm_handle(handle, target, kind);
        handle
    }

    /// Disarm a timer. Returns whether it was still pending.
    pub(crate) fn disarm(&self, handle: TimerHandle) -> bool {
        self.timers.lock().remove(&handle).is_some()
    }

    /// Remove and return all timers due at `now`, earliest first.
    pub(crate) fn expire(&self, now: Instant) -> Vec<(Target, TimerKind)> {
        let mut timers = self.timers.lock();
        let mut due = Vec::new();
        loop {
            let handle = match timers.keys().next() {
                Some(&handle) if handle.at <= now => handle,
                _ => break,
            };
            if let Some(timer) = timers.remove(&handle) {
                due.push(timer);
            }
        }
        due
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().keys().next().map(|handle| handle.at)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.timers.lock().clear()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use super::super::connection::{Released, Socket, SocketId, SocketOptions};
    use super::*;

    fn target() -> (Arc<Socket>, Target) {
        let socket = Arc::new(Socket::new(SocketId(1), SocketOptions::default(), 64, Released::default()));
        let target = Target::Socket(Arc::downgrade(&socket));
        (socket, target)
    }

    #[test]
    fn fires_in_order() {
        let queue = TimerQueue::new();
        let (_socket, target) = target();
        queue.arm(Instant::from_millis(300), target.clone(), TimerKind::Keepalive);
        queue.arm(Instant::from_millis(100), target.clone(), TimerKind::Retransmit);
        queue.arm(Instant::from_millis(200), target, TimerKind::ZeroWindowProbe);
        assert_eq!(queue.next_deadline(), Some(Instant::from_millis(100)));

        let kinds = |due: Vec<(Target, TimerKind)>| due.into_iter().map(|(_, k)| k).collect::<Vec<_>>();
        assert!(queue.expire(Instant::from_millis(50)).is_empty());
        assert_eq!(kinds(queue.expire(Instant::from_millis(200))),
            vec![TimerKind::Retransmit, TimerKind::ZeroWindowProbe]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn disarm() {
        let queue = TimerQueue::new();
        let (_socket, target) = target();
        let handle = queue.handle(Instant::from_millis(10));
        queue.arm_handle(handle, target, TimerKind::SynAck);
        assert!(queue.disarm(handle));
        assert!(!queue.disarm(handle));
        assert!(queue.expire(Instant::from_millis(10)).is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn kind_bits_are_distinct() {
        let mut bits = 0;
        for kind in TimerKind::SOCKET.iter() {
            assert_eq!(bits & kind.bit(), 0);
            bits |= kind.bit();
        }
    }
}
