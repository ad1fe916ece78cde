//! Timed work, delivered as messages.
//!
//! Subsystems never receive callbacks while holding locks: they schedule an
//! event, and the engine's timer pump later takes the due events and
//! dispatches each one from the top, acquiring only the locks that handler
//! needs. Cancellation is lazy; a cancelled id is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

/// Everything the clock can ask the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Run the retransmit queue of a call.
    Retransmit(u16),
    /// Send a periodic PING on an up call.
    Ping(u16),
    /// Send a periodic LAGRQ on an up call.
    Lagrq(u16),
    /// An outgoing call never got a response; congest it.
    MaxTimeExpired(u16),
    /// Rotate the transmit encryption key of a call.
    KeyRotate(u16),
    /// Deliver a REJECT that was deferred to blunt auth probing.
    DelayedReject(u16),
    /// Quarantine over: the number goes back, and with `charged` its quota
    /// charge too. A trunk move returns only the number; the charge stayed
    /// with the slot.
    ReturnCallno {
        callno: u16,
        ip: IpAddr,
        validated: bool,
        charged: bool,
    },
    /// Drain every trunk peer buffer.
    TrunkTick,
    /// Refresh one outbound registration (by index).
    RegRefresh(usize),
    /// Qualify a peer with a POKE.
    QualifyPoke(String),
    /// The qualify POKE went unanswered past maxms.
    QualifyTimeout(String),
    /// A dynamic peer's registration lapsed.
    PeerExpire(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry {
    at: Instant,
    id: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.id.cmp(&other.id))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, at: Instant, event: TimerEvent) -> TimerId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.heap.push(Reverse(Entry { at, id, event }));
        TimerId(id)
    }

    pub fn cancel(&self, id: TimerId) {
        self.inner.lock().cancelled.insert(id.0);
    }

    /// Earliest live deadline, for the pump's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        while let Some(Reverse(entry)) = inner.heap.peek() {
            if inner.cancelled.contains(&entry.id) {
                let id = entry.id;
                inner.heap.pop();
                inner.cancelled.remove(&id);
                continue;
            }
            return Some(entry.at);
        }
        None
    }

    /// Removes and returns every event due at `now`, in firing order.
    pub fn take_due(&self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock();
        while let Some(Reverse(entry)) = inner.heap.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            if inner.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(entry.event);
        }
        due
    }

    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.heap.len() - inner.cancelled.len().min(inner.heap.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_order() {
        let sched = Scheduler::new();
        let now = Instant::now();
        sched.schedule(now + Duration::from_millis(20), TimerEvent::TrunkTick);
        sched.schedule(now + Duration::from_millis(10), TimerEvent::Ping(5));
        assert!(sched.take_due(now).is_empty());
        assert_eq!(
            sched.take_due(now + Duration::from_millis(15)),
            vec![TimerEvent::Ping(5)]
        );
        assert_eq!(
            sched.take_due(now + Duration::from_millis(25)),
            vec![TimerEvent::TrunkTick]
        );
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let sched = Scheduler::new();
        let now = Instant::now();
        let id = sched.schedule(now, TimerEvent::Ping(1));
        sched.schedule(now, TimerEvent::Lagrq(1));
        sched.cancel(id);
        assert_eq!(sched.take_due(now), vec![TimerEvent::Lagrq(1)]);
    }

    #[test]
    fn same_instant_preserves_schedule_order() {
        let sched = Scheduler::new();
        let now = Instant::now();
        sched.schedule(now, TimerEvent::Ping(1));
        sched.schedule(now, TimerEvent::Ping(2));
        assert_eq!(
            sched.take_due(now),
            vec![TimerEvent::Ping(1), TimerEvent::Ping(2)]
        );
    }
}
