//! The per-call retransmission queue for full frames.
//!
//! Every full frame a call sends stays queued here until an acknowledgment
//! releases it or its retries run out. The queue never touches the wire; the
//! owner asks it what is due, rewrites the retransmission bit (and
//! re-encrypts when the call is encrypted) and performs the send itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::seq::{released_by, wanted_by_vnak, Seqno};

/// Retries before a frame gives up and kills the call.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Bounds on the initial retry delay derived from the measured ping time.
pub const MIN_RETRY_TIME: Duration = Duration::from_millis(100);
pub const MAX_RETRY_TIME: Duration = Duration::from_millis(10_000);

/// Ceiling for the exponential back-off; transfer frames stay snappier.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(10_000);
pub const MAX_TRANSFER_RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Back-off multiplier applied on every retry.
const RETRY_BACKOFF: u32 = 10;

/// Derives the first-retry delay from the current ping RTT.
pub fn initial_retry_delay(pingtime: Duration) -> Duration {
    (pingtime * 2).clamp(MIN_RETRY_TIME, MAX_RETRY_TIME)
}

/// One outbound full frame awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub oseqno: Seqno,
    pub ts: u32,
    /// Encoded datagram as last sent, encryption included.
    pub data: Vec<u8>,
    /// Retries remaining. Hits zero when the frame is abandoned.
    pub retries: u32,
    pub retry_delay: Duration,
    pub next_retry: Instant,
    /// Set for frames belonging to a transfer handshake.
    pub transfer: bool,
    /// Set for the terminal frame of a call; its fate decides the slot's.
    pub final_frame: bool,
}

/// What a queue tick wants the owner to do.
#[derive(Debug, PartialEq, Eq)]
pub enum TxEvent {
    /// Retransmit the frame with this oseqno, retrans bit set.
    Resend(Seqno),
    /// The frame ran out of retries. `final_frame` distinguishes a lost
    /// teardown (slot can die quietly) from a mid-call loss (destroy with a
    /// timeout cause).
    Expired { oseqno: Seqno, final_frame: bool },
}

/// Frames released by an acknowledgment.
#[derive(Debug, Default)]
pub struct Released {
    pub count: usize,
    /// True when the released set included the terminal frame.
    pub final_acked: bool,
}

#[derive(Debug, Default)]
pub struct TxQueue {
    frames: VecDeque<PendingFrame>,
    max_retries: u32,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Queues a frame that was just sent for the first time.
    pub fn push(
        &mut self,
        oseqno: Seqno,
        ts: u32,
        data: Vec<u8>,
        now: Instant,
        retry_delay: Duration,
        transfer: bool,
        final_frame: bool,
    ) {
        self.frames.push_back(PendingFrame {
            oseqno,
            ts,
            data,
            retries: self.max_retries,
            retry_delay,
            next_retry: now + retry_delay,
            transfer,
            final_frame,
        });
    }

    pub fn get_mut(&mut self, oseqno: Seqno) -> Option<&mut PendingFrame> {
        self.frames.iter_mut().find(|f| f.oseqno == oseqno)
    }

    /// The earliest retransmission deadline, for scheduling the next tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.frames.iter().map(|f| f.next_retry).min()
    }

    /// Advances retransmission timers. Expired frames are removed; frames to
    /// resend get their back-off applied here, so a subsequent tick is quiet
    /// until the new deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<TxEvent> {
        let mut events = Vec::new();
        let mut idx = 0;
        while idx < self.frames.len() {
            let frame = &mut self.frames[idx];
            if frame.next_retry > now {
                idx += 1;
                continue;
            }
            if frame.retries == 0 {
                let Some(frame) = self.frames.remove(idx) else {
                    break;
                };
                debug!(oseqno = frame.oseqno.0, "retransmit retries exhausted");
                events.push(TxEvent::Expired {
                    oseqno: frame.oseqno,
                    final_frame: frame.final_frame,
                });
                continue;
            }
            frame.retries -= 1;
            let cap = if frame.transfer {
                MAX_TRANSFER_RETRY_DELAY
            } else {
                MAX_RETRY_DELAY
            };
            frame.retry_delay = (frame.retry_delay * RETRY_BACKOFF).min(cap);
            frame.next_retry = now + frame.retry_delay;
            events.push(TxEvent::Resend(frame.oseqno));
            idx += 1;
        }
        events
    }

    /// Releases everything acknowledged by an incoming frame's `iseqno`.
    pub fn ack(&mut self, iseqno: Seqno) -> Released {
        let mut released = Released::default();
        self.frames.retain(|f| {
            if released_by(f.oseqno, iseqno) {
                released.count += 1;
                released.final_acked |= f.final_frame;
                false
            } else {
                true
            }
        });
        released
    }

    /// Marks every frame a VNAK asks for as due immediately. Returns the
    /// sequence numbers to resend, oldest first. Anything still queued
    /// qualifies, including a frame waiting out its last back-off.
    pub fn vnak(&mut self, iseqno: Seqno, now: Instant) -> Vec<Seqno> {
        let mut resend: Vec<Seqno> = self
            .frames
            .iter_mut()
            .filter(|f| wanted_by_vnak(f.oseqno, iseqno))
            .map(|f| {
                f.next_retry = now + f.retry_delay;
                f.oseqno
            })
            .collect();
        resend.sort_by_key(|s| s.0.wrapping_sub(iseqno.0));
        resend
    }

    /// Drops everything, for teardown.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
