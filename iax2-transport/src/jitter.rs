//! The per-call jitter buffer.
//!
//! Media frames go in keyed by their reconstructed timestamp; reads come out
//! paced against a receive clock ("rxcore") pinned when the first frame
//! arrives. The algorithm here is deliberately plain: a sorted map plus a
//! smoothed delay target. The contract is what matters: a read yields the
//! frame once it is due, an interpolation marker when the due frame is
//! missing, and a drop notification when the head frame is too late to
//! play.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::debug;

/// Hard cap on buffered audio (ms).
pub const DEFAULT_MAX_JITTERBUF_MS: u32 = 1_000;

/// A timestamp jump that forces a resync instead of being treated as jitter.
pub const DEFAULT_RESYNC_THRESHOLD_MS: u32 = 1_000;

/// Consecutive interpolations tolerated before the buffer reports starvation.
pub const DEFAULT_MAX_CONTIG_INTERP: u32 = 10;

/// Headroom added on top of measured jitter (ms).
pub const DEFAULT_TARGET_EXTRA_MS: u32 = 40;

/// Gap between consecutive voice frames that flushes and resyncs the buffer.
pub const TS_GAP_FOR_RESYNC_MS: u32 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub max_jitterbuf_ms: u32,
    pub resync_threshold_ms: u32,
    pub max_contig_interp: u32,
    pub target_extra_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            max_jitterbuf_ms: DEFAULT_MAX_JITTERBUF_MS,
            resync_threshold_ms: DEFAULT_RESYNC_THRESHOLD_MS,
            max_contig_interp: DEFAULT_MAX_CONTIG_INTERP,
            target_extra_ms: DEFAULT_TARGET_EXTRA_MS,
        }
    }
}

/// What kind of media a buffered frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Voice,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterFrame {
    pub ts: u32,
    pub kind: MediaKind,
    /// Frame duration in ms, for pacing the next read.
    pub len_ms: u32,
    pub data: Vec<u8>,
}

/// Outcome of a read.
#[derive(Debug, PartialEq, Eq)]
pub enum JitterVerdict {
    /// A frame is due; play it.
    Ok(JitterFrame),
    /// The due frame is missing; synthesize `len_ms` of audio.
    Interp,
    /// The head frame missed its whole play window; discard it and read
    /// again.
    Drop(JitterFrame),
    /// Nothing is due yet.
    NoFrame,
    /// The stream has gone quiet; nothing buffered at all.
    Empty,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JitterStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped: u64,
    pub out_of_order: u64,
    pub interpolations: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    frames: BTreeMap<u32, JitterFrame>,
    /// Wallclock anchor for the playout clock.
    rxcore: Option<Instant>,
    /// Timestamp value the playout clock read at `rxcore`.
    rx_bias: i64,
    /// Current playout delay (ms) added on top of a frame's timestamp.
    delay_ms: u32,
    /// Next timestamp the reader expects, for interpolation decisions.
    next_ts: Option<u32>,
    last_in_ts: Option<u32>,
    highest_in_ts: u32,
    contig_interp: u32,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            frames: BTreeMap::new(),
            rxcore: None,
            rx_bias: 0,
            delay_ms: config.target_extra_ms,
            next_ts: None,
            last_in_ts: None,
            highest_in_ts: 0,
            contig_interp: 0,
            stats: JitterStats::default(),
        }
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Ingests one media frame with its reconstructed 32-bit timestamp.
    pub fn put(&mut self, frame: JitterFrame, now: Instant) {
        self.stats.frames_in += 1;

        if let Some(last) = self.last_in_ts {
            let gap = frame.ts.abs_diff(last);
            // A sudden jump is a stream discontinuity, not jitter. The 5 s
            // voice-gap flush still applies when resync is configured off.
            if gap > self.config.resync_threshold_ms.min(TS_GAP_FOR_RESYNC_MS) {
                debug!(gap, "timestamp gap beyond resync threshold, flushing");
                self.resync(now, frame.ts);
            }
            if frame.ts < last {
                self.stats.out_of_order += 1;
            }
        }

        if self.rxcore.is_none() {
            self.resync(now, frame.ts);
        }

        // Too old to schedule: behind what the reader already consumed.
        if let Some(next) = self.next_ts {
            if frame.ts < next.saturating_sub(self.config.max_jitterbuf_ms) {
                self.stats.dropped += 1;
                self.last_in_ts = Some(frame.ts);
                return;
            }
        }

        self.last_in_ts = Some(frame.ts);
        self.highest_in_ts = self.highest_in_ts.max(frame.ts);
        self.frames.insert(frame.ts, frame);

        // Enforce the buffered-span cap by shedding from the head.
        while let (Some((&first, _)), Some((&last, _))) =
            (self.frames.first_key_value(), self.frames.last_key_value())
        {
            if last - first <= self.config.max_jitterbuf_ms {
                break;
            }
            self.frames.remove(&first);
            self.stats.dropped += 1;
        }
    }

    /// Milliseconds until the next buffered frame is due, or `None` when the
    /// buffer holds nothing.
    pub fn next_due_in(&self, now: Instant) -> Option<i64> {
        let (&ts, _) = self.frames.first_key_value()?;
        Some(i64::from(ts) + i64::from(self.delay_ms) - self.playout_ms(now))
    }

    /// Reads the next frame. `interp_len_ms` is the interval the caller will
    /// fill when interpolation is called for.
    pub fn get(&mut self, now: Instant, interp_len_ms: u32) -> JitterVerdict {
        if self.rxcore.is_none() {
            return JitterVerdict::Empty;
        }
        let playout = self.playout_ms(now);

        if let Some((&ts, _)) = self.frames.first_key_value() {
            let due = i64::from(ts) + i64::from(self.delay_ms);
            // A head frame further behind than the whole buffer span is not
            // late audio, it is dead audio; hand it back as a drop so the
            // reader advances instead of playing it.
            if due + i64::from(self.config.max_jitterbuf_ms) < playout {
                if let Some(frame) = self.frames.remove(&ts) {
                    self.stats.dropped += 1;
                    self.contig_interp = 0;
                    self.next_ts = Some(ts + frame.len_ms.max(1));
                    return JitterVerdict::Drop(frame);
                }
            }
            if due <= playout {
                if let Some(frame) = self.frames.remove(&ts) {
                    self.stats.frames_out += 1;
                    self.contig_interp = 0;
                    self.next_ts = Some(ts + frame.len_ms.max(1));
                    return JitterVerdict::Ok(frame);
                }
            }
            // Head frame exists but is early; was an intermediate frame lost?
            if let Some(next) = self.next_ts {
                if i64::from(next) + i64::from(self.delay_ms) <= playout && next < ts {
                    return self.interpolate(interp_len_ms);
                }
            }
            return JitterVerdict::NoFrame;
        }

        // Nothing buffered. If the reader is mid-stream, the due frame is
        // lost; otherwise the stream is simply quiet.
        match self.next_ts {
            Some(next)
                if i64::from(next) + i64::from(self.delay_ms) <= playout
                    && next <= self.highest_in_ts.wrapping_add(self.config.max_jitterbuf_ms) =>
            {
                self.interpolate(interp_len_ms)
            }
            Some(_) => JitterVerdict::NoFrame,
            None => JitterVerdict::Empty,
        }
    }

    fn interpolate(&mut self, interp_len_ms: u32) -> JitterVerdict {
        self.contig_interp += 1;
        if self.contig_interp > self.config.max_contig_interp {
            // Starved past tolerance; stop synthesizing and go quiet until
            // real media restarts the stream.
            self.next_ts = None;
            self.contig_interp = 0;
            return JitterVerdict::Empty;
        }
        self.stats.interpolations += 1;
        if let Some(next) = self.next_ts {
            self.next_ts = Some(next + interp_len_ms.max(1));
        }
        JitterVerdict::Interp
    }

    /// Drops everything and re-pins rxcore so `first_ts` plays after the
    /// configured headroom.
    fn resync(&mut self, now: Instant, first_ts: u32) {
        self.frames.clear();
        self.delay_ms = self.config.target_extra_ms;
        self.next_ts = Some(first_ts);
        self.highest_in_ts = first_ts;
        self.contig_interp = 0;
        // The playout clock restarts reading `first_ts` at this instant, so
        // the frame that triggered the resync plays after the headroom.
        self.rxcore = Some(now);
        self.rx_bias = i64::from(first_ts);
    }

    fn playout_ms(&self, now: Instant) -> i64 {
        match self.rxcore {
            Some(core) => now.duration_since(core).as_millis() as i64 + self.rx_bias,
            None => 0,
        }
    }
}
