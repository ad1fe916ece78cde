//! Timestamp generation and reconstruction.
//!
//! Outbound frames carry a 32-bit millisecond timestamp relative to the
//! call's start. Voice timestamps ride a predictor seeded from the frame
//! cadence so silence suppression and scheduling jitter do not produce
//! overlapping or regressing media timestamps. Mini frames compress the
//! timestamp to 16 bits (15 for video); the receive side re-extends them
//! against the last full frame seen.

use std::time::Instant;

/// Divergence between predicted and measured voice timestamps that forces a
/// predictor reseed.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 640;

/// Rollover detection threshold for 16-bit audio mini timestamps.
const AUDIO_WRAP_THRESHOLD_MS: i64 = 50_000;

/// Rollover detection threshold for 15-bit video mini timestamps.
const VIDEO_WRAP_THRESHOLD_MS: i64 = 25_000;

/// Outbound timestamp clock for one call.
#[derive(Debug)]
pub struct TxClock {
    /// Instant the call's timestamp space is measured from.
    epoch: Option<Instant>,
    /// Accumulated drift correction applied to the wallclock reading (ms).
    drift_ms: i64,
    /// Predicted timestamp of the next voice frame.
    predicted: Option<u32>,
    last_sent: u32,
    sent_any: bool,
    /// Cleared by CNG or non-voice media; the next voice frame reseeds.
    voice_active: bool,
}

impl Default for TxClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TxClock {
    pub fn new() -> Self {
        Self {
            epoch: None,
            drift_ms: 0,
            predicted: None,
            last_sent: 0,
            sent_any: false,
            voice_active: false,
        }
    }

    /// Pins the timestamp epoch. Called implicitly by the first frame.
    pub fn start(&mut self, now: Instant) {
        if self.epoch.is_none() {
            self.epoch = Some(now);
        }
    }

    pub fn last_sent(&self) -> u32 {
        self.last_sent
    }

    fn wallclock_ms(&mut self, now: Instant) -> i64 {
        let epoch = *self.epoch.get_or_insert(now);
        now.duration_since(epoch).as_millis() as i64 + self.drift_ms
    }

    /// Timestamp for a voice frame of `frame_ms` duration.
    pub fn voice_ts(&mut self, now: Instant, frame_ms: u32) -> u32 {
        let ms = self.wallclock_ms(now);
        let frame_ms = frame_ms.max(1);

        let predicted = match self.predicted {
            Some(p) if self.voice_active => p,
            _ => {
                // Fresh stream (or resumed after silence): seek to wallclock,
                // rounded up to a frame boundary so intervals stay aligned.
                let seeded = round_up(ms.max(0) as u32, frame_ms);
                self.voice_active = true;
                seeded
            }
        };

        let gap = ms - i64::from(predicted);
        let ts = if gap.abs() > MAX_TIMESTAMP_SKEW_MS {
            round_up(ms.max(0) as u32, frame_ms)
        } else {
            // Let the predictor drift a tenth of the way toward measured
            // time each frame.
            (i64::from(predicted) + gap / 10).max(0) as u32
        };

        let ts = if self.sent_any {
            ts.max(self.last_sent.wrapping_add(1))
        } else {
            ts
        };
        self.predicted = Some(ts + frame_ms);
        self.last_sent = ts;
        self.sent_any = true;
        ts
    }

    /// Timestamp for anything that is not voice media. Keeps the stream
    /// monotonic with a minimum 3 ms step.
    pub fn nonvoice_ts(&mut self, now: Instant) -> u32 {
        let ms = self.wallclock_ms(now).max(0) as u32;
        let ts = if self.sent_any && ms <= self.last_sent {
            self.last_sent + 3
        } else {
            ms
        };
        self.last_sent = ts;
        self.sent_any = true;
        ts
    }

    /// Called when a CNG or non-voice frame interrupts the media stream.
    pub fn mark_silent(&mut self) {
        self.voice_active = false;
    }
}

fn round_up(value: u32, step: u32) -> u32 {
    value.div_ceil(step) * step
}

/// Inbound timestamp reconstruction for one call.
#[derive(Debug, Default)]
pub struct RxClock {
    /// Timestamp of the last full frame received.
    last_full_ts: u32,
}

impl RxClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_full_ts(&self) -> u32 {
        self.last_full_ts
    }

    /// Records a full frame's 32-bit timestamp.
    pub fn on_full_frame(&mut self, ts: u32) {
        self.last_full_ts = ts;
    }

    /// Re-extends a 16-bit audio mini timestamp.
    pub fn extend_audio(&self, ts16: u16) -> u32 {
        let last = i64::from(self.last_full_ts);
        let mut ts = (last & !0xFFFF) | i64::from(ts16);
        if ts < last - AUDIO_WRAP_THRESHOLD_MS {
            ts += 0x1_0000;
        } else if ts > last + AUDIO_WRAP_THRESHOLD_MS {
            ts -= 0x1_0000;
        }
        ts.max(0) as u32
    }

    /// Re-extends a 15-bit video mini timestamp.
    pub fn extend_video(&self, ts15: u16) -> u32 {
        let last = i64::from(self.last_full_ts);
        let mut ts = (last & !0x7FFF) | i64::from(ts15 & 0x7FFF);
        if ts < last - VIDEO_WRAP_THRESHOLD_MS {
            ts += 0x8000;
        } else if ts > last + VIDEO_WRAP_THRESHOLD_MS {
            ts -= 0x8000;
        }
        ts.max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn voice_stream_follows_cadence() {
        let start = Instant::now();
        let mut clock = TxClock::new();
        let t0 = clock.voice_ts(start + Duration::from_millis(20), 20);
        let t1 = clock.voice_ts(start + Duration::from_millis(40), 20);
        let t2 = clock.voice_ts(start + Duration::from_millis(61), 20);
        assert_eq!(t1 - t0, 20);
        assert_eq!(t2 - t1, 20);
    }

    #[test]
    fn large_skew_reseeds_on_frame_boundary() {
        let start = Instant::now();
        let mut clock = TxClock::new();
        clock.voice_ts(start, 20);
        // Sender stalls for two seconds without marking silence.
        let ts = clock.voice_ts(start + Duration::from_millis(2010), 20);
        assert_eq!(ts % 20, 0);
        assert!(ts >= 2010);
    }

    #[test]
    fn nonvoice_keeps_minimum_step() {
        let start = Instant::now();
        let mut clock = TxClock::new();
        let a = clock.nonvoice_ts(start);
        let b = clock.nonvoice_ts(start);
        assert!(b >= a + 3);
    }

    #[test]
    fn audio_extension_simple() {
        let mut rx = RxClock::new();
        rx.on_full_frame(0x0002_0000);
        assert_eq!(rx.extend_audio(0x1234), 0x0002_1234);
    }

    #[test]
    fn audio_extension_rolls_forward() {
        let mut rx = RxClock::new();
        // Last full frame just before a 16-bit boundary; mini arrives after.
        rx.on_full_frame(0x0001_FFF0);
        assert_eq!(rx.extend_audio(0x0010), 0x0002_0010);
    }

    #[test]
    fn audio_extension_rolls_backward() {
        let mut rx = RxClock::new();
        // Full frame just after the boundary, late mini from before it.
        rx.on_full_frame(0x0002_0005);
        assert_eq!(rx.extend_audio(0xFFF0), 0x0001_FFF0);
    }

    #[test]
    fn video_extension_uses_15_bits() {
        let mut rx = RxClock::new();
        rx.on_full_frame(0x0000_7FF0);
        assert_eq!(rx.extend_video(0x0010), 0x0000_8010);
    }
}
