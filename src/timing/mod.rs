// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Engine clock and tempo mapping.
//!
//! All musical time in MIDIO is measured in ticks at a fixed resolution of
//! 480 ticks per quarter note; all wall-clock time is measured in
//! milliseconds since the engine clock was created. The two are related
//! through a single anchored linear mapping that the output scheduler
//! re-anchors whenever the tempo or the tempo scale changes, so the
//! mapping stays continuous in both domains.

use std::time::{Duration, Instant};

/// Ticks per quarter note, fixed.
pub const TICKS_PER_QUARTER: u32 = 480;

/// Milliseconds per tick, times beats per minute.
///
/// At 125 bpm a quarter note lasts 480 ms, so one tick is exactly one
/// millisecond; the general relation is `ms_per_tick = 125 / bpm`.
const TICK_MS_FACTOR: f64 = 60_000.0 / TICKS_PER_QUARTER as f64;

/// Monotonic millisecond clock, zeroed at creation.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1e3
    }

    /// The instant corresponding to an absolute millisecond reading.
    ///
    /// Used as the deadline of timed condition waits: deriving the deadline
    /// from the same `Instant` base guarantees that a wait reporting
    /// timeout never wakes before `now_ms()` has reached the target.
    pub fn instant_at_ms(&self, ms: f64) -> Instant {
        // clamp to keep Duration construction defined for huge wake times
        let ms = ms.clamp(0.0, 1e15);
        self.start + Duration::from_secs_f64(ms / 1e3)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative tick/millisecond mapping.
///
/// For any tick `T`:
/// `wall(T) = anchor_ms + (T - anchor_ticks) * 125 / (bpm * scale)`.
///
/// `scale` may be zero ("paused"); the mapping then yields infinities and
/// the scheduler sleeps until the map changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoMap {
    /// Wall-clock time of the last tempo or scale change, in milliseconds.
    pub anchor_ms: f64,
    /// Tick time of the last tempo or scale change.
    pub anchor_ticks: f64,
    /// Tempo in beats (quarter notes) per minute.
    pub bpm: f64,
    /// Non-negative multiplier applied to the tempo.
    pub scale: f64,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self {
            anchor_ms: 0.0,
            anchor_ticks: 0.0,
            bpm: 125.0,
            scale: 1.0,
        }
    }
}

impl TempoMap {
    /// Tempo actually driving dispatch (bpm times scale).
    pub fn effective_bpm(&self) -> f64 {
        self.bpm * self.scale
    }

    /// Convert a tick time to milliseconds. Yields an infinity when the
    /// effective tempo is zero.
    pub fn ticks_to_msecs(&self, ticks: f64) -> f64 {
        (ticks - self.anchor_ticks) * TICK_MS_FACTOR / self.effective_bpm() + self.anchor_ms
    }

    /// Convert a millisecond time to ticks.
    pub fn msecs_to_ticks(&self, msecs: f64) -> f64 {
        (msecs - self.anchor_ms) * self.effective_bpm() / TICK_MS_FACTOR + self.anchor_ticks
    }

    /// Change the tempo scale, re-anchoring at the current wall time so the
    /// mapping is continuous (no tick jump).
    pub fn rescale(&mut self, now_ms: f64, scale: f64) {
        self.anchor_ticks = self.msecs_to_ticks(now_ms);
        self.anchor_ms = now_ms;
        self.scale = scale;
    }

    /// Apply a tempo change at a known point of the mapping, as dispatched
    /// tempo meta-events do.
    pub fn change_tempo(&mut self, at_ms: f64, at_ticks: f64, bpm: f64) {
        self.anchor_ms = at_ms;
        self.anchor_ticks = at_ticks;
        self.bpm = bpm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping_is_one_ms_per_tick() {
        let map = TempoMap::default();
        assert_eq!(map.ticks_to_msecs(480.0), 480.0);
        assert_eq!(map.msecs_to_ticks(480.0), 480.0);
    }

    #[test]
    fn test_round_trip() {
        let mut map = TempoMap::default();
        map.change_tempo(100.0, 250.0, 93.5);
        for t in [0.0, 1.0, 480.0, 12345.6] {
            let back = map.msecs_to_ticks(map.ticks_to_msecs(t));
            assert!((back - t).abs() < 1e-9, "round trip failed for {}", t);
        }
    }

    #[test]
    fn test_zero_scale_pauses() {
        let mut map = TempoMap::default();
        map.rescale(1000.0, 0.0);
        assert!(map.ticks_to_msecs(2000.0).is_infinite());
        // time stops advancing in the tick domain
        assert_eq!(map.msecs_to_ticks(5000.0), map.anchor_ticks);
    }

    #[test]
    fn test_rescale_is_continuous() {
        let mut map = TempoMap::default();
        let before = map.msecs_to_ticks(600.0);
        map.rescale(600.0, 2.0);
        let after = map.msecs_to_ticks(600.0);
        assert!((before - after).abs() < 1e-9);
        // and twice as fast afterwards
        assert!((map.msecs_to_ticks(700.0) - (after + 200.0)).abs() < 1e-9);
    }

    #[test]
    fn test_tempo_meta_math() {
        let mut map = TempoMap::default();
        // 1,000,000 us per quarter = 60 bpm
        map.change_tempo(0.0, 0.0, 6e7 / 1_000_000.0);
        assert_eq!(map.bpm, 60.0);
        // one quarter note now lasts a second
        assert!((map.ticks_to_msecs(480.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(clock.instant_at_ms(50.0) > clock.instant_at_ms(10.0));
    }
}
