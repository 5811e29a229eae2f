//! Wall-clock playback position for looping AVI videos.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MICROS_PER_SEC: u128 = 1_000_000;

/// Maps wall-clock time to a frame index of a looping video.
///
/// All clients watching the same video share one clock, so they see the
/// same frame at the same instant. The anchor is moved forward whenever
/// playback wraps, keeping elapsed time bounded.
#[derive(Debug)]
pub struct PlaybackClock {
    fps: NonZeroU32,
    total_frames: NonZeroU32,
    anchor: Mutex<Instant>,
}

impl PlaybackClock {
    pub fn new(fps: NonZeroU32, total_frames: NonZeroU32, anchor: Instant) -> Self {
        Self {
            fps,
            total_frames,
            anchor: Mutex::new(anchor),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps.get()
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames.get()
    }

    /// Instant that currently corresponds to frame 0.
    pub fn anchor(&self) -> Instant {
        *self.anchor.lock()
    }

    /// Frame due at `now`.
    ///
    /// Once a full loop has elapsed the anchor is moved to the start of the
    /// current loop, offset so that `now` still maps to the same frame.
    /// Calls with the same `now` therefore return the same frame. A `now`
    /// earlier than the anchor restarts playback at frame 0.
    pub fn frame_at(&self, now: Instant) -> u32 {
        let fps = u128::from(self.fps.get());
        let total = u128::from(self.total_frames.get());
        let mut anchor = self.anchor.lock();

        let Some(elapsed) = now.checked_duration_since(*anchor) else {
            tracing::trace!("playback anchor ahead of clock, restarting at frame 0");
            *anchor = now;
            return 0;
        };

        let frames = elapsed.as_micros() * fps / MICROS_PER_SEC;
        let frame = frames % total;
        if frames >= total {
            let into_loop = (frame * MICROS_PER_SEC).div_ceil(fps);
            let into_loop = Duration::from_micros(u64::try_from(into_loop).unwrap_or(u64::MAX));
            *anchor = now.checked_sub(into_loop).unwrap_or(now);
        }
        // `frame < total`, which itself fits a u32.
        frame as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(fps: u32, total: u32, anchor: Instant) -> PlaybackClock {
        PlaybackClock::new(
            NonZeroU32::new(fps).unwrap(),
            NonZeroU32::new(total).unwrap(),
            anchor,
        )
    }

    #[test]
    fn same_frame_within_interval() {
        let start = Instant::now();
        let c = clock(30, 90, start);
        assert_eq!(c.frame_at(start), 0);
        assert_eq!(c.frame_at(start + Duration::from_millis(5)), 0);
        assert_eq!(c.frame_at(start + Duration::from_millis(33)), 0);
        assert_eq!(c.frame_at(start + Duration::from_millis(34)), 1);
        assert_eq!(c.frame_at(start + Duration::from_millis(1000)), 30);
    }

    #[test]
    fn repeated_calls_are_idempotent() {
        let start = Instant::now();
        let c = clock(30, 90, start);
        let now = start + Duration::from_millis(1234);
        let first = c.frame_at(now);
        for _ in 0..10 {
            assert_eq!(c.frame_at(now), first);
        }
        assert_eq!(c.anchor(), start);
    }

    #[test]
    fn wraps_after_full_loop() {
        let start = Instant::now();
        let c = clock(30, 90, start);
        let loop_end = start + Duration::from_secs(3);
        assert_eq!(c.frame_at(loop_end), 0);
        assert_eq!(c.anchor(), loop_end);
        assert_eq!(c.frame_at(loop_end + Duration::from_millis(40)), 1);
        assert_eq!(c.frame_at(loop_end + Duration::from_secs(3)), 0);
    }

    #[test]
    fn resync_keeps_position_within_loop() {
        let start = Instant::now();
        let c = clock(30, 90, start);
        let now = start + Duration::from_millis(3500);
        assert_eq!(c.frame_at(now), 15);
        assert_eq!(c.anchor(), now - Duration::from_millis(500));
        assert_eq!(c.frame_at(now), 15);
        assert_eq!(c.frame_at(now + Duration::from_millis(34)), 16);
    }

    #[test]
    fn resync_with_inexact_frame_duration() {
        let start = Instant::now();
        let c = clock(7, 5, start);
        let now = start + Duration::from_millis(1150);
        let frame = c.frame_at(now);
        assert_eq!(frame, 3);
        for _ in 0..3 {
            assert_eq!(c.frame_at(now), frame);
        }
    }

    #[test]
    fn anchor_in_future_restarts() {
        let now = Instant::now();
        let c = clock(25, 10, now + Duration::from_secs(10));
        assert_eq!(c.frame_at(now), 0);
        assert_eq!(c.anchor(), now);
        assert_eq!(c.frame_at(now + Duration::from_millis(80)), 2);
    }
}
