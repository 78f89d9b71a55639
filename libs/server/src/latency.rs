use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::LatencySegment;

/// Piecewise-constant weighted latency distribution anchored at a start
/// time. Pure given `(profile, start_time, now, rng)`, which is what the
/// distribution tests pin with a seeded rng.
pub struct LatencyProfile {
    segments: Vec<LatencySegment>,
    start_time: Instant,
}

impl LatencyProfile {
    pub fn new(segments: Vec<LatencySegment>, start_time: Instant) -> Self {
        assert!(!segments.is_empty(), "latency profile needs segments");
        Self {
            segments,
            start_time,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.segments.iter().map(|segment| segment.duration).sum()
    }

    /// Draws a latency from the segment active at `now`. Past the end of the
    /// profile, the last segment stays active.
    pub fn current_latency(&self, now: Instant, rng: &mut impl Rng) -> Duration {
        Self::draw(self.active_segment(now), rng)
    }

    fn active_segment(&self, now: Instant) -> &LatencySegment {
        let mut t = self.start_time;
        for segment in &self.segments {
            t += segment.duration;
            if t > now {
                return segment;
            }
        }
        self.segments
            .last()
            .expect("profile has at least one segment")
    }

    fn draw(segment: &LatencySegment, rng: &mut impl Rng) -> Duration {
        assert!(segment.weight_sum > 0, "latency segment with zero weight sum");
        let mut r = i64::from(rng.random_range(0..segment.weight_sum));
        for entry in &segment.distribution {
            r -= i64::from(entry.weight);
            if r < 0 {
                return entry.latency;
            }
        }
        unreachable!("weighted draw exceeded the weight sum");
    }
}
