//! Time-series statistics for a single simulation run: named counters and
//! gauges sampled on a fixed period, event-aligned direct measurements, and a
//! CSV dump for offline plotting.

mod stats;

pub use stats::{DEFAULT_SAMPLE_PERIOD, Sample, Stats};
