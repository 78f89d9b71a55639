use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use hdrhistogram::Histogram;
use num_format::{Locale, ToFormattedString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the sampler snapshots the live values unless told otherwise.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub value: f64,
}

#[derive(Default)]
struct Registry {
    /// Current value of every counter/gauge, keyed by `<name>.<tenant>`.
    live: HashMap<String, f64>,
    /// Accumulated samples per key, appended by the sampler and by direct
    /// measurements. Timestamps within one series are non-decreasing.
    series: HashMap<String, Vec<Sample>>,
}

/// Shared handle to the run's statistics. Every mutation takes the one
/// coarse lock; emission rates are bounded by the simulated workload, so
/// contention here is not a concern.
#[derive(Clone, Default)]
pub struct Stats {
    registry: Arc<Mutex<Registry>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn scoped(key: &str, tenant: &str) -> String {
        format!("{key}.{tenant}")
    }

    /// Replaces the current value of a gauge.
    pub fn set(&self, key: &str, value: f64, tenant: &str) {
        let mut registry = self.registry.lock().expect("stats lock");
        registry.live.insert(Self::scoped(key, tenant), value);
    }

    /// Adds 1.0 to a counter, creating it at zero first if needed.
    pub fn incr(&self, key: &str, tenant: &str) {
        let mut registry = self.registry.lock().expect("stats lock");
        *registry.live.entry(Self::scoped(key, tenant)).or_insert(0.0) += 1.0;
    }

    /// Appends `(now, value)` to the key's series immediately, bypassing the
    /// periodic sampler. Used for event-aligned measurements such as
    /// per-request latencies.
    pub fn direct_measurement(&self, key: &str, value: f64, tenant: &str) {
        let mut registry = self.registry.lock().expect("stats lock");
        let timestamp = SystemTime::now();
        registry
            .series
            .entry(Self::scoped(key, tenant))
            .or_default()
            .push(Sample { timestamp, value });
    }

    /// Snapshots every live value into its series, then resets the value to
    /// zero so successive samples read as per-period deltas.
    pub fn sample(&self) {
        let mut registry = self.registry.lock().expect("stats lock");
        let timestamp = SystemTime::now();
        let Registry { live, series } = &mut *registry;
        for (key, value) in live.iter_mut() {
            series
                .entry(key.clone())
                .or_default()
                .push(Sample { timestamp, value: *value });
            *value = 0.0;
        }
    }

    /// Spawns the periodic sampler. It takes one final snapshot when `cancel`
    /// fires so the tail of the run is not lost.
    pub fn start_sampling(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // throw away first immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => stats.sample(),
                    _ = cancel.cancelled() => {
                        stats.sample();
                        debug!("sampler stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Current live value of a counter/gauge, for assertions.
    pub fn live_value(&self, key: &str, tenant: &str) -> Option<f64> {
        let registry = self.registry.lock().expect("stats lock");
        registry.live.get(&Self::scoped(key, tenant)).copied()
    }

    /// Recorded series values for a key, in append order.
    pub fn series_values(&self, key: &str, tenant: &str) -> Vec<f64> {
        let registry = self.registry.lock().expect("stats lock");
        registry
            .series
            .get(&Self::scoped(key, tenant))
            .map(|samples| samples.iter().map(|s| s.value).collect())
            .unwrap_or_default()
    }

    /// Wipes and recreates `folder`, then writes one `<key>.csv` per series
    /// with `<unix_nanos>,<value>` lines. The series are snapshotted under
    /// the lock and written without holding it.
    pub fn dump_to_folder(&self, folder: &Path) -> anyhow::Result<()> {
        let snapshot: HashMap<String, Vec<Sample>> = {
            let registry = self.registry.lock().expect("stats lock");
            registry.series.clone()
        };

        if folder.exists() {
            std::fs::remove_dir_all(folder)
                .with_context(|| format!("failed to clear stats folder {}", folder.display()))?;
        }
        std::fs::create_dir_all(folder)
            .with_context(|| format!("failed to create stats folder {}", folder.display()))?;

        for (key, samples) in &snapshot {
            let path = folder.join(format!("{key}.csv"));
            let mut contents = String::with_capacity(samples.len() * 32);
            for sample in samples {
                let nanos = sample
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                contents.push_str(&format!("{},{:.6}\n", nanos, sample.value));
            }
            std::fs::write(&path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        debug!(series = snapshot.len(), "stats dumped");
        Ok(())
    }

    /// Prints a percentile summary of every latency series. Values are
    /// interpreted as seconds and reported in microseconds.
    pub fn print_summary(&self) {
        let snapshot: Vec<(String, Vec<Sample>)> = {
            let registry = self.registry.lock().expect("stats lock");
            let mut entries: Vec<_> = registry
                .series
                .iter()
                .filter(|(key, _)| key.contains(".latency"))
                .map(|(key, samples)| (key.clone(), samples.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        for (key, samples) in snapshot {
            let mut hist = Histogram::<u64>::new_with_max(60_000_000, 3)
                .expect("histogram bounds are static");
            for sample in &samples {
                let micros = (sample.value * 1e6) as u64;
                hist.record(micros.min(hist.high()))
                    .expect("value clamped to histogram range");
            }
            if hist.is_empty() {
                continue;
            }

            println!("--- {key} ---");
            println!(
                "Requests: {}",
                hist.len().to_formatted_string(&Locale::en)
            );
            println!(
                "Latency: avg {} us, max {} us",
                (hist.mean() as u64).to_formatted_string(&Locale::en),
                hist.max().to_formatted_string(&Locale::en)
            );
            print!("Percentiles: ");
            for p in [50.0, 90.0, 99.0] {
                print!(
                    "P{}: {} us, ",
                    p,
                    hist.value_at_quantile(p / 100.0)
                        .to_formatted_string(&Locale::en)
                );
            }
            println!();
        }
    }
}
