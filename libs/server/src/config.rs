use std::time::Duration;

use anyhow::bail;

/// One entry of a latency distribution: `latency` is drawn with probability
/// `weight / weight_sum` of its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedLatency {
    pub weight: u32,
    pub latency: Duration,
}

/// A contiguous stretch of simulated time during which the service-latency
/// distribution is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySegment {
    pub distribution: Vec<WeightedLatency>,
    pub weight_sum: u32,
    pub duration: Duration,
}

impl LatencySegment {
    pub fn new(distribution: Vec<WeightedLatency>, duration: Duration) -> anyhow::Result<Self> {
        if distribution.is_empty() {
            bail!("latency segment needs a non-empty distribution");
        }
        if duration.is_zero() {
            bail!("latency segment duration must be positive");
        }
        let mut weight_sum: u32 = 0;
        for entry in &distribution {
            if entry.weight == 0 {
                bail!("latency weights must be positive");
            }
            weight_sum = weight_sum
                .checked_add(entry.weight)
                .ok_or_else(|| anyhow::anyhow!("latency weights overflow"))?;
        }
        Ok(Self {
            distribution,
            weight_sum,
            duration,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub interval: Duration,
    pub max_tokens: u64,
    pub refresh_amount: u64,
}

impl TokenBucketConfig {
    pub fn new(interval: Duration, max_tokens: u64, refresh_amount: u64) -> anyhow::Result<Self> {
        if interval.is_zero() {
            bail!("token bucket interval must be positive");
        }
        if refresh_amount == 0 {
            bail!("token bucket refresh amount must be positive");
        }
        if max_tokens < refresh_amount {
            bail!("token bucket max tokens must be at least the refresh amount");
        }
        Ok(Self {
            interval,
            max_tokens,
            refresh_amount,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Latency segments played back in order; the profile's total duration is
    /// also the server's lifetime.
    pub profile: Vec<LatencySegment>,
    /// Port to listen on. 0 binds an OS-assigned port (see
    /// [`crate::Server::local_addr`]).
    pub listen_port: u16,
    /// Number of concurrent workers servicing the queue.
    pub threads: usize,
    /// Per-tenant queue capacity.
    pub max_queue_size: usize,
    /// Requests older than this when dequeued are rejected. Zero disables
    /// the check.
    pub queue_timeout: Duration,
    /// When false, every request is collapsed onto the `default` tenant.
    pub enable_isolation: bool,
    /// Admission limiter; `None` admits everything.
    pub admission: Option<TokenBucketConfig>,
}

impl ServerConfig {
    pub fn total_profile_duration(&self) -> Duration {
        self.profile.iter().map(|segment| segment.duration).sum()
    }
}
