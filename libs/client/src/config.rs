use std::time::Duration;

/// One step of the offered-load schedule: `rps` requests per second for
/// `duration`.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadStage {
    pub rps: u32,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub workload: Vec<WorkloadStage>,
    /// Hard per-request deadline enforced by the transport.
    pub request_timeout: Duration,
    pub target: Target,
    /// Extra attempts per logical request after a retryable failure.
    pub retry_count: u32,
    pub tenant_id: String,
    /// Carried through to stats keys; not consulted by any scheduler.
    pub priority: String,
}

impl ClientConfig {
    pub fn total_workload_duration(&self) -> Duration {
        self.workload.iter().map(|stage| stage.duration).sum()
    }
}
