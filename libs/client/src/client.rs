use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stats::Stats;

use crate::config::{ClientConfig, WorkloadStage};
use crate::transport::{Reply, Transport};

/// Paced emitters per stage. Each emitter offers `rps / NUM_WORKERS`
/// requests per second, so the stage total matches the configured rate.
const NUM_WORKERS: u32 = 128;

/// Stage-driven request generator. Stages run sequentially; within a stage,
/// `NUM_WORKERS` emitters tick on a shared spacing with a uniform phase
/// shift each, so their wake-ups stay de-correlated.
pub struct Client<T: Transport> {
    config: ClientConfig,
    stats: Stats,
    transport: T,
}

impl<T: Transport> Client<T> {
    pub fn new(config: ClientConfig, stats: Stats, transport: T) -> Self {
        info!(?config, "client created");
        Self {
            config,
            stats,
            transport,
        }
    }

    pub fn total_workload_duration(&self) -> Duration {
        self.config.total_workload_duration()
    }

    /// Runs every workload stage in order, returning at the end of the last
    /// stage or as soon as `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        for (index, stage) in self.config.workload.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            info!(
                stage = index,
                rps = stage.rps,
                duration = ?stage.duration,
                "starting workload stage"
            );
            Self::run_stage(&self, *stage, &cancel).await;
        }
        debug!("client finished");
    }

    async fn run_stage(this: &Arc<Self>, stage: WorkloadStage, cancel: &CancellationToken) {
        let stage_cancel = cancel.child_token();
        let spacing = Duration::from_secs_f64(f64::from(NUM_WORKERS) / f64::from(stage.rps));

        let mut emitters: Vec<JoinHandle<()>> = Vec::with_capacity(NUM_WORKERS as usize);
        for _ in 0..NUM_WORKERS {
            let client = Arc::clone(this);
            let jitter = rand::rng().random_range(Duration::ZERO..spacing);
            emitters.push(tokio::spawn(client.emit(
                stage,
                spacing,
                jitter,
                stage_cancel.clone(),
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(stage.duration) => {}
            _ = cancel.cancelled() => {}
        }
        stage_cancel.cancel();
        for emitter in emitters {
            let _ = emitter.await;
        }
    }

    /// One paced emitter: phase-shift sleep, then one request per tick until
    /// the stage ends.
    async fn emit(
        self: Arc<Self>,
        stage: WorkloadStage,
        spacing: Duration,
        jitter: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = cancel.cancelled() => return,
        }

        let mut ticker = tokio::time::interval(spacing);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.stats
                        .set("client.rps", f64::from(stage.rps), &self.config.tenant_id);
                    let client = Arc::clone(&self);
                    tokio::spawn(client.send_workload_request(self.config.retry_count));
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// One logical request plus its bounded immediate retries. Every attempt
    /// is counted; only rejected or timed-out attempts are retried.
    async fn send_workload_request(self: Arc<Self>, retry_budget: u32) {
        let tenant = self.config.tenant_id.as_str();
        let mut budget = retry_budget;
        loop {
            self.stats.incr("client.rq.total.count", tenant);
            let started = Instant::now();
            match self.transport.issue(tenant, &self.config.priority).await {
                Reply::Ok => {
                    self.stats.direct_measurement(
                        "client.rq.latency",
                        started.elapsed().as_secs_f64(),
                        tenant,
                    );
                    self.stats.incr("client.rq.success.count", tenant);
                    return;
                }
                Reply::Overloaded => {
                    self.stats.direct_measurement("client.rq.503", 1.0, tenant);
                    self.stats.incr("client.rq.failure.count", tenant);
                }
                Reply::TimedOut => {
                    self.stats
                        .direct_measurement("client.rq.timeout", 1.0, tenant);
                    self.stats.incr("client.rq.failure.count", tenant);
                }
                Reply::TransportError => {
                    self.stats.incr("client.rq.failure.count", tenant);
                }
                Reply::Unexpected(status) => {
                    panic!("unexpected response status {status}");
                }
            }
            if budget == 0 {
                return;
            }
            budget -= 1;
        }
    }
}
