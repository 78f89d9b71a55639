use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stats::Stats;

use crate::config::ServerConfig;
use crate::latency::LatencyProfile;
use crate::tenant_queue::{Request, TenantQueue, WorkOutcome};
use crate::token_bucket::TokenBucket;

/// Granularity of simulated work; every slice is a genuine suspension point.
const WORK_SLICE: Duration = Duration::from_micros(500);

/// Tenant applied to every request when isolation is disabled, and fallback
/// for untagged requests.
const DEFAULT_TENANT: &str = "default";

/// The simulated service: HTTP ingress feeding the tenant queue under
/// token-bucket admission, with a worker pool that sleeps away each request's
/// drawn service latency. The server shuts itself down when its latency
/// profile runs out.
pub struct Server {
    config: ServerConfig,
    stats: Stats,
    listener: TcpListener,
}

struct Ingress {
    queue: Arc<TenantQueue>,
    bucket: Option<Arc<TokenBucket>>,
    stats: Stats,
    enable_isolation: bool,
    cancel: CancellationToken,
}

impl Server {
    /// Binds the listener up front so a bad listen port fails the run before
    /// any traffic starts.
    pub async fn bind(config: ServerConfig, stats: Stats) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| format!("failed to bind listen port {}", config.listen_port))?;
        info!(?config, addr = %listener.local_addr()?, "server created");
        Ok(Self {
            config,
            stats,
            listener,
        })
    }

    /// The address actually bound, which differs from the configured one when
    /// the config asked for port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Serves requests until the profile runs out or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Everything this server spawns hangs off its own child token, so
        // the profile deadline stops this server without touching the rest
        // of the simulation.
        let local = cancel.child_token();

        let start_time = Instant::now();
        let profile = Arc::new(LatencyProfile::new(self.config.profile.clone(), start_time));
        let deadline = start_time + profile.total_duration();

        let queue = Arc::new(TenantQueue::new(self.config.max_queue_size));
        let bucket = self
            .config
            .admission
            .map(|admission| TokenBucket::start(admission, local.clone()));

        for worker_id in 0..self.config.threads {
            tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&profile),
                self.config.queue_timeout,
                self.stats.clone(),
                local.clone(),
            ));
        }

        {
            let local = local.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                debug!("profile complete, shutting down");
                local.cancel();
            });
        }

        let ingress = Arc::new(Ingress {
            queue,
            bucket,
            stats: self.stats.clone(),
            enable_isolation: self.config.enable_isolation,
            cancel: local.clone(),
        });
        let app = Router::new()
            .route("/", get(handle_request))
            .with_state(ingress);

        axum::serve(self.listener, app.into_make_service())
            .with_graceful_shutdown(local.clone().cancelled_owned())
            .await
            .context("server crashed")?;

        info!("server shut down");
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn handle_request(
    State(ingress): State<Arc<Ingress>>,
    headers: HeaderMap,
) -> StatusCode {
    let tenant_id = if ingress.enable_isolation {
        header_str(&headers, "tenant-id").unwrap_or(DEFAULT_TENANT)
    } else {
        DEFAULT_TENANT
    };
    let priority = header_str(&headers, "priority").unwrap_or(DEFAULT_TENANT);

    if let Some(bucket) = &ingress.bucket {
        if !bucket.admit() {
            ingress
                .stats
                .incr(&format!("server.{priority}.processed.throttled"), tenant_id);
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }

    let (rq, outcome) = Request::new(tenant_id);
    let (accepted, depth) = ingress.queue.push(tenant_id, rq);
    if !accepted {
        ingress.stats.incr("server.queue_full", tenant_id);
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    ingress.stats.set("server.queue_size", depth as f64, tenant_id);

    tokio::select! {
        result = outcome => match result {
            Ok(WorkOutcome::Done) => StatusCode::OK,
            Ok(WorkOutcome::QueueTimedOut) => StatusCode::SERVICE_UNAVAILABLE,
            // Worker or queue dropped the request mid-shutdown; the client
            // sees overload either way.
            Err(_) => StatusCode::SERVICE_UNAVAILABLE,
        },
        _ = ingress.cancel.cancelled() => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<TenantQueue>,
    profile: Arc<LatencyProfile>,
    queue_timeout: Duration,
    stats: Stats,
    cancel: CancellationToken,
) {
    debug!(worker_id, "worker started");
    while let Some(rq) = queue.pop(&cancel).await {
        do_work(rq, &profile, queue_timeout, &stats, &cancel).await;
    }
    debug!(worker_id, "worker stopped");
}

/// Simulates servicing one request by sleeping in `WORK_SLICE` steps until
/// the drawn target latency is reached. Cancellation is observed at every
/// slice, so a shutdown drops the request within one `WORK_SLICE`.
async fn do_work(
    mut rq: Request,
    profile: &LatencyProfile,
    queue_timeout: Duration,
    stats: &Stats,
    cancel: &CancellationToken,
) {
    if !queue_timeout.is_zero() && rq.receive_time.elapsed() > queue_timeout {
        stats.incr("server.queue_timeout", &rq.tenant_id);
        let _ = rq.respond.send(WorkOutcome::QueueTimedOut);
        return;
    }

    let target = profile.current_latency(Instant::now(), &mut rand::rng());
    while rq.progress < target {
        tokio::select! {
            _ = tokio::time::sleep(WORK_SLICE) => rq.progress += WORK_SLICE,
            // Shutdown mid-request: drop it unanswered; the ingress handler
            // resolves the hung-up completion channel as overload.
            _ = cancel.cancelled() => return,
        }
    }

    // The receiver may have given up already (client timeout, shutdown);
    // nothing more to do then.
    let _ = rq.respond.send(WorkOutcome::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LatencySegment, TokenBucketConfig, WeightedLatency};

    fn test_config(admission: Option<TokenBucketConfig>) -> ServerConfig {
        let segment = LatencySegment::new(
            vec![WeightedLatency {
                weight: 1,
                latency: Duration::from_millis(1),
            }],
            Duration::from_secs(10),
        )
        .unwrap();
        ServerConfig {
            profile: vec![segment],
            listen_port: 0,
            threads: 4,
            max_queue_size: 64,
            queue_timeout: Duration::ZERO,
            enable_isolation: true,
            admission,
        }
    }

    async fn start_server(
        config: ServerConfig,
        stats: Stats,
        cancel: &CancellationToken,
    ) -> SocketAddr {
        let server = Server::bind(config, stats).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run(cancel.clone()));
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_a_tagged_request() {
        let stats = Stats::new();
        let cancel = CancellationToken::new();
        let addr = start_server(test_config(None), stats.clone(), &cancel).await;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .header("tenant-id", "t1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        // Isolation is on, so the queue gauge lands under the tagged tenant.
        assert!(stats.live_value("server.queue_size", "t1").is_some());

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn isolation_disabled_collapses_tenants() {
        let stats = Stats::new();
        let cancel = CancellationToken::new();
        let mut config = test_config(None);
        config.enable_isolation = false;
        let addr = start_server(config, stats.clone(), &cancel).await;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .header("tenant-id", "t1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert!(stats.live_value("server.queue_size", "default").is_some());
        assert!(stats.live_value("server.queue_size", "t1").is_none());

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admission_rejects_once_the_bucket_is_empty() {
        let stats = Stats::new();
        let cancel = CancellationToken::new();
        let admission = TokenBucketConfig::new(Duration::from_secs(60), 1, 1).unwrap();
        let addr = start_server(test_config(Some(admission)), stats.clone(), &cancel).await;

        let http = reqwest::Client::new();
        let first = http
            .get(format!("http://{addr}/"))
            .header("tenant-id", "t1")
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);

        let second = http
            .get(format!("http://{addr}/"))
            .header("tenant-id", "t1")
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            stats.live_value("server.default.processed.throttled", "t1"),
            Some(1.0)
        );

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_rejects_the_overflow() {
        let stats = Stats::new();
        let cancel = CancellationToken::new();
        let mut config = test_config(None);
        // One busy worker and a tiny queue leave most of a burst nowhere
        // to go.
        config.threads = 1;
        config.max_queue_size = 2;
        config.profile = vec![
            LatencySegment::new(
                vec![WeightedLatency {
                    weight: 1,
                    latency: Duration::from_millis(100),
                }],
                Duration::from_secs(10),
            )
            .unwrap(),
        ];
        let addr = start_server(config, stats.clone(), &cancel).await;

        let http = reqwest::Client::new();
        let mut pending = Vec::new();
        for _ in 0..10 {
            let request = http
                .get(format!("http://{addr}/"))
                .header("tenant-id", "t1")
                .send();
            pending.push(tokio::spawn(request));
        }

        let mut rejected = 0.0;
        for handle in pending {
            let response = handle.await.unwrap().unwrap();
            if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                rejected += 1.0;
            }
        }

        assert!(rejected >= 1.0, "expected queue-full rejections, saw none");
        assert_eq!(stats.live_value("server.queue_full", "t1"), Some(rejected));

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_timeout_rejects_stale_requests() {
        let stats = Stats::new();
        let cancel = CancellationToken::new();
        let mut config = test_config(None);
        // One worker and a long service time back the queue up immediately.
        config.threads = 1;
        config.queue_timeout = Duration::from_millis(5);
        config.profile = vec![
            LatencySegment::new(
                vec![WeightedLatency {
                    weight: 1,
                    latency: Duration::from_millis(200),
                }],
                Duration::from_secs(10),
            )
            .unwrap(),
        ];
        let addr = start_server(config, stats.clone(), &cancel).await;

        let http = reqwest::Client::new();
        let mut pending = Vec::new();
        for _ in 0..8 {
            let request = http
                .get(format!("http://{addr}/"))
                .header("tenant-id", "t1")
                .send();
            pending.push(tokio::spawn(request));
        }

        let mut rejected = 0;
        for handle in pending {
            let response = handle.await.unwrap().unwrap();
            if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                rejected += 1;
            }
        }

        // Everything behind the first request went stale in the queue.
        assert!(rejected >= 1, "expected queue timeouts, saw none");
        assert!(stats.live_value("server.queue_timeout", "t1").is_some());

        cancel.cancel();
    }
}
