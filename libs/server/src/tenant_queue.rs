use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What a worker reports back through the request's completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Simulated service finished.
    Done,
    /// The request sat in the queue longer than the configured queue timeout.
    QueueTimedOut,
}

/// One in-flight request. Owned by the queue while queued, then by a worker
/// until the completion channel fires.
#[derive(Debug)]
pub struct Request {
    pub receive_time: Instant,
    pub progress: Duration,
    pub respond: oneshot::Sender<WorkOutcome>,
    pub tenant_id: String,
}

impl Request {
    pub fn new(tenant_id: &str) -> (Self, oneshot::Receiver<WorkOutcome>) {
        let (respond, outcome) = oneshot::channel();
        (
            Self {
                receive_time: Instant::now(),
                progress: Duration::ZERO,
                respond,
                tenant_id: tenant_id.to_string(),
            },
            outcome,
        )
    }
}

struct InnerQueue {
    fifo: VecDeque<Request>,
    /// True while the tenant has nothing staged on the main channel, meaning
    /// the next push must stage its head.
    loaded: bool,
}

struct RqMeta {
    rq: Request,
    tenant_id: String,
}

/// Bounded multi-tenant FIFO with approximately-fair round-robin egress.
///
/// Each tenant owns a bounded FIFO; at most one request per tenant is staged
/// on the shared main channel at any time, so draining the main channel
/// interleaves tenants while preserving FIFO order within each tenant.
pub struct TenantQueue {
    tenants: Mutex<HashMap<String, InnerQueue>>,
    main_tx: mpsc::Sender<RqMeta>,
    main_rx: tokio::sync::Mutex<mpsc::Receiver<RqMeta>>,
    max_queue_size: usize,
}

/// One staged entry per tenant means this only fills past 1024 concurrent
/// tenants; staging falls back to the tenant's own FIFO in that case.
const MAIN_CHANNEL_CAPACITY: usize = 1024;

impl TenantQueue {
    pub fn new(max_queue_size: usize) -> Self {
        let (main_tx, main_rx) = mpsc::channel(MAIN_CHANNEL_CAPACITY);
        Self {
            tenants: Mutex::new(HashMap::new()),
            main_tx,
            main_rx: tokio::sync::Mutex::new(main_rx),
            max_queue_size,
        }
    }

    /// Non-blocking enqueue. Returns whether the request was accepted and the
    /// depth of the tenant's FIFO afterwards; rejection means the tenant's
    /// queue is full.
    pub fn push(&self, tenant_id: &str, rq: Request) -> (bool, usize) {
        let mut tenants = self.tenants.lock().expect("tenant queue lock");
        let inner = tenants.entry(tenant_id.to_string()).or_insert_with(|| InnerQueue {
            fifo: VecDeque::with_capacity(self.max_queue_size),
            loaded: true,
        });

        if inner.fifo.len() >= self.max_queue_size {
            return (false, inner.fifo.len());
        }

        inner.fifo.push_back(rq);
        if inner.loaded {
            self.stage_next(inner, tenant_id);
        }
        (true, inner.fifo.len())
    }

    /// Waits for the next staged request. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Request> {
        let mut main_rx = self.main_rx.lock().await;
        let meta = tokio::select! {
            meta = main_rx.recv() => meta?,
            _ = cancel.cancelled() => return None,
        };
        drop(main_rx);

        let mut tenants = self.tenants.lock().expect("tenant queue lock");
        if let Some(inner) = tenants.get_mut(&meta.tenant_id) {
            if inner.fifo.is_empty() {
                inner.loaded = true;
            } else {
                self.stage_next(inner, &meta.tenant_id);
            }
        }
        Some(meta.rq)
    }

    /// Moves the head of the tenant's FIFO onto the main channel.
    fn stage_next(&self, inner: &mut InnerQueue, tenant_id: &str) {
        let rq = inner.fifo.pop_front().expect("staging from a non-empty fifo");
        match self.main_tx.try_send(RqMeta {
            rq,
            tenant_id: tenant_id.to_string(),
        }) {
            Ok(()) => inner.loaded = false,
            // Main channel full: keep the request at the head of its FIFO; a
            // later push re-stages it.
            Err(mpsc::error::TrySendError::Full(meta)) => {
                inner.fifo.push_front(meta.rq);
                inner.loaded = true;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => inner.loaded = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requests are told apart by their progress marker, the way the queue
    /// itself never inspects them.
    fn marked_request(tenant_id: &str, marker_secs: u64) -> Request {
        let (mut rq, _outcome) = Request::new(tenant_id);
        rq.progress = Duration::from_secs(marker_secs);
        rq
    }

    #[tokio::test]
    async fn staging_and_overload_with_capacity_one() {
        let queue = TenantQueue::new(1);
        let cancel = CancellationToken::new();

        // The first push is staged straight onto the main channel, so the
        // inner FIFO reports empty.
        let (accepted, size) = queue.push("t1", marked_request("t1", 1));
        assert!(accepted);
        assert_eq!(size, 0);

        let (accepted, size) = queue.push("t1", marked_request("t1", 2));
        assert!(accepted);
        assert_eq!(size, 1);

        // Capacity reached.
        let (accepted, size) = queue.push("t1", marked_request("t1", 3));
        assert!(!accepted);
        assert_eq!(size, 1);

        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.progress, Duration::from_secs(1));

        let (accepted, size) = queue.push("t1", marked_request("t1", 4));
        assert!(accepted);
        assert_eq!(size, 1);

        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.progress, Duration::from_secs(2));
        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.progress, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn egress_is_fair_across_tenants() {
        let queue = TenantQueue::new(1_000);
        let cancel = CancellationToken::new();

        for _ in 0..1_000 {
            let (accepted, _) = queue.push("t1", marked_request("t1", 1));
            assert!(accepted);
        }
        for _ in 0..100 {
            let (accepted, _) = queue.push("t2", marked_request("t2", 2));
            assert!(accepted);
        }

        let mut t1_count: i64 = 0;
        let mut t2_count: i64 = 0;
        for _ in 0..200 {
            match queue.pop(&cancel).await.unwrap().tenant_id.as_str() {
                "t1" => t1_count += 1,
                "t2" => t2_count += 1,
                other => panic!("unexpected tenant {other}"),
            }
        }

        // Round-robin staging keeps the split close to even despite t1
        // offering 10x the load.
        assert!((t1_count - t2_count).abs() < 10, "{t1_count} vs {t2_count}");
    }

    #[tokio::test]
    async fn fifo_order_within_a_tenant() {
        let queue = TenantQueue::new(100);
        let cancel = CancellationToken::new();

        for marker in 1..=10 {
            let (accepted, _) = queue.push("t1", marked_request("t1", marker));
            assert!(accepted);
        }

        for marker in 1..=10 {
            let popped = queue.pop(&cancel).await.unwrap();
            assert_eq!(popped.progress, Duration::from_secs(marker));
        }
    }

    #[tokio::test]
    async fn retains_pushes_minus_pops() {
        let queue = TenantQueue::new(100);
        let cancel = CancellationToken::new();

        for marker in 0..20 {
            queue.push("t1", marked_request("t1", marker));
        }
        for _ in 0..5 {
            queue.pop(&cancel).await.unwrap();
        }

        let mut remaining = 0;
        while tokio::time::timeout(Duration::from_millis(20), queue.pop(&cancel))
            .await
            .ok()
            .flatten()
            .is_some()
        {
            remaining += 1;
        }
        assert_eq!(remaining, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_returns_once_cancelled() {
        let queue = std::sync::Arc::new(TenantQueue::new(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(waiter.await.unwrap().is_none());
    }
}
