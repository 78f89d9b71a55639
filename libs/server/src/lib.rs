//! The simulated service under test: a multi-tenant fair-share work queue
//! under a finite worker pool, token-bucket admission, and a time-varying
//! service-latency model, all behind an HTTP ingress.

mod config;
mod latency;
mod server;
mod tenant_queue;
mod token_bucket;

pub use config::{LatencySegment, ServerConfig, TokenBucketConfig, WeightedLatency};
pub use latency::LatencyProfile;
pub use server::Server;
pub use tenant_queue::{Request, TenantQueue, WorkOutcome};
pub use token_bucket::TokenBucket;
