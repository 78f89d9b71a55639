//! Stage-driven synthetic workload generator: a pool of paced, jittered
//! emitters offering a configured request rate against a target server, with
//! the transport pluggable behind a trait.

mod client;
mod config;
mod transport;

pub use client::Client;
pub use config::{ClientConfig, Target, WorkloadStage};
pub use transport::{HttpTransport, Reply, Transport};
