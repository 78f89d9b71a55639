use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use client::{ClientConfig, Target, WorkloadStage};
use server::{LatencySegment, ServerConfig, TokenBucketConfig, WeightedLatency};

/// Typed, validated configuration for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub clients: Vec<ClientConfig>,
    pub servers: Vec<ServerConfig>,
}

impl SimulationConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(data).context("failed to parse config yaml")?;

        let clients = raw
            .clients
            .into_iter()
            .map(client_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let servers = raw
            .servers
            .into_iter()
            .map(server_config)
            .collect::<anyhow::Result<Vec<_>>>()?;

        if clients.is_empty() && servers.is_empty() {
            bail!("config declares neither clients nor servers");
        }
        Ok(Self { clients, servers })
    }
}

// Raw deserialization targets. Duration fields carry `humantime` suffixes
// (`500us`, `100ms`, `20s`); unknown keys are rejected everywhere.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    clients: Vec<RawClient>,
    #[serde(default)]
    servers: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClient {
    workload: Vec<RawStage>,
    #[serde(with = "humantime_serde")]
    rq_timeout: Duration,
    target_server: RawTarget,
    #[serde(default)]
    retry_count: u32,
    #[serde(default = "default_label")]
    tenant_id: String,
    #[serde(default = "default_label")]
    priority: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    rps: u32,
    #[serde(with = "humantime_serde")]
    duration: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    address: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    profile: Vec<RawSegment>,
    listen_port: u16,
    threads: usize,
    max_queue_size: usize,
    #[serde(default, with = "humantime_serde")]
    queue_timeout: Duration,
    #[serde(default)]
    enable_isolation: bool,
    #[serde(default)]
    admission: Option<RawTokenBucket>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSegment {
    #[serde(with = "humantime_serde")]
    duration: Duration,
    latency_distribution: Vec<RawWeighted>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWeighted {
    weight: u32,
    #[serde(with = "humantime_serde")]
    latency: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTokenBucket {
    #[serde(with = "humantime_serde")]
    interval: Duration,
    max_tokens: u64,
    refresh_amount: u64,
}

fn default_label() -> String {
    "default".to_string()
}

fn client_config(raw: RawClient) -> anyhow::Result<ClientConfig> {
    if raw.workload.is_empty() {
        bail!("client workload must not be empty");
    }
    let mut workload = Vec::with_capacity(raw.workload.len());
    for stage in &raw.workload {
        if stage.rps == 0 {
            bail!("workload stage rps must be positive");
        }
        workload.push(WorkloadStage {
            rps: stage.rps,
            duration: stage.duration,
        });
    }
    if raw.rq_timeout.is_zero() {
        bail!("rq_timeout must be positive");
    }

    Ok(ClientConfig {
        workload,
        request_timeout: raw.rq_timeout,
        target: Target {
            address: raw.target_server.address,
            port: raw.target_server.port,
        },
        retry_count: raw.retry_count,
        tenant_id: raw.tenant_id,
        priority: raw.priority,
    })
}

fn server_config(raw: RawServer) -> anyhow::Result<ServerConfig> {
    if raw.profile.is_empty() {
        bail!("server profile must not be empty");
    }
    if raw.threads == 0 {
        bail!("server threads must be positive");
    }
    if raw.max_queue_size == 0 {
        bail!("max_queue_size must be positive");
    }

    let profile = raw
        .profile
        .into_iter()
        .map(|segment| {
            let distribution = segment
                .latency_distribution
                .iter()
                .map(|entry| WeightedLatency {
                    weight: entry.weight,
                    latency: entry.latency,
                })
                .collect();
            LatencySegment::new(distribution, segment.duration)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let admission = raw
        .admission
        .map(|bucket| TokenBucketConfig::new(bucket.interval, bucket.max_tokens, bucket.refresh_amount))
        .transpose()?;

    Ok(ServerConfig {
        profile,
        listen_port: raw.listen_port,
        threads: raw.threads,
        max_queue_size: raw.max_queue_size,
        queue_timeout: raw.queue_timeout,
        enable_isolation: raw.enable_isolation,
        admission,
    })
}
