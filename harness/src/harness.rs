use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use client::{Client, HttpTransport};
use server::Server;
use stats::Stats;

use crate::cfg::SimulationConfig;

/// Delay between launching servers and launching clients, giving listeners
/// time to start accepting.
const SERVER_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// One simulation run: builds the stats manager, servers, and clients from
/// the config, runs them to the simulation deadline (or Ctrl-C), then dumps
/// the collected series to disk.
pub struct Simulation {
    config: SimulationConfig,
    stats: Stats,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            stats: Stats::new(),
        }
    }

    pub async fn run(self, data_dir: &Path) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();

        // External cancellation: the first Ctrl-C stops the simulation early
        // but still flushes stats.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping simulation");
                    cancel.cancel();
                }
            });
        }

        let sampler = self
            .stats
            .start_sampling(stats::DEFAULT_SAMPLE_PERIOD, cancel.child_token());

        // Bind every listener before any traffic starts; a bad listen port
        // fails the whole run here.
        let mut servers = Vec::with_capacity(self.config.servers.len());
        for server_config in &self.config.servers {
            servers.push(Server::bind(server_config.clone(), self.stats.clone()).await?);
        }

        let deadline = self.simulation_deadline();

        let mut server_tasks = Vec::with_capacity(servers.len());
        for server in servers {
            server_tasks.push(tokio::spawn(server.run(cancel.child_token())));
        }

        tokio::time::sleep(SERVER_SETTLE_DELAY).await;

        let mut client_tasks = Vec::with_capacity(self.config.clients.len());
        for client_config in self.config.clients.clone() {
            let transport = HttpTransport::new(&client_config.target, client_config.request_timeout)?;
            let workload_client = Arc::new(Client::new(
                client_config,
                self.stats.clone(),
                transport,
            ));
            client_tasks.push(tokio::spawn(workload_client.run(cancel.child_token())));
        }

        info!(deadline = ?deadline, "simulation running");
        tokio::select! {
            _ = tokio::time::sleep(deadline) => info!("simulation deadline reached"),
            _ = cancel.cancelled() => {}
        }
        cancel.cancel();

        for task in client_tasks {
            let _ = task.await;
        }
        for task in server_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "server exited with error"),
                Err(e) => warn!(error = %e, "server task panicked"),
            }
        }

        let _ = sampler.await;
        self.stats
            .dump_to_folder(data_dir)
            .context("failed to dump stats")?;
        self.stats.print_summary();
        info!(dir = %data_dir.display(), "stats written");
        Ok(())
    }

    /// The longest schedule across every client workload and server profile.
    fn simulation_deadline(&self) -> Duration {
        self.config
            .clients
            .iter()
            .map(|client| client.total_workload_duration())
            .chain(
                self.config
                    .servers
                    .iter()
                    .map(|server| server.total_profile_duration()),
            )
            .max()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end smoke run: one client against one server on a fixed local
    /// port, short schedule, CSVs dumped and the success series populated.
    #[tokio::test(flavor = "multi_thread")]
    async fn simulation_runs_to_completion_and_dumps_stats() {
        let yaml = "
clients:
  - workload:
      - rps: 50
        duration: 1s
    rq_timeout: 500ms
    target_server:
      address: 127.0.0.1
      port: 29431
    retry_count: 0
    tenant_id: t1
servers:
  - profile:
      - duration: 1500ms
        latency_distribution:
          - weight: 1
            latency: 1ms
    listen_port: 29431
    threads: 4
    max_queue_size: 256
    enable_isolation: true
";
        let config = SimulationConfig::from_yaml(yaml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        let started = std::time::Instant::now();
        Simulation::new(config).run(&data_dir).await.unwrap();

        // Deadline is 1.5s; the run should not overshoot it by much.
        assert!(started.elapsed() < Duration::from_secs(4));

        let successes =
            std::fs::read_to_string(data_dir.join("client.rq.success.count.t1.csv")).unwrap();
        let total: f64 = successes
            .lines()
            .map(|line| line.split_once(',').unwrap().1.parse::<f64>().unwrap())
            .sum();
        assert!(total > 0.0, "no successful requests recorded");

        assert!(data_dir.join("client.rq.total.count.t1.csv").exists());
        assert!(data_dir.join("server.queue_size.t1.csv").exists());
        assert!(data_dir.join("client.rq.latency.t1.csv").exists());
    }
}
