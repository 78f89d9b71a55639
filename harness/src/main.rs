use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cfg;
mod harness;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Path to the simulation config file.
    #[arg(long)]
    config: PathBuf,
    /// Directory the stats CSVs are written to. Wiped on every run.
    #[arg(long = "data_dir", default_value = "bufferbloater_data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = cfg::SimulationConfig::from_file(&args.config)?;
    harness::Simulation::new(config).run(&args.data_dir).await
}
