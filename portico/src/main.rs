use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{assembly::Assembly, config::DeploymentConfig};

mod assembly;
mod config;
mod demo;

const TERMINATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the deployment file (TOML or JSON)
    #[clap(short, long, value_parser)]
    config: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = DeploymentConfig::load(&args.config)?;
    tracing::info!(
        "deploying {} component(s) on {} host(s)",
        config.components.len(),
        config.hosts.len()
    );

    let factories = demo::factories()?;
    let mut assembly = Assembly::build(&config, &factories)?;
    if let Err(e) = assembly.start(&config.connections) {
        tracing::error!("deployment failed: {e:#}");
        assembly.stop(TERMINATION_TIMEOUT);
        return Err(e);
    }
    let handles = assembly.execute()?;
    std::thread::sleep(config.run_for());
    assembly::collect(handles, TERMINATION_TIMEOUT);

    assembly.log_summary();
    let terminated = assembly.stop(TERMINATION_TIMEOUT);
    tracing::info!(
        "deployment {}",
        if terminated { "terminated" } else { "left pools running" }
    );
    Ok(())
}
