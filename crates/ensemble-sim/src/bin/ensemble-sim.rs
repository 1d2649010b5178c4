//! Ensemble formation simulator
//!
//! Boot an ensemble on the in-memory interconnect and write each node's
//! transfer map.
//!
//! Usage: `ensemble-sim [size] [start-offset]`
//!
//! Environment:
//! - `ENSEMBLE_CONFIG`: JSON ensemble definition (overrides `size`)
//! - `ENSEMBLE_OUT_DIR`: output directory (default `./ensemble-out`)

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use ensemble_router::EnsembleConfig;
use ensemble_sim::{rotated_order, Simulation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ensemble_sim=info,ensemble_router=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let ensemble = match env::var("ENSEMBLE_CONFIG") {
        Ok(path) => EnsembleConfig::from_path(&path)?,
        Err(_) => {
            let size: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
            EnsembleConfig::synthetic(size)
        }
    };
    let offset: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let out_dir = PathBuf::from(
        env::var("ENSEMBLE_OUT_DIR").unwrap_or_else(|_| "./ensemble-out".to_string()),
    );

    println!("Ensemble formation simulator");
    println!("============================");
    println!();
    println!(
        "Booting {} nodes ({:?} topology), start offset {}...",
        ensemble.size(),
        ensemble.resolved_topology(),
        offset
    );

    let size = ensemble.size();
    let mut sim = Simulation::new(ensemble)?;
    let steps = sim.boot(&rotated_order(size, offset))?;

    println!();
    println!("Simulation complete:");
    println!("  Events: {steps}");
    for router in sim.routers() {
        println!("  rank {:>2}: {}", router.rank(), router.phase());
    }

    let written = sim.write_transfer_maps(&out_dir)?;
    sim.write_trace(&out_dir.join("trace.json"))?;
    println!();
    println!(
        "Wrote {} transfer maps to {}",
        written.len(),
        out_dir.display()
    );

    Ok(sim.all_ready())
}
