//! PLC polling service (`plcsrv`)
//!
//! Runs the polling core against the in-memory PLC until Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use plcsrv::bootstrap::{self, Args};
use plcsrv::transport::{S7Transport, SimulatedPlc};
use plcsrv::{Catalog, PlcRuntime, Update};

/// Interval between simulated crane movements
const MOTION_STEP: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = bootstrap::load_configuration(&args)?;
    if args.print_config {
        print!("{}", bootstrap::render_configuration(&config)?);
        return Ok(());
    }
    bootstrap::initialize_logging(&args, &config.logging)?;

    let catalog = Arc::new(Catalog::builtin()?);
    bootstrap::validate_configuration(&config, &catalog)?;

    // Validation mode: validate and exit
    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let plc = SimulatedPlc::seeded(&catalog);
    let factory = {
        let plc = plc.clone();
        move |_endpoint: &str| -> Box<dyn S7Transport> { Box::new(plc.clone()) }
    };
    let runtime = PlcRuntime::start(&config, Arc::clone(&catalog), &factory).await?;

    let subscriptions: Vec<_> = config
        .devices
        .iter()
        .map(|device| runtime.broadcaster().subscribe(device.id.clone(), log_update))
        .collect();

    if args.simulate_motion {
        let shutdown = runtime.shutdown_token();
        let catalog = Arc::clone(&catalog);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MOTION_STEP);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => plc.step(&catalog),
                }
            }
        });
        info!("Simulated crane motion enabled");
    }

    info!("plcsrv running, press Ctrl+C to stop");
    let shutdown = runtime.shutdown_token();
    common::shutdown::cancel_on_shutdown(shutdown.clone());
    shutdown.cancelled().await;

    for handle in &subscriptions {
        runtime.broadcaster().unsubscribe(handle);
    }
    runtime.shutdown().await;
    Ok(())
}

fn log_update(update: Update) {
    let record = serde_json::to_string(&update.record).unwrap_or_default();
    debug!("{} #{}: {}", update.device, update.sequence, record);
}
