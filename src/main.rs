// navsync - Main Entry Point
// Licensed under AGPL v3

use clap::Parser;
use navsync::case_store::JsonCaseStore;
use navsync::config::{Command, Config, FollowArgs, ServeArgs};
use navsync::navigation::{LoggingViewportAdapter, NavigationController, NavigationMode, NavigationState};
use navsync::net::simulator::TrackingSimulator;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    init_logging(config.verbose);

    match config.command {
        Command::Serve(args) => serve(args).await,
        Command::Follow(args) => follow(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting tracking simulator");
    let simulator = TrackingSimulator::start(args.simulator_config()).await?;
    eprintln!(
        "Tracking simulator: handshake on {}, stream on {}",
        simulator.handshake_addr(),
        simulator.stream_addr()
    );

    wait_for_shutdown().await?;

    info!("Shutting down...");
    simulator.shutdown();
    Ok(())
}

async fn follow(args: FollowArgs) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting navigation");
    let adapter = Arc::new(LoggingViewportAdapter::orthogonal());
    let controller = Arc::new(NavigationController::new(args.navigation_config(), adapter));

    for tool in &args.tools {
        for viewport in &args.viewports {
            controller.bind_viewport(tool, viewport);
        }
    }

    // A missing or broken case transform is not fatal: navigation runs untransformed
    if let Some(dir) = &args.case_dir {
        let store = JsonCaseStore::new(dir.clone());
        if controller.load_transformation_from_case(&store, &args.case_id).await.is_err() {
            warn!(case_id = %args.case_id, "Continuing with identity transform");
        }
    }

    let mode = match args.rehearsal {
        Some(motion) => NavigationMode::Rehearsal(motion),
        None => NavigationMode::Live,
    };
    if let Err(e) = controller.start_navigation(mode).await {
        error!("Failed to start navigation: {}", e);
        return Err(e.into());
    }

    // Periodic status log
    if args.status_interval > 0 {
        let status_controller = controller.clone();
        let period = Duration::from_secs(args.status_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let status = status_controller.get_status();
                info!(
                    state = ?status.state,
                    updates = status.update_count,
                    actual_rate_hz = %format!("{:.1}", status.actual_rate_hz),
                    emitted_rate_hz = %format!("{:.1}", status.emitted_rate_hz),
                    transform_loaded = status.transform.loaded,
                    "Navigation status"
                );
                if status.state == NavigationState::Error {
                    warn!(
                        error = status.last_error.as_deref().unwrap_or("unknown"),
                        "Navigation halted; restart to reconnect"
                    );
                }
            }
        });
    }

    wait_for_shutdown().await?;

    info!("Shutting down...");
    controller.stop_navigation();
    let stats = controller.client_stats();
    info!(
        "Navigation stopped. Ticks received: {}, malformed dropped: {}",
        stats.ticks_received, stats.malformed_dropped
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C)
async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
            Ok(())
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            Err(err.into())
        }
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
