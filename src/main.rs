#![deny(warnings)]

use std::time::Duration;

use handler::{AppState, build_router};
use metrics::MetricsRegistry;
use scrape_target::{new_server, wait_signal};

mod handler;
mod metrics;
type DynError = Box<dyn std::error::Error + Send + Sync>;

/// The port scrape configs point at. Deliberately not configurable.
const PORT: u16 = 3000;

#[tokio::main]
pub async fn main() -> Result<(), DynError> {
    init_log()?;

    let mut metrics = MetricsRegistry::new();
    handler::register_app_counters(&mut metrics)?;
    metrics.start_process_tracking();

    let (server, shutdown_tx) = new_server(PORT, build_router(AppState { metrics }));
    tokio::spawn(async move {
        if let Err(err) = wait_signal().await {
            log::warn!("listening for shutdown signals failed: {err}");
        }
        let _ = shutdown_tx.send(()).await;
    });
    log::info!("serving on http://localhost:{PORT}");
    server.with_timeout(Duration::from_secs(120)).run().await?;
    Ok(())
}

// the tracing pipeline wins when both logging backends are compiled in
#[cfg(feature = "use_tracing_subscriber")]
fn init_log() -> Result<(), DynError> {
    scrape_target::init_log::tracing::init(env!("CARGO_CRATE_NAME"))
}

#[cfg(all(feature = "use_env_logger", not(feature = "use_tracing_subscriber")))]
fn init_log() -> Result<(), DynError> {
    scrape_target::init_log::env_logger::init();
    Ok(())
}

#[cfg(not(any(feature = "use_tracing_subscriber", feature = "use_env_logger")))]
fn init_log() -> Result<(), DynError> {
    Ok(())
}
