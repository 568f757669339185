use std::{process, sync::Arc, time::Duration};

use respcache::{
    cache::{CacheMaintenance, CacheStore, CycleIntervals, MemoryStore, ResponseCache},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState},
        telemetry,
    },
};
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, debug, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let memory = Arc::new(MemoryStore::new());
    let sweeper = spawn_expiry_sweep(Arc::clone(&memory), settings.scheduler.warm_interval);
    let store: Arc<dyn CacheStore> = memory;
    let cache = Arc::new(ResponseCache::new(settings.cache.clone(), store));
    let maintenance = Arc::new(CacheMaintenance::new(cache));
    maintenance.load_weights();

    let scheduler = maintenance.spawn(CycleIntervals {
        warm: settings.scheduler.warm_interval,
        tune: settings.scheduler.tune_interval,
    });

    let result = serve_admin(&settings, AdminState::new(maintenance)).await;

    scheduler.shutdown(settings.server.graceful_shutdown).await;
    sweeper.abort();
    let _ = sweeper.await;
    result
}

/// Drop expired in-memory entries that were never read again.
fn spawn_expiry_sweep(store: Arc<MemoryStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, "expired cache entries purged");
            }
        }
    })
}

async fn serve_admin(settings: &config::Settings, state: AdminState) -> Result<(), InfraError> {
    let router = http::build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;
    info!(address = %settings.server.admin_addr, "admin listener ready");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| InfraError::server(format!("admin server error: {err}")))?;

    info!("admin listener stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received, stopping gracefully"),
        Err(err) => error!(error = %err, "failed to install ctrl-c handler"),
    }
}
