use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aws_messaging_local::observer::RecentOperations;
use aws_messaging_local::sqs::expiry::spawn_visibility_sweeper;
use aws_messaging_local::{sns, sqs, Args, Bus, BusConfig, SystemClock};

const RECENT_OPERATIONS: usize = 200;

async fn disposed(mut signal: watch::Receiver<bool>) {
    let _ = signal.wait_for(|done| *done).await;
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bus = Arc::new(
        Bus::new(BusConfig::from(&args), Arc::new(SystemClock))
            .with_observer(Arc::new(RecentOperations::new(RECENT_OPERATIONS))),
    );
    let sweeper = spawn_visibility_sweeper(&bus);

    let sqs_listener = TcpListener::bind(("0.0.0.0", args.sqs_port)).await?;
    let sns_listener = TcpListener::bind(("0.0.0.0", args.sns_port)).await?;
    info!(
        port = args.sqs_port,
        endpoint = %bus.config().sqs_endpoint,
        "sqs listening"
    );
    info!(
        port = args.sns_port,
        endpoint = %bus.config().sns_endpoint,
        "sns listening"
    );

    tokio::spawn({
        let bus = bus.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                bus.dispose();
            }
        }
    });

    let sqs_server = axum::serve(sqs_listener, sqs::server::create_router(bus.clone()))
        .with_graceful_shutdown(disposed(bus.shutdown_signal()));
    let sns_server = axum::serve(sns_listener, sns::server::create_router(bus.clone()))
        .with_graceful_shutdown(disposed(bus.shutdown_signal()));
    tokio::try_join!(async { sqs_server.await }, async { sns_server.await })?;

    let _ = sweeper.await;
    info!("stopped");
    Ok(())
}
