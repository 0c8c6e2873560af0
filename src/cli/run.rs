use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Context;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::Args;
use crate::config::AppConfig;
use crate::mqtt::broker::{Broker, Shared};
use crate::shutdown::Cleaners;
use crate::store::{self, DocumentStore, FileStore};

/// Bounded wait for in-flight connections after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn main(args: Args) -> crate::Result<()> {
    // Config is read before the runtime (and before logging) exists so a
    // missing or broken file fails fast with a plain diagnostic.
    let config = AppConfig::load(&args.config)?;

    crate::bootstrap(args.log, config.debug_mode)?;

    main_async(config)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`, and it can accept args
#[tokio::main]
async fn main_async(config: AppConfig) -> crate::Result<()> {
    tracing::info!(app_name = %config.app_name, "starting broker");

    let store: Arc<dyn DocumentStore> = Arc::new(
        FileStore::open(&config.database.database)
            .await
            .wrap_err("error opening the document store")?,
    );

    store::initialize(&store)
        .await
        .wrap_err("error preparing store collections and indexes")?;

    let cleaners = Cleaners::new();
    let store_for_close = Arc::clone(&store);
    cleaners.register("document store", move || async move {
        store_for_close
            .close()
            .await
            .wrap_err("error closing the document store")
    });

    let shared = Arc::new(Shared::new(store, config.operation_timeout()));

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.app_port));
    let mut broker = Broker::bind(listen_addr, Arc::clone(&shared)).await?;

    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("error installing SIGTERM handler")?;

    tokio::select! {
        res = broker.run() => {
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res.wrap_err("error from ctrl_c() handler")?;
            tracing::info!("SIGINT received; shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received; shutting down");
        }
    }

    tracing::info!(
        connections = broker.connections(),
        "waiting for connections to close"
    );

    broker.shutdown(SHUTDOWN_GRACE).await?;

    cleaners.run().await;

    tracing::info!("shutdown complete");

    Ok(())
}
