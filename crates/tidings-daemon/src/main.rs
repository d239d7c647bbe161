//! # tidings-daemon
//!
//! Runs the dispatcher against a transport daemon listening on a Unix socket
//! and prints every dispatcher event to stdout as one JSON object per line.

mod config;

use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidings_client::spawn_dispatcher;
use tidings_net::spawn_rpc_client;
use tidings_shared::constants::APP_NAME;
use tidings_store::{ChatroomFile, ChatroomStore};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tidings_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting {} daemon v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = DaemonConfig::from_env();
    info!(?config, "Loaded configuration");

    let store: Option<Box<dyn ChatroomStore>> = match &config.dispatcher.chatrooms_path {
        Some(path) => Some(Box::new(ChatroomFile::new(path.clone()))),
        None => match ChatroomFile::open_default() {
            Ok(file) => {
                info!(path = %file.path().display(), "Using chatrooms file");
                Some(Box::new(file))
            }
            Err(e) => {
                warn!(error = %e, "No chatrooms file, favourites will not persist");
                None
            }
        },
    };

    // -----------------------------------------------------------------------
    // 3. Connect to the transport and start the dispatcher
    // -----------------------------------------------------------------------
    let stream = UnixStream::connect(&config.socket_path).await?;
    info!(socket = %config.socket_path.display(), "Connected to transport daemon");
    let (reader, writer) = stream.into_split();
    let (transport, notifications) = spawn_rpc_client(reader, writer, config.rpc());

    let (handle, task) = spawn_dispatcher(
        Arc::new(transport.clone()),
        notifications,
        config.dispatcher.clone(),
        store,
    );
    let mut events = handle.subscribe();

    // -----------------------------------------------------------------------
    // 4. Print events until interrupted
    // -----------------------------------------------------------------------
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "Failed to encode event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event printer lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Dispatcher already stopped");
    }
    task.await?;
    transport.shutdown().await;
    info!("Tidings daemon stopped");
    Ok(())
}
