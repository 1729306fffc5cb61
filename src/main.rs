//! # Line echo server
//!
//! Runs a [`Server`] with the [`EchoHandler`], configured from the
//! environment (see [`Settings`]). Ctrl-C stops accepting connections and
//! waits for every connected client to finish before exiting.
//!
//! ## Dependencies
//! - `tokio` for asynchronous runtime
//! - `tokio-rustls` for TLS support
//! - `dotenv` for environment configuration
//! - `tracing` for logging

use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use session_server::config::Settings;
use session_server::server::{EchoHandler, Server};

/// Entry point for the echo server.
///
/// # Errors
/// Returns an error if configuration validation fails, the server fails to
/// bind, or the accept loop fails.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    settings.validate()?;

    let mut server = Server::new();
    server.handle(EchoHandler)?;
    server.set_read_timeout(settings.read_timeout());
    server.set_write_timeout(settings.write_timeout());
    let tls = settings.create_tls_config()?;
    let use_tls = tls.is_some();
    if let Some(tls) = tls {
        server.set_tls_config(tls);
    }
    let server = Arc::new(server);

    let listener = TcpListener::bind(&settings.bind_address).await?;
    info!("Server listening on {}", settings.bind_address);

    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            if use_tls {
                server.serve_tls(listener).await
            } else {
                server.serve(listener).await
            }
        }
    });

    // Handle the accept loop ending on its own or a shutdown signal
    tokio::select! {
        res = &mut serving => {
            res??;
        }
        _ = shutdown_signal() => {
            info!("Shutting down gracefully");
            server.stop().await?;
            serving.await??;
        }
    }

    Ok(())
}

/// Resolves when the process receives Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
