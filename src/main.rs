//! tcp-conn-core: demo echo server
//!
//! Serves length-prefixed packets and echoes each one back to its sender.
//! With `--connect` the same process also opens a client connection that
//! sends a numbered greeting on every tick.
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod echo;

use config::Config;
use echo::EchoAgent;
use std::sync::Arc;
use tcp_conn_core::{LengthPrefixed, Protocol, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_packet_size = config.max_packet_size,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        write_timeout_ms = config.write_timeout.as_millis() as u64,
        "Starting tcp-conn-core server"
    );

    let protocol: Arc<dyn Protocol> =
        Arc::new(LengthPrefixed::with_max_packet_size(config.max_packet_size));
    let server = Server::new(config.listen.clone(), Arc::new(EchoAgent::server()), protocol);
    server.set_read_deadline(config.read_timeout);
    server.set_write_deadline(config.write_timeout);
    server.listen_and_serve().await?;

    if let Some(addr) = &config.connect {
        let conn = server
            .connect(addr, Some(Arc::new(EchoAgent::client())), None)
            .await?;
        info!(peer = %conn.peer_addr(), "Client connected");
        tokio::spawn(echo::greet(conn, config.interval));
    }

    tokio::select! {
        result = server.wait() => {
            if let Err(e) = result {
                error!(error = %e, "Server stopped");
                server.close();
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    server.close();
    Ok(())
}
