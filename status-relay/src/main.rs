//! Status relay binary.
//!
//! ```bash
//! status-relay --addr 0.0.0.0:8000
//! RUST_LOG=status_relay=debug status-relay
//! ```

use std::time::Duration;

use clap::Parser;
use status_relay::{RelayError, RelayServer, ServerConfig};

/// Real-time presence and typing-status relay
#[derive(Parser, Debug)]
#[command(name = "status-relay")]
#[command(version)]
struct Args {
    /// Address and port to bind to
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    addr: String,

    /// Milliseconds to wait for connections to close on shutdown
    #[arg(long, default_value = "2000")]
    drain_timeout_ms: u64,

    /// Frames buffered per connection before a slow client is dropped
    #[arg(long, default_value = "256")]
    outbound_capacity: usize,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    log::info!("Starting status relay v{}", env!("CARGO_PKG_VERSION"));

    let server = RelayServer::new(ServerConfig {
        bind_addr: args.addr,
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        outbound_capacity: args.outbound_capacity,
    });

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
