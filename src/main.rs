use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sluice::server::{Server, ServerConfig};

/// Caching HTTP/1.x forward proxy.
#[derive(Parser)]
#[command(name = "sluice", version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Number of resolver worker threads
    #[arg(long, default_value_t = 4)]
    resolver_threads: usize,

    /// Seconds a connection may stay idle before being torn down
    #[arg(long, default_value_t = 120)]
    idle_timeout_secs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        resolver_workers: args.resolver_threads,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
    };

    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let mut server = Server::bind(address, config)?;
    info!("sluice {} starting", env!("CARGO_PKG_VERSION"));
    server.run()?;
    Ok(())
}
