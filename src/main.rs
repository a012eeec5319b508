// src/main.rs
use clap::Parser;
use tracing::{error, info};

use arclight::{logging, Server};

/// Multi-core epoll TCP server answering every request with a fixed HTTP
/// response.
#[derive(Debug, Parser)]
#[command(name = "arclight", version)]
struct Config {
    /// Port to listen on
    #[arg(short, long, default_value = "8080", env = "ARCLIGHT_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "ARCLIGHT_HOST")]
    host: String,

    /// Worker threads; 0 means one per available CPU
    #[arg(short, long, default_value = "0", env = "ARCLIGHT_WORKERS")]
    workers: usize,

    /// Connection ceiling per worker
    #[arg(long, default_value = "1024", env = "ARCLIGHT_MAX_CONNECTIONS")]
    max_connections: usize,
}

fn main() {
    logging::init();
    let config = Config::parse();

    let mut server = Server::bind(&format!("{}:{}", config.host, config.port))
        .max_connections(config.max_connections);
    if config.workers > 0 {
        server = server.workers(config.workers);
    }

    info!(host = %config.host, port = config.port, "arclight starting");

    if let Err(e) = server.serve() {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
