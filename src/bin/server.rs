//! forja server entry point.
//!
//! Parses the command line, registers the built-in factories, wires
//! the status page onto the main transport and runs until ctrl-c.

use anyhow::Context;
use clap::Parser;
use forja::transport::{transports, TransportConfig};
use forja::{status, DEFAULT_HOST, DEFAULT_PORT};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    status::mark_started();

    let config = TransportConfig::new("main").acceptor(cli.host.clone(), cli.port);
    let transport = transports()
        .add(&config)
        .context("failed to register main transport")?;
    status::bind(&transport, &cli.status_uri).context("failed to bind status uri")?;

    transport
        .enable()
        .await
        .context("failed to enable main transport")?;
    info!(host = %cli.host, port = cli.port, status = %cli.status_uri, "forja up");

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    transport.disable_and_drain().await;

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(name = "forja-server", version, author, about = "An application server")]
struct Cli {
    /// Address to listen on.
    #[clap(long, default_value = DEFAULT_HOST)]
    host: String,
    /// Port to listen on.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Where the status page is served.
    #[clap(long, default_value = "/status")]
    status_uri: String,
}
