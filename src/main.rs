use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use webserv::config;
use webserv::server::{self, Server};

#[derive(Parser)]
#[command(name = "webserv", version, about = "Event-driven HTTP/1.1 server with CGI and uploads")]
struct Cli {
    /// Configuration file (nginx-flavoured).
    #[arg(default_value = "config/default.conf")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = config::parse_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    server::install_signal_handlers().context("installing signal handlers")?;

    let mut server = Server::new(config).context("creating the event loop")?;
    server.bind().context("binding listeners")?;
    server.run().context("event loop failed")?;
    Ok(())
}
