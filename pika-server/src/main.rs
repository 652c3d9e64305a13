//! Binary entrypoint for `pika-server`.

mod admin;
mod app;
mod commands;
mod logging;
mod network;
mod replication;
mod tasks;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pika_common::config::ServerConfig;

/// Redis-protocol key-value server with binlog replication.
#[derive(Debug, Parser)]
#[command(name = "pika-server", version)]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(short = 'D', long = "conf")]
    conf: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_file(&cli.conf)
        .with_context(|| format!("load configuration {}", cli.conf.display()))?;
    logging::init(&config.log_level);

    let server = app::Server::bind(config).context("failed to start pika-server")?;
    tracing::info!(
        client = %server.client_addr()?,
        replication = %server.replication_addr()?,
        "pika-server listening"
    );
    server.run().context("pika-server stopped with an error")
}
