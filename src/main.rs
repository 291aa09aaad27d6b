use anyhow::Result;
use clap::Parser;
use lab_client::cli::{Cli, CliHandler};
use lab_client::config::ClientConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(ClientConfig::default_path);
    let mut config = match &config_path {
        Some(path) => ClientConfig::load_from_file(path).await?,
        None => ClientConfig::default(),
    };
    cli.apply_overrides(&mut config);
    config.validate()?;

    // Logs go to stderr so stdout carries only results
    let log_level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(log_level)
        .init();

    let handler = CliHandler::new(config, config_path)?;
    handler.handle(cli.command).await
}
