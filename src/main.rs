use anyhow::Result;
use clap::Parser;
use log::info;

use photo_archive::api::setup_server;
use photo_archive::archive::config::Config;
use photo_archive::archive::logger::setup_logger;
use photo_archive::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    setup_logger(config.log_file.as_deref(), &config.log_level)?;
    info!("Using config {}", args.config);

    setup_server(config).await
}
