use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Missing file falls back to the defaults
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    /// Overrides `listen_addr` from the config file
    #[arg(short, long)]
    pub listen: Option<String>,
}
