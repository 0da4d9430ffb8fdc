use std::path::PathBuf;

use clap::Parser;
use psti::server::config::ServerConfig;
use psti::server::crypto::MasterKey;

/// Serve the psti paste API.
#[derive(Parser, Debug)]
#[command(author, version = env!("PSTI_VERSION"), about)]
struct Args {
    /// TOML config file. `PSTI_*` environment variables override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print a freshly generated master key (hex) and exit.
    #[arg(long)]
    generate_key: bool,
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.generate_key {
        println!("{}", MasterKey::generate().to_hex());
        return Ok(());
    }

    let config = ServerConfig::load(args.config.as_deref())?;
    log::debug!("effective configuration: {config:?}");
    psti::server::launch(config).await
}
