mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,filemagic=info";
const DEBUG_FILTER: &str = "warn,filemagic=debug,magic_core=trace,magic_rules=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    //  Logging
    let fallback = if args.identify.debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Some(cli::Commands::Compile(a)) => cli::db::compile(a).await,
        Some(cli::Commands::Check(a)) => cli::db::check(a).await,
        Some(cli::Commands::List(a)) => cli::db::list(a).await,
        Some(cli::Commands::Path) => cli::db::path().await,
        Some(cli::Commands::Config(a)) => cli::config_cmd::execute(a).await,
        None => cli::identify::execute(args.identify).await,
    }
}
