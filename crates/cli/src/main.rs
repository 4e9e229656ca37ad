mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging (stderr, so generated text on stdout stays clean)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,llama_bridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Info { model } => cli::info::execute(model).await,
        cli::Commands::Complete(a) => cli::complete::execute(args.global, a).await,
        cli::Commands::Chat(a) => cli::chat::execute(args.global, a).await,
        cli::Commands::Format(a) => cli::format::execute(args.global, a).await,
        cli::Commands::Config(c) => cli::config_cmd::execute(c).await,
    }
}
